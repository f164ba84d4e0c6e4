//! db-block-sim - composable database-internals simulator
//!
//! Storage engines, index structures, buffer pools, concurrency-control
//! protocols and query operators are modeled as independent blocks with typed
//! ports. A design is wired into a [`DraftGraph`], validated, compiled into an
//! [`ExecutionPlan`] and driven by a synthetic [`Workload`]. Every block emits
//! counters, histograms and trace events into a shared collector, which is
//! finalized into a serializable [`SimulationResult`].
//!
//! All storage lives in memory; I/O cost is modeled through a configurable
//! [`LatencyModel`] advancing a simulated clock.

pub mod core;
pub mod categories;
pub mod runtime;
mod tests;

// Re-export commonly used types
pub use crate::core::block::{Block, BlockCategory, BlockError};
pub use crate::core::registry::{BlockDefinition, BlockRegistry, RegistryError};
pub use crate::core::InstanceId;
pub use categories::BlockKind;
pub use runtime::config::{LatencyModel, SimulationConfig};
pub use runtime::graph::{DraftGraph, GraphError, GraphSpec};
pub use runtime::plan::ExecutionPlan;
pub use runtime::simulation::{
    CancellationHandle, SimulationResult, SimulationRun, SimulationStatus, Simulator,
};
pub use runtime::validation::{ValidationCode, ValidationError};
pub use runtime::workload::{KeyDistribution, OperationMix, OperationType, Workload};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
