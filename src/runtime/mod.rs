//! Simulation runtime
//!
//! Everything between a wired design and its metrics: the draft graph and
//! its validator, the compiled execution plan, the engine that pushes
//! requests through the plan, the workload generator and the orchestrator
//! that ties them together.

pub mod config;
pub mod engine;
pub mod graph;
pub mod plan;
pub mod simulation;
pub mod validation;
pub mod workload;
