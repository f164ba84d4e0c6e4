//! Execution engine
//!
//! Owns the fresh block runtimes for one run and pushes single requests
//! through a compiled [`ExecutionPlan`]. Outputs are kept on a data bus keyed
//! by `(step, port)`; each step gathers its inputs from the bus through its
//! bindings. A step that is not an entry block and received nothing is
//! skipped for that request.
//!
//! A block may park the request (a lock wait). The engine then hands back a
//! [`Suspended`] request holding the bus and the parking step, which resumes
//! at that same step once the caller decides it may proceed.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::core::block::{
    Block, BlockError, BlockState, ExecutionContext, ExecutionStatus, InitContext, Request,
    RequestKind,
};
use crate::core::metrics::MetricsSink;
use crate::core::port::PortValue;
use crate::core::{InstanceId, TxnId};

use super::config::{LatencyModel, SimulationConfig};
use super::plan::ExecutionPlan;

/// Step outputs for one request, keyed by producing step and port
pub type DataBus = BTreeMap<(usize, String), PortValue>;

// ── Dispatch results ────────────────────────────────────────────────────────

/// A request parked mid-plan
#[derive(Debug, Clone)]
pub struct Suspended {
    pub request: Request,
    /// Step to re-execute on resume
    pub resume_at: usize,
    pub bus: DataBus,
}

/// How one dispatch ended
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// Every reached step ran
    Completed {
        /// Records left on outputs nothing consumes
        rows: usize,
    },
    /// A block asked the request to wait for other transactions
    Parked {
        waiting_for: Vec<TxnId>,
        suspended: Suspended,
    },
    /// A block rejected the request
    Failed {
        instance_id: InstanceId,
        error: BlockError,
    },
}

/// Outcome plus the transactions blocks aborted along the way
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub outcome: DispatchOutcome,
    pub aborted_txns: Vec<TxnId>,
}

/// A block failed to initialize
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{instance_id} failed to initialize: {error}")]
pub struct InitError {
    pub instance_id: InstanceId,
    pub error: BlockError,
}

// ── Engine ──────────────────────────────────────────────────────────────────

const SEED_SPREAD: u64 = 0x9E37_79B9_7F4A_7C15;

/// Block runtimes for one run, in plan order
pub struct ExecutionEngine {
    plan: Arc<ExecutionPlan>,
    blocks: Vec<Box<dyn Block>>,
    sink: MetricsSink,
    latency: LatencyModel,
}

impl ExecutionEngine {
    /// Instantiate and initialize every block of `plan` in order, so storage
    /// handles exist before their consumers initialize.
    pub async fn initialize(
        plan: Arc<ExecutionPlan>,
        config: &SimulationConfig,
        sink: MetricsSink,
    ) -> Result<Self, InitError> {
        let mut blocks: Vec<Box<dyn Block>> = Vec::with_capacity(plan.len());
        for (i, step) in plan.steps().iter().enumerate() {
            let kind = step.definition.kind;
            let storage = step
                .storage_source
                .and_then(|source| blocks[source].storage_handle());
            let ctx = InitContext {
                instance_id: step.instance_id.clone(),
                parameters: step.parameters.clone(),
                metrics: sink.handle(step.instance_id.clone(), kind.definition_id()),
                storage,
                latency: config.latency.clone(),
                seed: config.seed ^ (i as u64 + 1).wrapping_mul(SEED_SPREAD),
                connected_outputs: step.connected_outputs.clone(),
            };

            let mut block = kind.instantiate();
            block.initialize(ctx).await.map_err(|error| InitError {
                instance_id: step.instance_id.clone(),
                error,
            })?;
            blocks.push(block);
        }

        tracing::debug!(blocks = blocks.len(), "initialized block runtimes");
        Ok(Self {
            plan,
            blocks,
            sink,
            latency: config.latency.clone(),
        })
    }

    /// Run a new request from the first step. A completed commit releases
    /// the undo state blocks keep for the transaction; an abort, whatever its
    /// outcome, rolls back the transaction's writes in every block.
    pub async fn dispatch(&mut self, request: Request) -> DispatchReport {
        let (txn, kind) = (request.txn, request.kind);
        let report = self.run_from(request, 0, DataBus::new()).await;
        match kind {
            RequestKind::Commit if matches!(report.outcome, DispatchOutcome::Completed { .. }) => {
                for block in &mut self.blocks {
                    block.commit_transaction(txn);
                }
            }
            RequestKind::Abort => {
                tracing::debug!(%txn, "rolling back transaction writes");
                for block in self.blocks.iter_mut().rev() {
                    block.rollback_transaction(txn);
                }
            }
            _ => {}
        }
        report
    }

    /// Continue a parked request at the step that parked it
    pub async fn resume(&mut self, suspended: Suspended) -> DispatchReport {
        let Suspended {
            request,
            resume_at,
            bus,
        } = suspended;
        self.run_from(request, resume_at, bus).await
    }

    async fn run_from(&mut self, request: Request, start: usize, mut bus: DataBus) -> DispatchReport {
        let mut aborted_txns = Vec::new();

        for i in start..self.plan.len() {
            let step = self.plan.step(i);

            let mut inputs: BTreeMap<String, PortValue> = BTreeMap::new();
            for binding in &step.bindings {
                assert!(
                    binding.from_step < i,
                    "step {} reads from later step {}",
                    i,
                    binding.from_step
                );
                if let Some(value) = bus.get(&(binding.from_step, binding.from_port.clone())) {
                    let merged = match inputs.remove(&binding.port) {
                        Some(existing) => existing.merge(value.clone()),
                        None => value.clone(),
                    };
                    inputs.insert(binding.port.clone(), merged);
                }
            }
            if !step.is_entry && inputs.is_empty() {
                continue;
            }

            self.sink.charge(self.latency.cpu_op_us);
            let ctx = ExecutionContext {
                request: request.clone(),
                inputs,
            };
            let result = match self.blocks[i].execute(ctx).await {
                Ok(result) => result,
                Err(error) => {
                    return DispatchReport {
                        outcome: DispatchOutcome::Failed {
                            instance_id: step.instance_id.clone(),
                            error,
                        },
                        aborted_txns,
                    };
                }
            };
            aborted_txns.extend(result.aborted_txns);

            if let ExecutionStatus::Park { waiting_for } = result.status {
                return DispatchReport {
                    outcome: DispatchOutcome::Parked {
                        waiting_for,
                        suspended: Suspended {
                            request,
                            resume_at: i,
                            bus,
                        },
                    },
                    aborted_txns,
                };
            }

            for (port, value) in result.outputs {
                bus.insert((i, port), value);
            }
        }

        let rows = bus
            .iter()
            .filter(|((step, port), _)| !self.plan.step(*step).connected_outputs.contains(port))
            .map(|(_, value)| match value {
                PortValue::Records(records) => records.len(),
                _ => 0,
            })
            .sum();

        DispatchReport {
            outcome: DispatchOutcome::Completed { rows },
            aborted_txns,
        }
    }

    /// Record every block's state-derived gauges into the sink
    pub fn record_gauges(&self) {
        for (step, block) in self.plan.steps().iter().zip(&self.blocks) {
            for (name, value) in block.snapshot_metrics() {
                self.sink.record_gauge(&step.instance_id, &name, value);
            }
        }
    }

    /// Replace a step's runtime with one built around it
    #[cfg(test)]
    pub(crate) fn wrap_block(
        &mut self,
        instance_id: &InstanceId,
        wrap: impl FnOnce(Box<dyn Block>) -> Box<dyn Block>,
    ) {
        if let Some(i) = self.plan.step_index(instance_id) {
            let inner = self.blocks.remove(i);
            self.blocks.insert(i, wrap(inner));
        }
    }

    pub fn block_state(&self, instance_id: &InstanceId) -> Option<BlockState> {
        let i = self.plan.step_index(instance_id)?;
        Some(self.blocks[i].get_state())
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn sink(&self) -> &MetricsSink {
        &self.sink
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
