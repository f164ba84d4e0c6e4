//! Row Lock (Two-Phase Locking) Concurrency Block
//!
//! Implements **strict two-phase locking (2PL)**, the classic concurrency
//! control protocol. Transactions acquire locks before accessing records
//! and release them only at commit/abort.
//!
//! ## How it works
//!
//! - **Growing phase**: Locks are acquired as records are accessed.
//! - **Shrinking phase**: All locks released at once when the transaction ends.
//! - **Lock modes**: Shared (S) for reads, Exclusive (X) for writes. A sole
//!   shared holder may upgrade to exclusive.
//! - **Waiting**: a conflicting request adds wait-for edges to the current
//!   holders and parks until one of them finishes.
//! - **Deadlock detection**: every new wait edge runs a DFS over the wait-for
//!   graph. On a cycle the most recently started transaction is the victim.
//!
//! ## Metrics tracked
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `locks_acquired` | Counter | Total locks granted |
//! | `lock_waits` | Counter | Lock requests that had to wait |
//! | `lock_upgrades` | Counter | S → X upgrades |
//! | `deadlocks_detected` | Counter | Deadlock cycles found |
//! | `deadlock` | Event | One per cycle, with its members and victim |
//! | `active_locks` | Gauge | Currently held locks |

use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

use super::{concurrency_inputs, forwarded_outputs};
use crate::categories::BlockKind;
use crate::core::block::{
    Block, BlockCategory, BlockDocumentation, BlockError, BlockMetadata, BlockState,
    Complexity, ExecutionContext, ExecutionResult, InitContext, Reference, ReferenceType,
};
use crate::core::metrics::{MetricDefinition, MetricsHandle};
use crate::core::parameter::Parameter;
use crate::core::port::{PortValue, TxnSignalKind};
use crate::core::registry::BlockDefinition;
use crate::core::TxnId;
use crate::runtime::config::LatencyModel;

/// Lock modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone)]
struct LockEntry {
    mode: LockMode,
    holders: BTreeSet<TxnId>,
}

/// Result of one acquire attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Granted { fresh: bool, upgraded: bool },
    /// Blocked by these holders
    Wait(BTreeSet<TxnId>),
}

// ---------------------------------------------------------------------------
// Lock manager
// ---------------------------------------------------------------------------

/// Lock table plus wait-for graph
#[derive(Debug, Clone, Default)]
pub struct LockManager {
    table: BTreeMap<i64, LockEntry>,
    held: BTreeMap<TxnId, BTreeSet<i64>>,
    wait_for: BTreeMap<TxnId, BTreeSet<TxnId>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant the lock if compatible, otherwise report the blocking holders.
    pub fn try_acquire(&mut self, txn: TxnId, key: i64, mode: LockMode) -> LockOutcome {
        let Some(entry) = self.table.get_mut(&key) else {
            self.table.insert(
                key,
                LockEntry {
                    mode,
                    holders: BTreeSet::from([txn]),
                },
            );
            self.held.entry(txn).or_default().insert(key);
            return LockOutcome::Granted {
                fresh: true,
                upgraded: false,
            };
        };

        if entry.holders.contains(&txn) {
            if mode == LockMode::Exclusive && entry.mode == LockMode::Shared {
                if entry.holders.len() == 1 {
                    entry.mode = LockMode::Exclusive;
                    return LockOutcome::Granted {
                        fresh: false,
                        upgraded: true,
                    };
                }
                let others = entry.holders.iter().copied().filter(|h| *h != txn).collect();
                return LockOutcome::Wait(others);
            }
            return LockOutcome::Granted {
                fresh: false,
                upgraded: false,
            };
        }

        if entry.mode == LockMode::Shared && mode == LockMode::Shared {
            entry.holders.insert(txn);
            self.held.entry(txn).or_default().insert(key);
            return LockOutcome::Granted {
                fresh: true,
                upgraded: false,
            };
        }
        LockOutcome::Wait(entry.holders.clone())
    }

    pub fn set_waiting(&mut self, txn: TxnId, holders: BTreeSet<TxnId>) {
        self.wait_for.insert(txn, holders);
    }

    pub fn clear_waiting(&mut self, txn: TxnId) {
        self.wait_for.remove(&txn);
    }

    /// Release every lock `txn` holds and drop it from the wait-for graph.
    /// Returns the number of locks released.
    pub fn release_all(&mut self, txn: TxnId) -> usize {
        let keys = self.held.remove(&txn).unwrap_or_default();
        for key in &keys {
            if let Some(entry) = self.table.get_mut(key) {
                entry.holders.remove(&txn);
                if entry.holders.is_empty() {
                    self.table.remove(key);
                }
            }
        }
        self.wait_for.remove(&txn);
        for waits in self.wait_for.values_mut() {
            waits.remove(&txn);
        }
        keys.len()
    }

    /// A wait-for cycle through `start`, listed from `start` along the edges
    pub fn find_cycle(&self, start: TxnId) -> Option<Vec<TxnId>> {
        let mut path = vec![start];
        let mut visited = BTreeSet::from([start]);
        self.dfs(start, start, &mut path, &mut visited)
    }

    fn dfs(
        &self,
        node: TxnId,
        start: TxnId,
        path: &mut Vec<TxnId>,
        visited: &mut BTreeSet<TxnId>,
    ) -> Option<Vec<TxnId>> {
        for &next in self.wait_for.get(&node).into_iter().flatten() {
            if next == start {
                return Some(path.clone());
            }
            if visited.insert(next) {
                path.push(next);
                if let Some(cycle) = self.dfs(next, start, path, visited) {
                    return Some(cycle);
                }
                path.pop();
            }
        }
        None
    }

    pub fn holds(&self, txn: TxnId, key: i64) -> bool {
        self.held.get(&txn).map_or(false, |keys| keys.contains(&key))
    }

    pub fn active_lock_count(&self) -> usize {
        self.table.values().map(|e| e.holders.len()).sum()
    }

    pub fn waiting_count(&self) -> usize {
        self.wait_for.len()
    }
}

// ---------------------------------------------------------------------------
// RowLockBlock
// ---------------------------------------------------------------------------

pub struct RowLockBlock {
    locks: LockManager,
    deadlock_detection: bool,
    metrics: MetricsHandle,
    latency: LatencyModel,
}

impl RowLockBlock {
    pub fn new() -> Self {
        Self {
            locks: LockManager::new(),
            deadlock_detection: true,
            metrics: MetricsHandle::detached("two_phase_locking"),
            latency: LatencyModel::default(),
        }
    }

    pub fn definition() -> BlockDefinition {
        BlockDefinition {
            kind: BlockKind::TwoPhaseLocking,
            metadata: Self::build_metadata(),
            inputs: concurrency_inputs(),
            outputs: forwarded_outputs(),
            parameters: Self::build_parameters(),
            constraints: Vec::new(),
            capabilities: BTreeSet::new(),
            capability_requirements: Vec::new(),
            metrics: Self::build_metrics(),
            entry: false,
        }
    }

    // -- Metadata builders ---------------------------------------------------

    fn build_metadata() -> BlockMetadata {
        BlockMetadata {
            id: "two_phase_locking".into(),
            name: "Two-Phase Locking".into(),
            category: BlockCategory::Concurrency,
            description: "Strict 2PL with shared/exclusive row locks and deadlock detection".into(),
            version: "1.0.0".into(),
            documentation: BlockDocumentation {
                overview: "Two-phase locking guarantees serializability: a transaction takes \
                           every lock it needs before releasing any. The strict variant holds \
                           all locks until commit or abort, which also prevents cascading \
                           aborts."
                    .into(),
                algorithm: "Acquire: grant if unheld or compatible, otherwise wait for the \
                            holders. Each wait edge triggers cycle detection; the youngest \
                            transaction in a cycle is aborted. Commit/abort releases all locks."
                    .into(),
                complexity: Complexity {
                    time: "O(log n) per lock, O(V + E) per deadlock check".into(),
                    space: "O(locks held + waiting transactions)".into(),
                },
                use_cases: vec![
                    "Serializable OLTP transactions".into(),
                    "Write-heavy workloads with low contention".into(),
                ],
                tradeoffs: vec![
                    "Readers block writers and writers block readers".into(),
                    "Deadlocks are possible and cost an abort".into(),
                ],
            },
            references: vec![Reference {
                ref_type: ReferenceType::Paper,
                title: "The Notions of Consistency and Predicate Locks in a Database System".into(),
                citation: Some(
                    "Eswaran, K. P., Gray, J. N., Lorie, R. A., Traiger, I. L. (1976). CACM.".into(),
                ),
            }],
        }
    }

    fn build_parameters() -> Vec<Parameter> {
        vec![Parameter::boolean("deadlock_detection", "Deadlock Detection", true)
            .with_description("Check the wait-for graph on every new wait edge")]
    }

    fn build_metrics() -> Vec<MetricDefinition> {
        vec![
            MetricDefinition::counter("locks_acquired", "locks", "Total locks granted"),
            MetricDefinition::counter("lock_waits", "requests", "Requests that had to wait"),
            MetricDefinition::counter("lock_upgrades", "locks", "Shared to exclusive upgrades"),
            MetricDefinition::counter("deadlocks_detected", "cycles", "Deadlock cycles found"),
            MetricDefinition::event("deadlock", "A wait-for cycle and its victim"),
            MetricDefinition::gauge("active_locks", "locks", "Currently held locks"),
        ]
    }

    // -- Core operations -----------------------------------------------------

    /// Acquire one lock, resolving deadlocks. `Ok(Some(_))` means the request
    /// must wait for those transactions; victims other than `txn` are pushed
    /// to `aborted`.
    fn acquire(
        &mut self,
        txn: TxnId,
        key: i64,
        mode: LockMode,
        aborted: &mut Vec<TxnId>,
    ) -> Result<Option<Vec<TxnId>>, BlockError> {
        loop {
            self.metrics.charge(self.latency.lock_us);
            let holders = match self.locks.try_acquire(txn, key, mode) {
                LockOutcome::Granted { fresh, upgraded } => {
                    self.locks.clear_waiting(txn);
                    if fresh {
                        self.metrics.increment("locks_acquired");
                    }
                    if upgraded {
                        self.metrics.increment("lock_upgrades");
                    }
                    return Ok(None);
                }
                LockOutcome::Wait(holders) => holders,
            };

            self.locks.set_waiting(txn, holders.clone());
            let cycle = if self.deadlock_detection {
                self.locks.find_cycle(txn)
            } else {
                None
            };
            let Some(cycle) = cycle else {
                self.metrics.increment("lock_waits");
                return Ok(Some(holders.into_iter().collect()));
            };

            let victim = cycle.iter().copied().max().unwrap_or(txn);
            self.metrics.increment("deadlocks_detected");
            self.metrics.event(
                "deadlock",
                json!({
                    "cycle": cycle.iter().map(|t| t.0).collect::<Vec<_>>(),
                    "victim": victim.0,
                }),
            );
            tracing::info!(%victim, cycle_len = cycle.len(), key, "deadlock detected");

            if victim == txn {
                self.locks.clear_waiting(txn);
                return Err(BlockError::DeadlockDetected { victim, cycle });
            }
            self.locks.release_all(victim);
            aborted.push(victim);
        }
    }
}

impl Default for RowLockBlock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Block for RowLockBlock {
    fn kind(&self) -> BlockKind {
        BlockKind::TwoPhaseLocking
    }

    async fn initialize(&mut self, ctx: InitContext) -> Result<(), BlockError> {
        self.locks = LockManager::new();
        self.deadlock_detection = ctx.boolean("deadlock_detection")?;
        self.latency = ctx.latency;
        self.metrics = ctx.metrics;
        Ok(())
    }

    async fn execute(&mut self, mut ctx: ExecutionContext) -> Result<ExecutionResult, BlockError> {
        if let PortValue::Txn(signal) = ctx.take("txn") {
            if matches!(signal.kind, TxnSignalKind::Commit | TxnSignalKind::Abort) {
                self.locks.release_all(signal.txn);
            }
            return Ok(ExecutionResult::empty().with_output("txn", PortValue::Txn(signal)));
        }

        let records = ctx.take_records("records");
        let request = &ctx.request;
        let Some(op) = request.op() else {
            return Ok(ExecutionResult::empty());
        };

        let (mode, keys): (LockMode, Vec<i64>) = if op.is_write() {
            let keys = if records.is_empty() {
                vec![request.key]
            } else {
                records.iter().map(|r| r.key).collect()
            };
            (LockMode::Exclusive, keys)
        } else {
            let keys = match request.range_end() {
                Some(end) => (request.key..end).collect(),
                None => vec![request.key],
            };
            (LockMode::Shared, keys)
        };

        let txn = request.txn;
        let mut aborted = Vec::new();
        for key in keys {
            if let Some(waiting_for) = self.acquire(txn, key, mode, &mut aborted)? {
                return Ok(ExecutionResult::parked(waiting_for).with_aborted(aborted));
            }
        }

        Ok(ExecutionResult::empty()
            .with_output("records", PortValue::Records(records))
            .with_aborted(aborted))
    }

    fn snapshot_metrics(&self) -> BTreeMap<String, f64> {
        let mut gauges = BTreeMap::new();
        gauges.insert("active_locks".into(), self.locks.active_lock_count() as f64);
        gauges
    }

    fn get_state(&self) -> BlockState {
        let mut state = BlockState::new();
        let _ = state.insert("active_locks", self.locks.active_lock_count());
        let _ = state.insert("waiting_txns", self.locks.waiting_count());
        let _ = state.insert("deadlock_detection", self.deadlock_detection);
        state
    }
}
