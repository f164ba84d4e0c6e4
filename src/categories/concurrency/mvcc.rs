//! MVCC (Multi-Version Concurrency Control) Block
//!
//! Implements **snapshot isolation** via multi-version concurrency control.
//! Each write creates a new version of a record rather than overwriting in
//! place, allowing readers to see a consistent snapshot without blocking
//! writers.
//!
//! ## How it works
//!
//! Every version carries its **creator** transaction and an optional
//! **deleter**. A transaction takes its snapshot timestamp at begin; commits
//! advance a logical clock and stamp the committing transaction. A reader sees
//! a version if:
//! - the creator is the reader itself, or committed at or before the snapshot
//! - and no deleter is the reader or committed at or before the snapshot
//!
//! Concurrent writers to one key are resolved **first-updater-wins**: the
//! second writer fails with a write conflict. Vacuum removes versions whose
//! deleter committed before every active snapshot.
//!
//! Commit stamps are only kept while some snapshot may precede them. Once the
//! oldest active snapshot (or the clock, with none active) passes a commit,
//! its stamp is dropped; a writer that is neither active nor stamped counts
//! as committed at or before that point.
//!
//! ## Metrics tracked
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `versions_created` | Counter | New versions written |
//! | `snapshot_reads` | Counter | Reads served from a snapshot |
//! | `write_conflicts` | Counter | Write-write conflicts detected |
//! | `vacuum_runs` | Counter | Garbage collection cycles |
//! | `versions_reclaimed` | Counter | Versions reclaimed by vacuum |
//! | `vacuum` | Event | One per vacuum run |
//! | `total_versions` | Gauge | Versions currently stored |
//! | `chain_length_avg` | Gauge | Average version chain length |
//! | `active_snapshots` | Gauge | Transactions holding a snapshot |

use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::{concurrency_inputs, forwarded_outputs};
use crate::categories::BlockKind;
use crate::core::block::{
    Block, BlockCategory, BlockDocumentation, BlockError, BlockMetadata, BlockState,
    Complexity, ExecutionContext, ExecutionResult, InitContext, OperationType, Reference,
    ReferenceType,
};
use crate::core::metrics::{MetricDefinition, MetricsHandle};
use crate::core::parameter::Parameter;
use crate::core::port::{DataType, Port, PortType, PortValue, Record, TxnSignalKind};
use crate::core::registry::BlockDefinition;
use crate::core::TxnId;

// ---------------------------------------------------------------------------
// Internal version model
// ---------------------------------------------------------------------------

type Timestamp = u64;

#[derive(Debug, Clone)]
struct Version {
    record: Record,
    creator: TxnId,
    deleter: Option<TxnId>,
}

/// Version chains plus the transaction bookkeeping visibility needs
#[derive(Debug, Clone, Default)]
pub struct VersionStore {
    /// key → versions, oldest first
    chains: BTreeMap<i64, Vec<Version>>,
    /// Active transaction → snapshot timestamp
    snapshots: BTreeMap<TxnId, Timestamp>,
    /// Committed transaction → commit timestamp, for commits not yet settled
    committed: BTreeMap<TxnId, Timestamp>,
    /// `committed` in commit order
    commit_order: VecDeque<(Timestamp, TxnId)>,
    /// Every commit whose stamp was dropped happened at or before this
    settled_through: Timestamp,
    /// Keys each active transaction wrote
    written: BTreeMap<TxnId, BTreeSet<i64>>,
    clock: Timestamp,
    /// Versions whose deleter has committed
    dead: usize,
}

impl VersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a snapshot for `txn`; a no-op if it already has one.
    pub fn begin(&mut self, txn: TxnId) -> Timestamp {
        *self.snapshots.entry(txn).or_insert(self.clock)
    }

    /// Commit timestamp of `writer`, `None` while it is still active
    fn commit_ts(&self, writer: TxnId) -> Option<Timestamp> {
        match self.committed.get(&writer) {
            Some(ts) => Some(*ts),
            None if self.snapshots.contains_key(&writer) => None,
            None => Some(self.settled_through),
        }
    }

    /// Whether `reader` sees the effects of `writer`
    fn sees(&self, reader: TxnId, snapshot: Timestamp, writer: TxnId) -> bool {
        writer == reader || self.commit_ts(writer).map_or(false, |ts| ts <= snapshot)
    }

    /// Oldest snapshot any reader holds or could still take
    fn horizon(&self) -> Timestamp {
        self.snapshots.values().copied().min().unwrap_or(self.clock)
    }

    /// Drop the stamps of commits every snapshot already covers.
    fn settle_commits(&mut self) {
        let horizon = self.horizon();
        while let Some(&(ts, txn)) = self.commit_order.front() {
            if ts > horizon {
                break;
            }
            self.commit_order.pop_front();
            self.committed.remove(&txn);
            self.settled_through = ts;
        }
    }

    fn visible(&self, reader: TxnId, snapshot: Timestamp, version: &Version) -> bool {
        self.sees(reader, snapshot, version.creator)
            && !version
                .deleter
                .map_or(false, |d| self.sees(reader, snapshot, d))
    }

    /// The version of `key` visible to `txn`, with the number of versions walked
    pub fn read(&mut self, txn: TxnId, key: i64) -> (Option<Record>, usize) {
        let snapshot = self.begin(txn);
        let Some(chain) = self.chains.get(&key) else {
            return (None, 0);
        };
        let mut walked = 0;
        for version in chain.iter().rev() {
            walked += 1;
            if self.visible(txn, snapshot, version) {
                return (Some(version.record.clone()), walked);
            }
        }
        (None, walked)
    }

    /// Visible rows with keys in `[start, end)`
    pub fn read_range(&mut self, txn: TxnId, start: i64, end: i64) -> Vec<Record> {
        let snapshot = self.begin(txn);
        self.chains
            .range(start..end)
            .filter_map(|(_, chain)| {
                chain
                    .iter()
                    .rev()
                    .find(|v| self.visible(txn, snapshot, v))
                    .map(|v| v.record.clone())
            })
            .collect()
    }

    /// Apply a write. Returns whether a new version was created.
    pub fn write(
        &mut self,
        txn: TxnId,
        op: OperationType,
        record: Record,
    ) -> Result<bool, BlockError> {
        let snapshot = self.begin(txn);
        let key = record.key;

        if let Some(latest) = self.chains.get(&key).and_then(|c| c.last()) {
            let foreign = |t: TxnId| t != txn && !self.sees(txn, snapshot, t);
            if foreign(latest.creator) || latest.deleter.map_or(false, foreign) {
                return Err(BlockError::WriteConflict { txn, key });
            }
        }

        let chain = self.chains.entry(key).or_default();
        let current = chain.iter().rposition(|v| v.deleter.is_none());

        let created = match op {
            OperationType::Select => false,
            OperationType::Delete => {
                if let Some(pos) = current {
                    chain[pos].deleter = Some(txn);
                }
                false
            }
            OperationType::Insert | OperationType::Update => {
                match current {
                    // Rewriting our own uncommitted version replaces it.
                    Some(pos) if chain[pos].creator == txn => {
                        chain[pos].record = record;
                        self.written.entry(txn).or_default().insert(key);
                        return Ok(false);
                    }
                    Some(pos) => chain[pos].deleter = Some(txn),
                    None => {}
                }
                chain.push(Version {
                    record,
                    creator: txn,
                    deleter: None,
                });
                true
            }
        };
        if chain.is_empty() {
            self.chains.remove(&key);
        }
        self.written.entry(txn).or_default().insert(key);
        Ok(created)
    }

    /// Stamp `txn` committed. Its superseded versions become reclaimable.
    pub fn commit(&mut self, txn: TxnId) {
        self.clock += 1;
        self.committed.insert(txn, self.clock);
        self.commit_order.push_back((self.clock, txn));
        self.snapshots.remove(&txn);
        for key in self.written.remove(&txn).unwrap_or_default() {
            if let Some(chain) = self.chains.get(&key) {
                self.dead += chain.iter().filter(|v| v.deleter == Some(txn)).count();
            }
        }
        self.settle_commits();
    }

    /// Discard every version `txn` created and undo its deletes.
    pub fn abort(&mut self, txn: TxnId) {
        self.snapshots.remove(&txn);
        for key in self.written.remove(&txn).unwrap_or_default() {
            let Some(chain) = self.chains.get_mut(&key) else {
                continue;
            };
            chain.retain(|v| v.creator != txn);
            for version in chain.iter_mut() {
                if version.deleter == Some(txn) {
                    version.deleter = None;
                }
            }
            if chain.is_empty() {
                self.chains.remove(&key);
            }
        }
        self.settle_commits();
    }

    pub fn reclaimable(&self) -> usize {
        self.dead
    }

    /// Remove versions no active or future snapshot can see. Returns how
    /// many were reclaimed.
    pub fn vacuum(&mut self) -> usize {
        let horizon = self.horizon();
        let mut chains = std::mem::take(&mut self.chains);
        let deleted_at = |v: &Version| v.deleter.and_then(|d| self.commit_ts(d));

        let mut reclaimed = 0;
        let mut remaining_dead = 0;
        chains.retain(|_, chain| {
            let before = chain.len();
            chain.retain(|v| deleted_at(v).map_or(true, |ts| ts > horizon));
            reclaimed += before - chain.len();
            remaining_dead += chain.iter().filter(|v| deleted_at(v).is_some()).count();
            !chain.is_empty()
        });
        self.chains = chains;
        self.dead = remaining_dead;
        self.settle_commits();
        reclaimed
    }

    /// Commit stamps still kept for visibility checks
    pub fn tracked_commits(&self) -> usize {
        self.committed.len()
    }

    pub fn total_versions(&self) -> usize {
        self.chains.values().map(Vec::len).sum()
    }

    pub fn avg_chain_length(&self) -> f64 {
        if self.chains.is_empty() {
            0.0
        } else {
            self.total_versions() as f64 / self.chains.len() as f64
        }
    }

    pub fn active_snapshots(&self) -> usize {
        self.snapshots.len()
    }
}

// ---------------------------------------------------------------------------
// MVCCBlock
// ---------------------------------------------------------------------------

pub struct MVCCBlock {
    store: VersionStore,
    gc_threshold: usize,
    metrics: MetricsHandle,
}

impl MVCCBlock {
    pub fn new() -> Self {
        Self {
            store: VersionStore::new(),
            gc_threshold: 1000,
            metrics: MetricsHandle::detached("mvcc"),
        }
    }

    pub fn definition() -> BlockDefinition {
        let mut outputs = forwarded_outputs();
        outputs.push(
            Port::output("rows", "Snapshot Rows", PortType::RecordStream, DataType::Row)
                .with_description("Rows visible to the reading transaction's snapshot"),
        );
        BlockDefinition {
            kind: BlockKind::Mvcc,
            metadata: Self::build_metadata(),
            inputs: concurrency_inputs(),
            outputs,
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
            id: "mvcc".into(),
            name: "MVCC".into(),
            category: BlockCategory::Concurrency,
            description: "Multi-Version Concurrency Control with snapshot isolation".into(),
            version: "1.0.0".into(),
            documentation: BlockDocumentation {
                overview: "MVCC lets readers and writers proceed without blocking each other. \
                           Writers create new versions instead of overwriting; readers see the \
                           database as of the moment their transaction began. Old versions are \
                           reclaimed by vacuum once no snapshot can see them."
                    .into(),
                algorithm: "WRITE: fail if the newest version was written by a transaction the \
                            writer cannot see, else mark the visible version deleted and append \
                            a new one.\nREAD: walk the chain newest first and return the first \
                            visible version.\nVACUUM: drop versions whose deleter committed \
                            before the oldest active snapshot."
                    .into(),
                complexity: Complexity {
                    time: "Read O(v) where v = chain length, Write O(1), Vacuum O(n × v)".into(),
                    space: "O(n × v), one version per write per key".into(),
                },
                use_cases: vec![
                    "OLTP with mixed read/write workloads".into(),
                    "Long-running reads alongside writes".into(),
                ],
                tradeoffs: vec![
                    "Readers never block writers and vice versa".into(),
                    "Space overhead from multiple versions per key".into(),
                    "Write-write conflicts abort the later writer".into(),
                ],
            },
            references: vec![Reference {
                ref_type: ReferenceType::Paper,
                title: "An Empirical Evaluation of In-Memory MVCC".into(),
                citation: Some("Wu, Y. et al. (2017). PVLDB, 10(7), 781–792.".into()),
            }],
        }
    }

    fn build_parameters() -> Vec<Parameter> {
        vec![Parameter::integer("gc_threshold", "GC Threshold", 1000, 1, 1_000_000)
            .with_description("Reclaimable versions that trigger a vacuum at commit")]
    }

    fn build_metrics() -> Vec<MetricDefinition> {
        vec![
            MetricDefinition::counter("versions_created", "versions", "New versions written"),
            MetricDefinition::counter("snapshot_reads", "reads", "Reads served from a snapshot"),
            MetricDefinition::counter("write_conflicts", "conflicts", "Write-write conflicts detected"),
            MetricDefinition::counter("vacuum_runs", "runs", "Garbage collection cycles"),
            MetricDefinition::counter("versions_reclaimed", "versions", "Versions reclaimed by vacuum"),
            MetricDefinition::histogram("versions_walked", "versions", "Chain entries walked per point read"),
            MetricDefinition::event("vacuum", "A vacuum run and what it reclaimed"),
            MetricDefinition::gauge("total_versions", "versions", "Versions currently stored"),
            MetricDefinition::gauge("chain_length_avg", "versions", "Average version chain length"),
            MetricDefinition::gauge("active_snapshots", "txns", "Transactions holding a snapshot"),
        ]
    }

    // -- Core operations -----------------------------------------------------

    fn finish(&mut self, txn: TxnId, kind: TxnSignalKind) {
        match kind {
            TxnSignalKind::Begin => {
                self.store.begin(txn);
            }
            TxnSignalKind::Abort => self.store.abort(txn),
            TxnSignalKind::Commit => {
                self.store.commit(txn);
                if self.store.reclaimable() > self.gc_threshold {
                    self.run_vacuum();
                }
            }
        }
    }

    fn run_vacuum(&mut self) {
        let reclaimed = self.store.vacuum();
        self.metrics.increment("vacuum_runs");
        self.metrics.counter("versions_reclaimed", reclaimed as f64);
        self.metrics.event(
            "vacuum",
            json!({ "reclaimed": reclaimed, "remaining": self.store.total_versions() }),
        );
        tracing::debug!(reclaimed, "mvcc vacuum");
    }

    fn select(&mut self, ctx: &ExecutionContext) -> Vec<Record> {
        let request = &ctx.request;
        self.metrics.increment("snapshot_reads");
        match request.range_end() {
            Some(end) => self.store.read_range(request.txn, request.key, end),
            None => {
                let (row, walked) = self.store.read(request.txn, request.key);
                self.metrics.histogram("versions_walked", walked as f64);
                row.into_iter().collect()
            }
        }
    }
}

impl Default for MVCCBlock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Block for MVCCBlock {
    fn kind(&self) -> BlockKind {
        BlockKind::Mvcc
    }

    async fn initialize(&mut self, ctx: InitContext) -> Result<(), BlockError> {
        self.store = VersionStore::new();
        self.gc_threshold = ctx.usize("gc_threshold")?;
        self.metrics = ctx.metrics;
        Ok(())
    }

    async fn execute(&mut self, mut ctx: ExecutionContext) -> Result<ExecutionResult, BlockError> {
        if let PortValue::Txn(signal) = ctx.take("txn") {
            self.finish(signal.txn, signal.kind);
            return Ok(ExecutionResult::empty().with_output("txn", PortValue::Txn(signal)));
        }

        let Some(op) = ctx.request.op() else {
            return Ok(ExecutionResult::empty());
        };
        if op == OperationType::Select {
            let rows = self.select(&ctx);
            return Ok(ExecutionResult::empty().with_output("rows", PortValue::Records(rows)));
        }

        let txn = ctx.request.txn;
        let records = ctx.take_records("records");
        for record in &records {
            match self.store.write(txn, op, record.clone()) {
                Ok(true) => self.metrics.increment("versions_created"),
                Ok(false) => {}
                Err(err) => {
                    self.metrics.increment("write_conflicts");
                    return Err(err);
                }
            }
        }
        Ok(ExecutionResult::empty().with_output("records", PortValue::Records(records)))
    }

    fn snapshot_metrics(&self) -> BTreeMap<String, f64> {
        let mut gauges = BTreeMap::new();
        gauges.insert("total_versions".into(), self.store.total_versions() as f64);
        gauges.insert("chain_length_avg".into(), self.store.avg_chain_length());
        gauges.insert("active_snapshots".into(), self.store.active_snapshots() as f64);
        gauges
    }

    fn get_state(&self) -> BlockState {
        let mut state = BlockState::new();
        let _ = state.insert("gc_threshold", self.gc_threshold);
        let _ = state.insert("total_versions", self.store.total_versions());
        let _ = state.insert("active_snapshots", self.store.active_snapshots());
        state
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
