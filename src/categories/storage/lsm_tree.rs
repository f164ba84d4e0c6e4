//! LSM Tree Storage Block
//!
//! A Log-Structured Merge-Tree that buffers writes in a sorted in-memory
//! **memtable** and flushes them to immutable **sorted runs**. Compaction
//! merges the oldest runs to bound the number of runs a read has to probe.
//!
//! ## How it works
//!
//! 1. **Write path**: inserts, updates and deletes are all blind writes into
//!    the memtable. A delete writes a tombstone. When the memtable holds
//!    `memtable_size` entries it is flushed as a new run, split into pages of
//!    `page_capacity` entries.
//! 2. **Compaction**: when there are more than `max_runs` runs, the oldest
//!    runs are merged into one. Only the newest version of each key survives,
//!    and tombstones are dropped since nothing older remains to shadow.
//! 3. **Read path**: point reads check the memtable, then runs newest to
//!    oldest. The first hit wins, and a tombstone hit means "not found".
//! 4. **Rollback**: each write remembers the key's newest version before it.
//!    An abort writes those versions back (a tombstone where the key did not
//!    exist), newest write first. Rollback writes are ordinary blind writes,
//!    so they can trigger flushes and compactions too.
//!
//! ## Metrics tracked
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `pages_written` | Counter | Run pages written by flushes and compactions |
//! | `pages_read` | Counter | Run pages read by compactions and downstream readers |
//! | `lsm_flushes` | Counter | Memtable flushes |
//! | `lsm_compactions` | Counter | Compactions |
//! | `lsm_flush` | Event | A memtable flush |
//! | `lsm_compaction` | Event | A compaction |
//! | `runs_probed` | Histogram | Runs checked per point read |
//! | `write_amplification` | Gauge | Physical bytes written / logical bytes written |
//! | `memtable_entries` | Gauge | Entries in the memtable |
//! | `run_count` | Gauge | Sorted runs on disk |
//! | `records_rolled_back` | Counter | Writes undone by aborts |

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::{select_passthrough, storage_inputs, storage_outputs, write_result, StorageEngine, StorageHandle};
use crate::categories::{BlockKind, PageId, RecordId, WriteSet};
use crate::core::block::{
    Block, BlockCategory, BlockDocumentation, BlockError, BlockMetadata, BlockState,
    Complexity, ExecutionContext, ExecutionResult, InitContext, OperationType, Reference,
    ReferenceType,
};
use crate::core::constraint::{DependencyConstraint, ParameterCondition};
use crate::core::metrics::{MetricDefinition, MetricsHandle};
use crate::core::parameter::Parameter;
use crate::core::port::Record;
use crate::core::registry::BlockDefinition;
use crate::core::TxnId;
use crate::runtime::config::LatencyModel;

/// On-disk size of a tombstone: key plus entry header.
const TOMBSTONE_BYTES: usize = 24;

/// A memtable or run entry; `None` is a tombstone.
type Entry = (i64, Option<Record>);

fn entry_size(value: &Option<Record>) -> usize {
    value.as_ref().map_or(TOMBSTONE_BYTES, Record::estimated_size)
}

// ---------------------------------------------------------------------------
// Sorted runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct RunPage {
    id: PageId,
    entries: Vec<Entry>,
}

impl RunPage {
    fn last_key(&self) -> i64 {
        self.entries.last().map_or(i64::MIN, |(k, _)| *k)
    }
}

/// Immutable sorted run
#[derive(Debug, Clone)]
struct SortedRun {
    id: u64,
    pages: Vec<RunPage>,
}

impl SortedRun {
    fn get(&self, key: i64) -> Option<(PageId, &Option<Record>)> {
        let idx = self.pages.partition_point(|p| p.last_key() < key);
        let page = self.pages.get(idx)?;
        let slot = page.entries.binary_search_by_key(&key, |(k, _)| *k).ok()?;
        Some((page.id, &page.entries[slot].1))
    }

    fn contains(&self, key: i64) -> bool {
        self.get(key).is_some()
    }

    fn page_ids(&self) -> Vec<PageId> {
        self.pages.iter().map(|p| p.id).collect()
    }

    fn bytes(&self) -> u64 {
        self.pages
            .iter()
            .flat_map(|p| p.entries.iter())
            .map(|(_, v)| entry_size(v) as u64)
            .sum()
    }

    fn len(&self) -> usize {
        self.pages.iter().map(|p| p.entries.len()).sum()
    }
}

/// What a memtable flush produced
#[derive(Debug, Clone, PartialEq)]
pub struct FlushReport {
    pub run: u64,
    pub entries: usize,
    pub pages: Vec<PageId>,
}

/// What a compaction did
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionReport {
    pub runs_merged: usize,
    pub entries_in: usize,
    pub entries_out: usize,
    pub pages_read: usize,
    pub pages: Vec<PageId>,
}

/// Background work triggered by one write
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteReport {
    pub flush: Option<FlushReport>,
    pub compaction: Option<CompactionReport>,
}

// ---------------------------------------------------------------------------
// LSM tree
// ---------------------------------------------------------------------------

/// Memtable plus sorted runs, oldest run first
#[derive(Debug)]
pub struct LsmTree {
    memtable_size: usize,
    max_runs: usize,
    page_capacity: usize,
    memtable: BTreeMap<i64, Option<Record>>,
    runs: Vec<SortedRun>,
    next_run: u64,
    next_page: u64,
    logical_bytes: u64,
    physical_bytes: u64,
    /// Point reads record how many runs they probed
    probes: MetricsHandle,
}

impl LsmTree {
    pub fn new(memtable_size: usize, max_runs: usize, page_capacity: usize) -> Self {
        Self {
            memtable_size: memtable_size.max(1),
            max_runs: max_runs.max(2),
            page_capacity: page_capacity.max(1),
            memtable: BTreeMap::new(),
            runs: Vec::new(),
            next_run: 0,
            next_page: 0,
            logical_bytes: 0,
            physical_bytes: 0,
            probes: MetricsHandle::detached("lsm_storage"),
        }
    }

    fn with_probes(mut self, probes: MetricsHandle) -> Self {
        self.probes = probes;
        self
    }

    /// Write a new version (or a tombstone) of `key`.
    pub fn put(&mut self, key: i64, value: Option<Record>) -> WriteReport {
        self.logical_bytes += entry_size(&value) as u64;
        self.memtable.insert(key, value);

        let mut report = WriteReport::default();
        if self.memtable.len() >= self.memtable_size {
            report.flush = Some(self.flush());
            if self.runs.len() > self.max_runs {
                report.compaction = Some(self.compact());
            }
        }
        report
    }

    /// Flush the memtable into a new run.
    pub fn flush(&mut self) -> FlushReport {
        let entries: Vec<Entry> = std::mem::take(&mut self.memtable).into_iter().collect();
        let count = entries.len();
        let run = self.build_run(entries);
        self.physical_bytes += run.bytes();
        let report = FlushReport {
            run: run.id,
            entries: count,
            pages: run.page_ids(),
        };
        self.runs.push(run);
        report
    }

    /// Merge the oldest runs so that `max_runs` remain.
    fn compact(&mut self) -> CompactionReport {
        let merge_count = self.runs.len() + 1 - self.max_runs;
        let merged: Vec<SortedRun> = self.runs.drain(..merge_count).collect();
        let pages_read = merged.iter().map(|r| r.pages.len()).sum();

        let mut entries_in = 0;
        let mut latest: BTreeMap<i64, Option<Record>> = BTreeMap::new();
        for run in merged {
            for page in run.pages {
                for (key, value) in page.entries {
                    entries_in += 1;
                    latest.insert(key, value);
                }
            }
        }

        // The merge includes the oldest run, so tombstones shadow nothing.
        let survivors: Vec<Entry> = latest.into_iter().filter(|(_, v)| v.is_some()).collect();
        let entries_out = survivors.len();
        let run = self.build_run(survivors);
        self.physical_bytes += run.bytes();
        let pages = run.page_ids();
        if !run.pages.is_empty() {
            self.runs.insert(0, run);
        }

        CompactionReport {
            runs_merged: merge_count,
            entries_in,
            entries_out,
            pages_read,
            pages,
        }
    }

    fn build_run(&mut self, entries: Vec<Entry>) -> SortedRun {
        let id = self.next_run;
        self.next_run += 1;

        let mut pages = Vec::new();
        let mut rest = entries.into_iter().peekable();
        while rest.peek().is_some() {
            let chunk: Vec<Entry> = rest.by_ref().take(self.page_capacity).collect();
            pages.push(RunPage {
                id: PageId(self.next_page),
                entries: chunk,
            });
            self.next_page += 1;
        }
        SortedRun { id, pages }
    }

    /// Newest version of `key` with where it lives, and how many runs were probed.
    pub fn get(&self, key: i64) -> (Option<(Option<PageId>, Record)>, usize) {
        if let Some(value) = self.memtable.get(&key) {
            return (value.clone().map(|r| (None, r)), 0);
        }
        for (probed, run) in self.runs.iter().rev().enumerate() {
            if let Some((page, value)) = run.get(key) {
                return (value.clone().map(|r| (Some(page), r)), probed + 1);
            }
        }
        (None, self.runs.len())
    }

    /// Whether a version newer than run `run_idx` exists for `key`
    fn shadowed(&self, run_idx: usize, key: i64) -> bool {
        self.memtable.contains_key(&key) || self.runs[run_idx + 1..].iter().any(|r| r.contains(key))
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    pub fn memtable_len(&self) -> usize {
        self.memtable.len()
    }

    pub fn write_amplification(&self) -> f64 {
        if self.logical_bytes == 0 {
            0.0
        } else {
            self.physical_bytes as f64 / self.logical_bytes as f64
        }
    }

    /// Entries per run, oldest first
    pub fn run_sizes(&self) -> Vec<usize> {
        self.runs.iter().map(SortedRun::len).collect()
    }
}

impl StorageEngine for LsmTree {
    fn page_ids(&self) -> Vec<PageId> {
        self.runs.iter().flat_map(|r| r.page_ids()).collect()
    }

    /// Entries on the page that are the newest live version of their key
    fn page_records(&self, page: PageId) -> Vec<Record> {
        for (run_idx, run) in self.runs.iter().enumerate() {
            if let Some(p) = run.pages.iter().find(|p| p.id == page) {
                return p
                    .entries
                    .iter()
                    .filter(|(key, _)| !self.shadowed(run_idx, *key))
                    .filter_map(|(_, value)| value.clone())
                    .collect();
            }
        }
        Vec::new()
    }

    fn locate(&self, record_id: &RecordId) -> Option<(Option<PageId>, Record)> {
        let RecordId::Key(key) = record_id else {
            return None;
        };
        let (found, probed) = self.get(*key);
        self.probes.histogram("runs_probed", probed as f64);
        found
    }

    fn memory_resident(&self) -> Vec<Record> {
        self.memtable.values().flatten().cloned().collect()
    }

    fn live_records(&self) -> usize {
        let mut latest: BTreeMap<i64, bool> = BTreeMap::new();
        for run in &self.runs {
            for page in &run.pages {
                for (key, value) in &page.entries {
                    latest.insert(*key, value.is_some());
                }
            }
        }
        for (key, value) in &self.memtable {
            latest.insert(*key, value.is_some());
        }
        latest.values().filter(|live| **live).count()
    }
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// LSM tree storage block.
pub struct LSMTreeBlock {
    tree: Arc<RwLock<LsmTree>>,
    /// Newest version of each written key before the write
    undo: WriteSet<Entry>,
    metrics: MetricsHandle,
    latency: LatencyModel,
    emit_stored: bool,
    emit_pages: bool,
}

impl LSMTreeBlock {
    pub fn new() -> Self {
        Self {
            tree: Arc::new(RwLock::new(LsmTree::new(1024, 4, 64))),
            undo: WriteSet::new(),
            metrics: MetricsHandle::detached("lsm_storage"),
            latency: LatencyModel::default(),
            emit_stored: true,
            emit_pages: true,
        }
    }

    pub fn definition() -> BlockDefinition {
        BlockDefinition {
            kind: BlockKind::LsmStorage,
            metadata: Self::build_metadata(),
            inputs: storage_inputs(),
            outputs: storage_outputs(),
            parameters: Self::build_parameters(),
            constraints: vec![DependencyConstraint::upstream_block(
                "write_ahead_log",
                "With wal_required set, writes must be logged before they reach the memtable",
            )
            .when(ParameterCondition::new("wal_required", true))],
            capabilities: BTreeSet::new(),
            capability_requirements: Vec::new(),
            metrics: Self::build_metrics(),
            entry: false,
        }
    }

    // -- Metadata builders ---------------------------------------------------

    fn build_metadata() -> BlockMetadata {
        BlockMetadata {
            id: "lsm_storage".into(),
            name: "LSM Tree".into(),
            category: BlockCategory::Storage,
            description: "Log-structured merge tree with a memtable and compacted sorted runs".into(),
            version: "1.0.0".into(),
            documentation: BlockDocumentation {
                overview: "An LSM tree turns random writes into sequential ones: writes go to an \
                           in-memory memtable that is periodically flushed as an immutable \
                           sorted run. Background compaction merges runs so reads stay bounded. \
                           LevelDB, RocksDB and Cassandra are built on this design."
                    .into(),
                algorithm: "Write: insert into the memtable, flush at memtable_size. \
                            Compact: merge the oldest runs once more than max_runs exist. \
                            Read: memtable, then runs from newest to oldest."
                    .into(),
                complexity: Complexity {
                    time: "Write O(log m) amortized, Read O(r log n) for r runs".into(),
                    space: "O(n) plus versions awaiting compaction".into(),
                },
                use_cases: vec![
                    "Write-heavy workloads".into(),
                    "Time-series ingestion".into(),
                    "Key-value stores".into(),
                ],
                tradeoffs: vec![
                    "Fast writes at the cost of read amplification".into(),
                    "Compaction rewrites data (write amplification)".into(),
                    "Deletes cost space until compaction drops their tombstones".into(),
                ],
            },
            references: vec![
                Reference {
                    ref_type: ReferenceType::Paper,
                    title: "The Log-Structured Merge-Tree (LSM-Tree)".into(),
                    citation: Some(
                        "O'Neil, P., Cheng, E., Gawlick, D., & O'Neil, E. (1996). Acta Informatica."
                            .into(),
                    ),
                },
                Reference {
                    ref_type: ReferenceType::Implementation,
                    title: "RocksDB".into(),
                    citation: None,
                },
            ],
        }
    }

    fn build_parameters() -> Vec<Parameter> {
        vec![
            Parameter::integer("memtable_size", "Memtable Size", 1024, 16, 1_000_000)
                .with_description("Entries buffered in memory before a flush"),
            Parameter::integer("max_runs", "Max Runs", 4, 2, 64)
                .with_description("Sorted runs allowed before the oldest are compacted"),
            Parameter::integer("page_capacity", "Page Capacity", 64, 4, 4096)
                .with_description("Entries per run page"),
            Parameter::boolean("wal_required", "Require WAL", false)
                .with_description("Declare a dependency on an upstream write-ahead log"),
        ]
    }

    fn build_metrics() -> Vec<MetricDefinition> {
        vec![
            MetricDefinition::counter("pages_written", "pages", "Run pages written"),
            MetricDefinition::counter("pages_read", "pages", "Run pages read"),
            MetricDefinition::counter("lsm_flushes", "flushes", "Memtable flushes"),
            MetricDefinition::counter("lsm_compactions", "compactions", "Compactions"),
            MetricDefinition::event("lsm_flush", "A memtable flush"),
            MetricDefinition::event("lsm_compaction", "A compaction"),
            MetricDefinition::histogram("runs_probed", "runs", "Runs checked per point read"),
            MetricDefinition::gauge("write_amplification", "ratio", "Physical / logical bytes written"),
            MetricDefinition::gauge("memtable_entries", "entries", "Entries in the memtable"),
            MetricDefinition::gauge("run_count", "runs", "Sorted runs"),
            MetricDefinition::gauge("total_pages", "pages", "Run pages"),
            MetricDefinition::gauge("live_records", "records", "Keys whose newest version is live"),
            MetricDefinition::counter("records_rolled_back", "records", "Writes undone by aborts"),
        ]
    }

    // -- Core operations -----------------------------------------------------

    fn record_background(&self, report: WriteReport, touched: &mut BTreeSet<PageId>) {
        if let Some(flush) = report.flush {
            tracing::debug!(run = flush.run, entries = flush.entries, "lsm memtable flushed");
            self.metrics.increment("lsm_flushes");
            self.write_pages(flush.pages.len());
            self.metrics.event(
                "lsm_flush",
                json!({ "run": flush.run, "entries": flush.entries, "pages": flush.pages.len() }),
            );
            touched.extend(flush.pages);
        }
        if let Some(compaction) = report.compaction {
            tracing::debug!(
                runs_merged = compaction.runs_merged,
                entries_in = compaction.entries_in,
                entries_out = compaction.entries_out,
                "lsm compaction"
            );
            self.metrics.increment("lsm_compactions");
            self.metrics.counter("pages_read", compaction.pages_read as f64);
            self.metrics.charge(compaction.pages_read as f64 * self.latency.page_read_us);
            self.write_pages(compaction.pages.len());
            self.metrics.event(
                "lsm_compaction",
                json!({
                    "runs_merged": compaction.runs_merged,
                    "entries_in": compaction.entries_in,
                    "entries_out": compaction.entries_out,
                }),
            );
            touched.extend(compaction.pages);
        }
    }

    fn write_pages(&self, pages: usize) {
        self.metrics.counter("pages_written", pages as f64);
        self.metrics.charge(pages as f64 * self.latency.page_write_us);
    }

    fn apply(
        &mut self,
        txn: TxnId,
        op: OperationType,
        records: Vec<Record>,
    ) -> (Vec<Record>, BTreeSet<PageId>) {
        let mut stored = Vec::with_capacity(records.len());
        let mut touched = BTreeSet::new();

        for record in records {
            let key = record.key;
            let rid = RecordId::Key(key);
            let (value, row) = match op {
                OperationType::Insert | OperationType::Update => {
                    let row = record.with_record_id(rid);
                    (Some(row.clone()), row)
                }
                OperationType::Delete => (None, Record::new(key).with_record_id(rid)),
                OperationType::Select => continue,
            };
            let report = {
                let mut tree = self.tree.write();
                let before = tree.get(key).0.map(|(_, record)| record);
                self.undo.record(txn, (key, before));
                tree.put(key, value)
            };
            self.metrics.charge(self.latency.memory_access_us);
            self.record_background(report, &mut touched);
            stored.push(row);
        }
        (stored, touched)
    }
}

impl Default for LSMTreeBlock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Block for LSMTreeBlock {
    fn kind(&self) -> BlockKind {
        BlockKind::LsmStorage
    }

    async fn initialize(&mut self, ctx: InitContext) -> Result<(), BlockError> {
        let tree = LsmTree::new(
            ctx.usize("memtable_size")?,
            ctx.usize("max_runs")?,
            ctx.usize("page_capacity")?,
        )
        .with_probes(ctx.metrics.clone());
        self.tree = Arc::new(RwLock::new(tree));
        self.undo = WriteSet::new();
        self.emit_stored = ctx.output_connected("stored");
        self.emit_pages = ctx.output_connected("pages");
        self.latency = ctx.latency;
        self.metrics = ctx.metrics;
        Ok(())
    }

    async fn execute(&mut self, mut ctx: ExecutionContext) -> Result<ExecutionResult, BlockError> {
        let records = ctx.take_records("records");
        let Some(op) = ctx.request.op() else {
            return Ok(ExecutionResult::empty());
        };

        if op == OperationType::Select {
            let pages = self.emit_pages.then(|| self.tree.read().page_ids());
            return Ok(select_passthrough(&ctx.request, records, self.emit_stored, pages));
        }

        let (stored, touched) = self.apply(ctx.request.txn, op, records);
        Ok(write_result(stored, touched, self.emit_pages))
    }

    fn commit_transaction(&mut self, txn: TxnId) {
        self.undo.commit(txn);
    }

    fn rollback_transaction(&mut self, txn: TxnId) {
        let changes = self.undo.take_for_undo(txn);
        if changes.is_empty() {
            return;
        }
        let undone = changes.len();
        let mut touched = BTreeSet::new();
        for (key, before) in changes {
            let report = self.tree.write().put(key, before);
            self.metrics.charge(self.latency.memory_access_us);
            self.record_background(report, &mut touched);
        }
        self.metrics.counter("records_rolled_back", undone as f64);
        tracing::debug!(%txn, undone, "lsm writes rolled back");
    }

    fn snapshot_metrics(&self) -> BTreeMap<String, f64> {
        let tree = self.tree.read();
        let mut gauges = BTreeMap::new();
        gauges.insert("write_amplification".into(), tree.write_amplification());
        gauges.insert("memtable_entries".into(), tree.memtable_len() as f64);
        gauges.insert("run_count".into(), tree.run_count() as f64);
        gauges.insert("total_pages".into(), tree.page_ids().len() as f64);
        gauges.insert("live_records".into(), tree.live_records() as f64);
        gauges
    }

    fn storage_handle(&self) -> Option<StorageHandle> {
        let engine: Arc<RwLock<dyn StorageEngine>> = self.tree.clone();
        Some(StorageHandle::new(engine, self.metrics.clone(), &self.latency))
    }

    fn get_state(&self) -> BlockState {
        let tree = self.tree.read();
        let mut state = BlockState::new();
        let _ = state.insert("memtable_entries", tree.memtable_len());
        let _ = state.insert("run_sizes", tree.run_sizes());
        let _ = state.insert("write_amplification", tree.write_amplification());
        state
    }
}
