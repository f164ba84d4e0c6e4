//! Heap File Storage Block
//!
//! A heap file stores records in unordered, fixed-size pages. It is the
//! simplest and most common storage layout used by databases (e.g. PostgreSQL's
//! default table storage).
//!
//! ## How it works
//!
//! Records are placed on the first page with enough free space (first-fit);
//! when no page has room a new one is allocated. Deletes mark slots as dead
//! rather than physically removing data, so the space stays used until a
//! compaction pass would reclaim it. Updates and deletes have no index to help
//! them, so they scan pages in physical order until the key is found.
//!
//! Every write is logged against its transaction until the transaction ends.
//! An abort replays the log backwards: inserted slots die, updated slots get
//! their old image back and deleted slots come back to life.
//!
//! ## Metrics tracked
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `pages_read` | Counter | Pages read by update/delete scans and by downstream readers |
//! | `pages_written` | Counter | Page writes (one per modified record) |
//! | `records_inserted` | Counter | Total records inserted |
//! | `records_updated` | Counter | Records rewritten in place |
//! | `records_deleted` | Counter | Total records tombstoned |
//! | `records_rolled_back` | Counter | Writes undone by aborts |
//! | `page_allocated` | Event | A new page was added to the file |
//! | `total_pages` | Gauge | Current page count |
//! | `live_records` | Gauge | Live (non-dead) records |
//! | `fragmentation_pct` | Gauge | Dead slots / total slots |

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
use crate::core::metrics::{MetricDefinition, MetricsHandle};
use crate::core::parameter::Parameter;
use crate::core::port::Record;
use crate::core::registry::BlockDefinition;
use crate::core::TxnId;
use crate::runtime::config::LatencyModel;

/// Bytes reserved for the page header.
const PAGE_HEADER_BYTES: usize = 24;

// ---------------------------------------------------------------------------
// Internal page model
// ---------------------------------------------------------------------------

/// A slot on a page. Each slot holds one record.
#[derive(Debug, Clone)]
struct Slot {
    record: Record,
    is_dead: bool,
}

/// A fixed-size page containing a number of record slots.
#[derive(Debug, Clone)]
struct Page {
    page_id: PageId,
    slots: Vec<Slot>,
    /// Estimated bytes used by records on this page, dead ones included.
    used_bytes: usize,
}

impl Page {
    fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            slots: Vec::new(),
            used_bytes: 0,
        }
    }

    fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_dead).count()
    }

    fn dead_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_dead).count()
    }
}

/// How to undo one write
#[derive(Debug, Clone)]
enum HeapUndo {
    Insert(RecordId),
    Update { record_id: RecordId, before: Record },
    Delete(RecordId),
}

/// Where an insert landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub record_id: RecordId,
    pub page: PageId,
    pub allocated: bool,
}

/// The page file behind a heap storage block.
#[derive(Debug)]
pub struct HeapFile {
    page_size: usize,
    fill_factor: f64,
    pages: Vec<Page>,
}

impl HeapFile {
    pub fn new(page_size: usize, fill_factor: f64) -> Self {
        Self {
            page_size,
            fill_factor,
            pages: Vec::new(),
        }
    }

    /// Maximum usable bytes on a page given fill_factor.
    fn usable_page_bytes(&self) -> usize {
        (self.page_size.saturating_sub(PAGE_HEADER_BYTES) as f64 * self.fill_factor) as usize
    }

    /// Insert a record on the first page with room.
    pub fn insert(&mut self, record: Record) -> Placement {
        let size = record.estimated_size();
        let usable = self.usable_page_bytes();

        // An empty page always accepts a record, however large.
        let existing = self
            .pages
            .iter()
            .position(|p| p.slots.is_empty() || p.used_bytes + size <= usable);

        let (index, allocated) = match existing {
            Some(i) => (i, false),
            None => {
                let id = PageId(self.pages.len() as u64);
                self.pages.push(Page::new(id));
                (self.pages.len() - 1, true)
            }
        };

        let page = &mut self.pages[index];
        let slot = page.slots.len() as u32;
        let record_id = RecordId::Slot {
            page: page.page_id,
            slot,
        };
        page.slots.push(Slot {
            record: record.with_record_id(record_id),
            is_dead: false,
        });
        page.used_bytes += size;

        Placement {
            record_id,
            page: page.page_id,
            allocated,
        }
    }

    /// Scan pages in physical order for a live record with `key`. Returns the
    /// record id (if found) and the number of pages visited.
    pub fn find(&self, key: i64) -> (Option<RecordId>, usize) {
        for (visited, page) in self.pages.iter().enumerate() {
            for (slot, s) in page.slots.iter().enumerate() {
                if !s.is_dead && s.record.key == key {
                    let rid = RecordId::Slot {
                        page: page.page_id,
                        slot: slot as u32,
                    };
                    return (Some(rid), visited + 1);
                }
            }
        }
        (None, self.pages.len())
    }

    fn slot_mut(&mut self, record_id: &RecordId) -> Option<&mut Slot> {
        match record_id {
            RecordId::Slot { page, slot } => self
                .pages
                .get_mut(page.0 as usize)?
                .slots
                .get_mut(*slot as usize),
            RecordId::Key(_) => None,
        }
    }

    /// Get a live record by id.
    pub fn get(&self, record_id: &RecordId) -> Option<&Record> {
        match record_id {
            RecordId::Slot { page, slot } => {
                let slot = self.pages.get(page.0 as usize)?.slots.get(*slot as usize)?;
                (!slot.is_dead).then_some(&slot.record)
            }
            RecordId::Key(_) => None,
        }
    }

    /// Overwrite a live record in place, keeping its record id. The page's
    /// used bytes follow the size change.
    pub fn update(&mut self, record_id: &RecordId, record: Record) -> Option<Record> {
        let RecordId::Slot { page, slot } = record_id else {
            return None;
        };
        let page = self.pages.get_mut(page.0 as usize)?;
        let target = page.slots.get_mut(*slot as usize)?;
        if target.is_dead {
            return None;
        }
        let old_size = target.record.estimated_size();
        target.record = record.with_record_id(*record_id);
        let updated = target.record.clone();
        page.used_bytes = (page.used_bytes + updated.estimated_size()).saturating_sub(old_size);
        Some(updated)
    }

    /// Tombstone a record. Returns the old record if it was live.
    pub fn delete(&mut self, record_id: &RecordId) -> Option<Record> {
        let slot = self.slot_mut(record_id)?;
        if slot.is_dead {
            return None;
        }
        slot.is_dead = true;
        Some(slot.record.clone())
    }

    /// Bring a tombstoned record back. `false` if the slot was live or unknown.
    pub fn undelete(&mut self, record_id: &RecordId) -> bool {
        match self.slot_mut(record_id) {
            Some(slot) if slot.is_dead => {
                slot.is_dead = false;
                true
            }
            _ => false,
        }
    }

    /// Estimated bytes in use on a page, dead records included
    pub fn used_bytes(&self, page: PageId) -> Option<usize> {
        self.pages.get(page.0 as usize).map(|p| p.used_bytes)
    }

    fn undo(&mut self, change: HeapUndo) -> bool {
        match change {
            HeapUndo::Insert(record_id) => self.delete(&record_id).is_some(),
            HeapUndo::Update { record_id, before } => self.update(&record_id, before).is_some(),
            HeapUndo::Delete(record_id) => self.undelete(&record_id),
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Fragmentation: dead / total slots as a percentage.
    pub fn fragmentation_pct(&self) -> f64 {
        let total: usize = self.pages.iter().map(|p| p.slots.len()).sum();
        if total == 0 {
            return 0.0;
        }
        let dead: usize = self.pages.iter().map(|p| p.dead_count()).sum();
        (dead as f64 / total as f64) * 100.0
    }
}

impl StorageEngine for HeapFile {
    fn page_ids(&self) -> Vec<PageId> {
        self.pages.iter().map(|p| p.page_id).collect()
    }

    fn page_records(&self, page: PageId) -> Vec<Record> {
        self.pages
            .get(page.0 as usize)
            .map(|p| {
                p.slots
                    .iter()
                    .filter(|s| !s.is_dead)
                    .map(|s| s.record.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn locate(&self, record_id: &RecordId) -> Option<(Option<PageId>, Record)> {
        let record = self.get(record_id)?;
        match record_id {
            RecordId::Slot { page, .. } => Some((Some(*page), record.clone())),
            RecordId::Key(_) => None,
        }
    }

    fn live_records(&self) -> usize {
        self.pages.iter().map(|p| p.live_count()).sum()
    }
}

// ---------------------------------------------------------------------------
// HeapFileBlock
// ---------------------------------------------------------------------------

/// Heap file storage block.
pub struct HeapFileBlock {
    file: Arc<RwLock<HeapFile>>,
    undo: WriteSet<HeapUndo>,
    metrics: MetricsHandle,
    latency: LatencyModel,
    emit_stored: bool,
    emit_pages: bool,
}

impl HeapFileBlock {
    pub fn new() -> Self {
        Self {
            file: Arc::new(RwLock::new(HeapFile::new(8192, 0.9))),
            undo: WriteSet::new(),
            metrics: MetricsHandle::detached("heap_storage"),
            latency: LatencyModel::default(),
            emit_stored: true,
            emit_pages: true,
        }
    }

    pub fn definition() -> BlockDefinition {
        BlockDefinition {
            kind: BlockKind::HeapStorage,
            metadata: Self::build_metadata(),
            inputs: storage_inputs(),
            outputs: storage_outputs(),
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
            id: "heap_storage".into(),
            name: "Heap File Storage".into(),
            category: BlockCategory::Storage,
            description: "Stores records in unordered, fixed-size pages with first-fit placement"
                .into(),
            version: "1.0.0".into(),
            documentation: BlockDocumentation {
                overview: "A heap file is the simplest table storage structure. Records are \
                           placed on pages in arrival order with no particular sorting."
                    .into(),
                algorithm: "Insert: first page with enough free space, else allocate. \
                            Update/Delete: scan pages for the key, rewrite or tombstone the slot."
                    .into(),
                complexity: Complexity {
                    time: "Insert O(pages), Point lookup O(n) without index".into(),
                    space: "O(n), one slot per record".into(),
                },
                use_cases: vec![
                    "Default table storage when no specific ordering is needed".into(),
                    "Write-heavy workloads where insert speed matters most".into(),
                ],
                tradeoffs: vec![
                    "Fast inserts but slow point lookups without an index".into(),
                    "Deletes cause fragmentation over time".into(),
                ],
            },
            references: vec![Reference {
                ref_type: ReferenceType::Book,
                title: "Database Internals, Chapter 3: File Formats".into(),
                citation: Some("Petrov, A. (2019). Database Internals. O'Reilly.".into()),
            }],
        }
    }

    fn build_parameters() -> Vec<Parameter> {
        vec![
            Parameter::integer("page_size", "Page Size", 8192, 512, 65536)
                .with_description("Size of each page in bytes"),
            Parameter::number("fill_factor", "Fill Factor", 0.9, 0.1, 1.0)
                .with_description("Fraction of page space to fill before moving on"),
        ]
    }

    fn build_metrics() -> Vec<MetricDefinition> {
        vec![
            MetricDefinition::counter("pages_read", "pages", "Number of page reads"),
            MetricDefinition::counter("pages_written", "pages", "Number of page writes"),
            MetricDefinition::counter("records_inserted", "records", "Total records inserted"),
            MetricDefinition::counter("records_updated", "records", "Records rewritten in place"),
            MetricDefinition::counter("records_deleted", "records", "Total records tombstoned"),
            MetricDefinition::counter("records_rolled_back", "records", "Writes undone by aborts"),
            MetricDefinition::event("page_allocated", "A new page was added to the file"),
            MetricDefinition::gauge("total_pages", "pages", "Current number of pages"),
            MetricDefinition::gauge("live_records", "records", "Live records"),
            MetricDefinition::gauge("fragmentation_pct", "%", "Percentage of dead slots"),
        ]
    }

    // -- Core operations -----------------------------------------------------

    fn write_page(&self) {
        self.metrics.increment("pages_written");
        self.metrics.charge(self.latency.page_write_us);
    }

    /// Locate a key by scanning; every page visited is a read.
    fn locate_by_scan(&self, key: i64) -> Option<RecordId> {
        let (found, visited) = self.file.read().find(key);
        self.metrics.counter("pages_read", visited as f64);
        self.metrics.charge(visited as f64 * self.latency.page_read_us);
        found
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
            match op {
                OperationType::Insert => {
                    let placed = self.file.write().insert(record.clone());
                    if placed.allocated {
                        self.metrics.event("page_allocated", json!({ "page": placed.page.0 }));
                    }
                    self.write_page();
                    self.metrics.increment("records_inserted");
                    self.undo.record(txn, HeapUndo::Insert(placed.record_id));
                    touched.insert(placed.page);
                    stored.push(record.with_record_id(placed.record_id));
                }
                OperationType::Update => {
                    let Some(rid) = self.locate_by_scan(record.key) else {
                        continue;
                    };
                    let rewritten = {
                        let mut file = self.file.write();
                        let before = file.get(&rid).cloned();
                        before.zip(file.update(&rid, record))
                    };
                    if let Some((before, updated)) = rewritten {
                        self.write_page();
                        self.metrics.increment("records_updated");
                        self.undo.record(
                            txn,
                            HeapUndo::Update {
                                record_id: rid,
                                before,
                            },
                        );
                        if let RecordId::Slot { page, .. } = rid {
                            touched.insert(page);
                        }
                        stored.push(updated);
                    }
                }
                OperationType::Delete => {
                    let Some(rid) = self.locate_by_scan(record.key) else {
                        continue;
                    };
                    if let Some(old) = self.file.write().delete(&rid) {
                        self.write_page();
                        self.metrics.increment("records_deleted");
                        self.undo.record(txn, HeapUndo::Delete(rid));
                        if let RecordId::Slot { page, .. } = rid {
                            touched.insert(page);
                        }
                        stored.push(old);
                    }
                }
                OperationType::Select => {}
            }
        }
        (stored, touched)
    }
}

impl Default for HeapFileBlock {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Block trait implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl Block for HeapFileBlock {
    fn kind(&self) -> BlockKind {
        BlockKind::HeapStorage
    }

    async fn initialize(&mut self, ctx: InitContext) -> Result<(), BlockError> {
        let page_size = ctx.usize("page_size")?;
        let fill_factor = ctx.number("fill_factor")?;
        if !(512..=65536).contains(&page_size) {
            return Err(BlockError::InvalidParameter(
                "page_size must be between 512 and 65536".into(),
            ));
        }
        if !(0.1..=1.0).contains(&fill_factor) {
            return Err(BlockError::InvalidParameter(
                "fill_factor must be between 0.1 and 1.0".into(),
            ));
        }

        self.file = Arc::new(RwLock::new(HeapFile::new(page_size, fill_factor)));
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
            let pages = self.emit_pages.then(|| self.file.read().page_ids());
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
        let mut undone = 0;
        for change in changes {
            if self.file.write().undo(change) {
                self.write_page();
                undone += 1;
            }
        }
        self.metrics.counter("records_rolled_back", undone as f64);
        tracing::debug!(%txn, undone, "heap writes rolled back");
    }

    fn snapshot_metrics(&self) -> BTreeMap<String, f64> {
        let file = self.file.read();
        let mut gauges = BTreeMap::new();
        gauges.insert("total_pages".into(), file.page_count() as f64);
        gauges.insert("live_records".into(), file.live_records() as f64);
        gauges.insert("fragmentation_pct".into(), file.fragmentation_pct());
        gauges
    }

    fn storage_handle(&self) -> Option<StorageHandle> {
        let engine: Arc<RwLock<dyn StorageEngine>> = self.file.clone();
        Some(StorageHandle::new(engine, self.metrics.clone(), &self.latency))
    }

    fn get_state(&self) -> BlockState {
        let file = self.file.read();
        let mut state = BlockState::new();
        let _ = state.insert("page_size", file.page_size);
        let _ = state.insert("fill_factor", file.fill_factor);
        let _ = state.insert("page_count", file.page_count());
        let _ = state.insert("live_records", file.live_records());
        state
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
