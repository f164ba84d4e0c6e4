//! Storage block implementations
//!
//! Storage blocks manage how data is physically organized into pages. They all
//! share the same wiring: rows arrive on `records`, rows carrying their record
//! id leave on `stored`, and page references leave on `pages`.
//!
//! Other blocks never touch a storage block's pages directly. At
//! initialization they receive a [`StorageHandle`] on the nearest upstream
//! storage block, which counts `pages_read` and charges the modeled read
//! latency against that storage block.

pub mod clustered;
pub mod heap_file;
pub mod lsm_tree;

pub use clustered::ClusteredStorageBlock;
pub use heap_file::HeapFileBlock;
pub use lsm_tree::LSMTreeBlock;

use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::categories::{PageId, RecordId};
use crate::core::block::{ExecutionResult, Request};
use crate::core::metrics::MetricsHandle;
use crate::core::port::{DataType, PageRef, Port, PortType, PortValue, Record};
use crate::core::InstanceId;
use crate::runtime::config::LatencyModel;

/// Read-side view of a table, implemented by each storage engine
pub trait StorageEngine: Send + Sync {
    /// Page ids in physical order
    fn page_ids(&self) -> Vec<PageId>;

    /// Live records on a page, in slot order
    fn page_records(&self, page: PageId) -> Vec<Record>;

    /// Find a record and the page holding it; `None` for the page means the
    /// record is memory-resident
    fn locate(&self, record_id: &RecordId) -> Option<(Option<PageId>, Record)>;

    /// Rows not yet written to any page
    fn memory_resident(&self) -> Vec<Record> {
        Vec::new()
    }

    fn live_records(&self) -> usize;
}

/// Shared, metered access to a storage block's table
#[derive(Clone)]
pub struct StorageHandle {
    engine: Arc<RwLock<dyn StorageEngine>>,
    metrics: MetricsHandle,
    page_read_us: f64,
}

impl StorageHandle {
    pub fn new(
        engine: Arc<RwLock<dyn StorageEngine>>,
        metrics: MetricsHandle,
        latency: &LatencyModel,
    ) -> Self {
        Self {
            engine,
            metrics,
            page_read_us: latency.page_read_us,
        }
    }

    /// Instance id of the storage block behind this handle
    pub fn owner(&self) -> &InstanceId {
        self.metrics.instance_id()
    }

    pub fn page_ids(&self) -> Vec<PageId> {
        self.engine.read().page_ids()
    }

    /// Read a page from simulated disk
    pub fn read_page(&self, page: PageId) -> Vec<Record> {
        self.count_read();
        self.engine.read().page_records(page)
    }

    /// Page contents without I/O, for pages already resident in a buffer pool
    pub fn peek_page(&self, page: PageId) -> Vec<Record> {
        self.engine.read().page_records(page)
    }

    /// Fetch a single record by id. Costs one page read unless the record is
    /// memory-resident; a miss still costs the read.
    pub fn fetch(&self, record_id: &RecordId) -> Option<Record> {
        let located = self.engine.read().locate(record_id);
        match located {
            Some((None, record)) => Some(record),
            Some((Some(_), record)) => {
                self.count_read();
                Some(record)
            }
            None => {
                self.count_read();
                None
            }
        }
    }

    pub fn memory_resident(&self) -> Vec<Record> {
        self.engine.read().memory_resident()
    }

    pub fn live_records(&self) -> usize {
        self.engine.read().live_records()
    }

    fn count_read(&self) {
        self.metrics.increment("pages_read");
        self.metrics.charge(self.page_read_us);
    }
}

impl fmt::Debug for StorageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageHandle")
            .field("owner", self.owner())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Shared wiring
// ---------------------------------------------------------------------------

pub(crate) fn storage_inputs() -> Vec<Port> {
    vec![Port::input("records", "Records", PortType::RecordStream, DataType::Row)
        .required()
        .with_description("Rows to insert, update or delete")]
}

pub(crate) fn storage_outputs() -> Vec<Port> {
    vec![
        Port::output("stored", "Stored Records", PortType::RecordStream, DataType::StoredRow)
            .with_description("Rows after storage, carrying their record id"),
        Port::output("pages", "Pages", PortType::PageStream, DataType::PageRef)
            .with_description("Touched pages on writes, every page in physical order on reads"),
    ]
}

/// Outputs for a select, which passes through storage without I/O: the
/// request row goes out on `stored` and the page list on `pages`.
///
/// The request row only drives downstream blocks. It is not a stored row, so
/// nothing goes out on `stored` when nothing listens there; otherwise the
/// engine would count it as a result row.
pub(crate) fn select_passthrough(
    request: &Request,
    rows: Vec<Record>,
    emit_stored: bool,
    page_ids: Option<Vec<PageId>>,
) -> ExecutionResult {
    let mut result = ExecutionResult::empty();
    if emit_stored {
        let rows = if rows.is_empty() {
            vec![Record::new(request.key)]
        } else {
            rows
        };
        result = result.with_output("stored", PortValue::Records(rows));
    }
    if let Some(ids) = page_ids {
        result = result.with_output(
            "pages",
            PortValue::Pages(ids.into_iter().map(PageRef::new).collect()),
        );
    }
    result
}

/// Outputs for a write: the affected rows and, if anything downstream
/// listens, the pages they touched.
pub(crate) fn write_result(
    stored: Vec<Record>,
    touched: BTreeSet<PageId>,
    emit_pages: bool,
) -> ExecutionResult {
    let mut result = ExecutionResult::empty();
    if !stored.is_empty() {
        result = result.with_output("stored", PortValue::Records(stored));
    }
    if emit_pages && !touched.is_empty() {
        result = result.with_output(
            "pages",
            PortValue::Pages(touched.into_iter().map(PageRef::new).collect()),
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::metrics::MetricsSink;

    struct TwoPages;

    impl StorageEngine for TwoPages {
        fn page_ids(&self) -> Vec<PageId> {
            vec![PageId(0), PageId(1)]
        }

        fn page_records(&self, page: PageId) -> Vec<Record> {
            vec![Record::new(page.0 as i64)]
        }

        fn locate(&self, record_id: &RecordId) -> Option<(Option<PageId>, Record)> {
            match record_id {
                RecordId::Key(k) if *k < 2 => Some((Some(PageId(*k as u64)), Record::new(*k))),
                _ => None,
            }
        }

        fn live_records(&self) -> usize {
            2
        }
    }

    #[test]
    fn test_handle_meters_reads_not_peeks() {
        let sink = MetricsSink::new(false);
        let engine: Arc<RwLock<dyn StorageEngine>> = Arc::new(RwLock::new(TwoPages));
        let handle = StorageHandle::new(
            engine,
            sink.handle(InstanceId::from("heap"), "heap_storage"),
            &LatencyModel::default(),
        );

        assert_eq!(handle.read_page(PageId(1))[0].key, 1);
        assert_eq!(handle.peek_page(PageId(0))[0].key, 0);
        assert!(handle.fetch(&RecordId::Key(1)).is_some());
        assert!(handle.fetch(&RecordId::Key(9)).is_none());

        assert_eq!(sink.counter(&"heap".into(), "pages_read"), 3.0);
        assert_eq!(sink.now_us(), 300.0);
    }

    #[test]
    fn test_select_passthrough_emits_pages_in_order() {
        let req = Request::operation(
            crate::core::TxnId(1),
            crate::core::block::OperationType::Select,
            4,
        );
        let result = select_passthrough(&req, Vec::new(), true, Some(vec![PageId(0), PageId(1)]));

        let pages = result.output("pages").unwrap().clone().into_pages();
        assert_eq!(pages.iter().map(|p| p.id).collect::<Vec<_>>(), vec![PageId(0), PageId(1)]);
        let stored = result.output("stored").unwrap().clone().into_records();
        assert_eq!(stored[0].key, 4);
        assert!(stored[0].record_id.is_none());
    }

    #[test]
    fn test_select_passthrough_skips_unconnected_stored() {
        let req = Request::operation(
            crate::core::TxnId(1),
            crate::core::block::OperationType::Select,
            4,
        );
        let result = select_passthrough(&req, Vec::new(), false, Some(vec![PageId(0)]));

        assert!(result.output("stored").is_none());
        assert_eq!(result.output("pages").map(PortValue::len), Some(1));
    }
}
