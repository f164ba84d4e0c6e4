//! Sequential Scan Execution Block
//!
//! Reads all records from a storage block by iterating through every page.
//! This is the simplest scan strategy: no index required, but it must read
//! every page in the table.
//!
//! ## How it works
//!
//! On a select, storage emits its page list in physical order. Each page is
//! either already materialized by an upstream buffer pool or read through the
//! storage handle. Rows that live only in memory (an LSM memtable) are
//! appended after the pages. With `predicate = key` only rows matching the
//! request's key or key range are returned; every row is still examined.
//!
//! ## Metrics tracked
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `rows_scanned` | Counter | Total rows examined |
//! | `rows_returned` | Counter | Rows that passed the predicate |
//! | `pages_scanned` | Counter | Pages visited |
//! | `selectivity` | Gauge | rows_returned / rows_scanned |

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};

use super::rows_output;
use crate::categories::storage::StorageHandle;
use crate::categories::BlockKind;
use crate::core::block::{
    Block, BlockCategory, BlockDocumentation, BlockError, BlockMetadata, BlockState,
    Complexity, ExecutionContext, ExecutionResult, InitContext, Reference, ReferenceType,
};
use crate::core::constraint::DependencyConstraint;
use crate::core::metrics::{MetricDefinition, MetricsHandle};
use crate::core::parameter::Parameter;
use crate::core::port::{DataType, Port, PortType, PortValue, Record};
use crate::core::registry::BlockDefinition;
use crate::runtime::config::LatencyModel;

/// Row filter applied during the scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPredicate {
    /// Return every row
    None,
    /// Return rows matching the request key or range
    Key,
}

// ---------------------------------------------------------------------------
// SequentialScanBlock
// ---------------------------------------------------------------------------

pub struct SequentialScanBlock {
    storage: Option<StorageHandle>,
    predicate: ScanPredicate,
    metrics: MetricsHandle,
    latency: LatencyModel,
    rows_scanned: u64,
    rows_returned: u64,
}

impl SequentialScanBlock {
    pub fn new() -> Self {
        Self {
            storage: None,
            predicate: ScanPredicate::None,
            metrics: MetricsHandle::detached("sequential_scan"),
            latency: LatencyModel::default(),
            rows_scanned: 0,
            rows_returned: 0,
        }
    }

    pub fn definition() -> BlockDefinition {
        BlockDefinition {
            kind: BlockKind::SequentialScan,
            metadata: Self::build_metadata(),
            inputs: Self::build_inputs(),
            outputs: vec![rows_output()],
            parameters: Self::build_parameters(),
            constraints: vec![DependencyConstraint::upstream_category(
                BlockCategory::Storage,
                "A sequential scan reads the pages of a storage block",
            )],
            capabilities: BTreeSet::new(),
            capability_requirements: Vec::new(),
            metrics: Self::build_metrics(),
            entry: false,
        }
    }

    // -- Metadata builders ---------------------------------------------------

    fn build_metadata() -> BlockMetadata {
        BlockMetadata {
            id: "sequential_scan".into(),
            name: "Sequential Scan".into(),
            category: BlockCategory::QueryExecution,
            description: "Full table scan reading every page in physical order".into(),
            version: "1.0.0".into(),
            documentation: BlockDocumentation {
                overview: "A sequential scan reads every page of a table from start to end. \
                           It needs no index and benefits from sequential I/O, but its cost \
                           grows with the table regardless of how many rows match."
                    .into(),
                algorithm: "For each page in physical order: use the buffered image or read \
                            the page, then evaluate the predicate on every row. Finally scan \
                            memory-resident rows."
                    .into(),
                complexity: Complexity {
                    time: "O(n) rows, O(P) page reads".into(),
                    space: "O(1) beyond the output".into(),
                },
                use_cases: vec![
                    "Queries touching a large fraction of the table".into(),
                    "Tables without a suitable index".into(),
                ],
                tradeoffs: vec![
                    "Cost independent of selectivity".into(),
                    "Large scans flood LRU buffer pools".into(),
                ],
            },
            references: vec![Reference {
                ref_type: ReferenceType::Book,
                title: "Database System Concepts, Chapter 15: Query Processing".into(),
                citation: Some(
                    "Silberschatz, A., Korth, H. F., Sudarshan, S. (2019). McGraw-Hill.".into(),
                ),
            }],
        }
    }

    fn build_inputs() -> Vec<Port> {
        vec![Port::input("pages", "Pages", PortType::PageStream, DataType::PageRef)
            .required()
            .with_description("Table pages in physical order")]
    }

    fn build_parameters() -> Vec<Parameter> {
        vec![Parameter::enumeration("predicate", "Predicate", "none", &["none", "key"])
            .with_description("Return every row, or only rows matching the request key")]
    }

    fn build_metrics() -> Vec<MetricDefinition> {
        vec![
            MetricDefinition::counter("rows_scanned", "rows", "Total rows examined"),
            MetricDefinition::counter("rows_returned", "rows", "Rows that passed the predicate"),
            MetricDefinition::counter("pages_scanned", "pages", "Pages visited"),
            MetricDefinition::gauge("selectivity", "ratio", "rows_returned / rows_scanned"),
        ]
    }

    // -- Core operations -----------------------------------------------------

    fn keep(&self, ctx: &ExecutionContext, record: &Record) -> bool {
        match self.predicate {
            ScanPredicate::None => true,
            ScanPredicate::Key => {
                self.metrics.charge(self.latency.cpu_compare_us);
                ctx.request.matches_key(record.key)
            }
        }
    }
}

impl Default for SequentialScanBlock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Block for SequentialScanBlock {
    fn kind(&self) -> BlockKind {
        BlockKind::SequentialScan
    }

    async fn initialize(&mut self, ctx: InitContext) -> Result<(), BlockError> {
        self.storage = Some(ctx.require_storage()?);
        self.predicate = match ctx.string("predicate")?.as_str() {
            "key" => ScanPredicate::Key,
            _ => ScanPredicate::None,
        };
        self.latency = ctx.latency;
        self.metrics = ctx.metrics;
        self.rows_scanned = 0;
        self.rows_returned = 0;
        Ok(())
    }

    async fn execute(&mut self, mut ctx: ExecutionContext) -> Result<ExecutionResult, BlockError> {
        let pages = ctx.take("pages").into_pages();
        if !ctx.request.is_select() {
            return Ok(ExecutionResult::empty());
        }
        let Some(storage) = self.storage.clone() else {
            return Err(BlockError::Initialization("sequential scan has no storage".into()));
        };

        let mut scanned = 0u64;
        let mut rows = Vec::new();
        for page in &pages {
            let records = match &page.records {
                Some(image) => image.clone(),
                None => storage.read_page(page.id),
            };
            for record in records {
                scanned += 1;
                if self.keep(&ctx, &record) {
                    rows.push(record);
                }
            }
        }
        for record in storage.memory_resident() {
            scanned += 1;
            if self.keep(&ctx, &record) {
                rows.push(record);
            }
        }

        self.rows_scanned += scanned;
        self.rows_returned += rows.len() as u64;
        self.metrics.counter("pages_scanned", pages.len() as f64);
        self.metrics.counter("rows_scanned", scanned as f64);
        self.metrics.counter("rows_returned", rows.len() as f64);

        Ok(ExecutionResult::empty().with_output("rows", PortValue::Records(rows)))
    }

    fn snapshot_metrics(&self) -> BTreeMap<String, f64> {
        let mut gauges = BTreeMap::new();
        let selectivity = if self.rows_scanned == 0 {
            0.0
        } else {
            self.rows_returned as f64 / self.rows_scanned as f64
        };
        gauges.insert("selectivity".into(), selectivity);
        gauges
    }

    fn get_state(&self) -> BlockState {
        let mut state = BlockState::new();
        let _ = state.insert("rows_scanned", self.rows_scanned);
        let _ = state.insert("rows_returned", self.rows_returned);
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categories::buffer::test_pages;
    use crate::categories::test_support::{build, request};
    use crate::categories::PageId;
    use crate::core::block::OperationType;
    use crate::core::metrics::MetricsSink;
    use crate::core::port::PageRef;

    fn page_list(n: u64) -> PortValue {
        PortValue::Pages((0..n).map(|i| PageRef::new(PageId(i))).collect())
    }

    #[tokio::test]
    async fn test_full_scan_reads_every_page() {
        let sink = MetricsSink::new(false);
        let storage = test_pages::handle(5, &sink);
        let mut block = build(BlockKind::SequentialScan, "scan", &[], &sink, Some(storage)).await;

        let ctx = ExecutionContext::new(request(1, OperationType::Select, 0))
            .with_input("pages", page_list(5));
        let result = block.execute(ctx).await.unwrap();

        let rows = result.output("rows").unwrap().clone().into_records();
        assert_eq!(rows.iter().map(|r| r.key).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
        assert_eq!(sink.counter(&"disk".into(), "pages_read"), 5.0);
        assert_eq!(sink.counter(&"scan".into(), "rows_scanned"), 5.0);
    }

    #[tokio::test]
    async fn test_buffered_images_skip_storage_reads() {
        let sink = MetricsSink::new(false);
        let storage = test_pages::handle(3, &sink);
        let mut block = build(BlockKind::SequentialScan, "scan", &[], &sink, Some(storage)).await;

        let pages = (0..3)
            .map(|i| PageRef {
                id: PageId(i),
                records: Some(vec![Record::new(i as i64)]),
            })
            .collect();
        let ctx = ExecutionContext::new(request(1, OperationType::Select, 0))
            .with_input("pages", PortValue::Pages(pages));
        block.execute(ctx).await.unwrap();

        assert_eq!(sink.counter(&"disk".into(), "pages_read"), 0.0);
    }

    #[tokio::test]
    async fn test_key_predicate_filters_but_scans_all() {
        let sink = MetricsSink::new(false);
        let storage = test_pages::handle(6, &sink);
        let mut block = build(
            BlockKind::SequentialScan,
            "scan",
            &[("predicate", "key".into())],
            &sink,
            Some(storage),
        )
        .await;

        let ctx = ExecutionContext::new(request(1, OperationType::Select, 2).with_range(2))
            .with_input("pages", page_list(6));
        let result = block.execute(ctx).await.unwrap();

        let rows = result.output("rows").unwrap().clone().into_records();
        assert_eq!(rows.iter().map(|r| r.key).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(sink.counter(&"scan".into(), "rows_scanned"), 6.0);
        assert!((block.snapshot_metrics()["selectivity"] - 1.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_writes_pass_by() {
        let sink = MetricsSink::new(false);
        let storage = test_pages::handle(2, &sink);
        let mut block = build(BlockKind::SequentialScan, "scan", &[], &sink, Some(storage)).await;

        let ctx = ExecutionContext::new(request(1, OperationType::Insert, 0))
            .with_input("pages", page_list(2));
        let result = block.execute(ctx).await.unwrap();
        assert!(result.outputs.is_empty());
        assert_eq!(sink.counter(&"disk".into(), "pages_read"), 0.0);
    }
}
