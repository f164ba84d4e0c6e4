//! End-to-end runs of complete designs

use std::sync::Arc;

use super::support::*;
use crate::core::registry::BlockRegistry;
use crate::runtime::config::SimulationConfig;
use crate::runtime::simulation::{SimulationStatus, Simulator};
use crate::runtime::workload::{OperationMix, OperationType, Workload};

fn simulator(config: SimulationConfig) -> Simulator {
    Simulator::new(Arc::new(BlockRegistry::with_builtin_blocks()), config)
}

#[tokio::test]
async fn test_indexed_point_selects() {
    let sim = Simulator::with_defaults();
    let g = indexed_heap(&sim);
    let result = sim.run(&g, &load_then_select(10_000, 1_000)).await;

    assert_eq!(result.status, SimulationStatus::Completed);
    assert!(result.validation_errors.is_empty());
    assert!(result.failures.is_empty(), "{:?}", &result.failures[..1]);

    let s = &result.summary;
    assert_eq!(s.completed_operations, 11_000);
    assert!(s.total_pages_written > 0.0);

    let btree = result.block(&"btree".into()).unwrap();
    assert_eq!(btree.counter("btree_lookups"), 1_000.0);
    assert_eq!(btree.histograms["pages_traversed"].count, 1_000);

    // Every point select finds its row.
    let scan = result.block(&"scan".into()).unwrap();
    assert_eq!(scan.counter("index_hits"), 1_000.0);
}

#[tokio::test]
async fn test_full_scan_returns_every_insert() {
    let sim = Simulator::with_defaults();
    let result = sim
        .run(&scanned_heap(&sim), &load_then_select(750, 1))
        .await;

    let scan = result.block(&"scan".into()).unwrap();
    assert_eq!(scan.counter("rows_returned"), 750.0);
    assert_eq!(scan.counter("rows_scanned"), 750.0);

    let heap = result.block(&"heap".into()).unwrap();
    let pages = heap.gauge("total_pages").unwrap();
    assert_eq!(scan.counter("pages_scanned"), pages);
    // The scan read every page through the heap.
    assert_eq!(heap.counter("pages_read"), pages);
}

#[tokio::test]
async fn test_full_scan_over_lsm_includes_memtable() {
    let sim = Simulator::with_defaults();
    let mut g = sim.new_graph();
    add(&mut g, "schema", "schema");
    add_with(
        &mut g,
        "lsm",
        "lsm_storage",
        &[("memtable_size", 16i64.into()), ("max_runs", 2i64.into())],
    );
    add(&mut g, "scan", "sequential_scan");
    wire(&mut g, "schema", "records", "lsm", "records");
    wire(&mut g, "lsm", "pages", "scan", "pages");

    // 100 is not a multiple of the memtable size, so some rows stay in memory.
    let result = sim.run(&g, &load_then_select(100, 1)).await;
    assert_eq!(result.status, SimulationStatus::Completed);

    let lsm = result.block(&"lsm".into()).unwrap();
    assert!(lsm.gauge("memtable_entries").unwrap() > 0.0);
    assert!(lsm.event_count("lsm_flush") > 0);

    let scan = result.block(&"scan".into()).unwrap();
    assert_eq!(scan.counter("rows_returned"), 100.0);
}

#[tokio::test]
async fn test_buffer_pool_serves_scan_pages() {
    let sim = Simulator::with_defaults();
    let mut g = sim.new_graph();
    add(&mut g, "schema", "schema");
    add(&mut g, "heap", "heap_storage");
    add(&mut g, "lru", "lru_buffer");
    add(&mut g, "scan", "sequential_scan");
    wire(&mut g, "schema", "records", "heap", "records");
    wire(&mut g, "heap", "pages", "lru", "pages");
    wire(&mut g, "lru", "pages", "scan", "pages");

    let result = sim.run(&g, &load_then_select(300, 3)).await;
    assert_eq!(result.status, SimulationStatus::Completed);

    let scan = result.block(&"scan".into()).unwrap();
    assert_eq!(scan.counter("rows_returned"), 900.0);
    let ratio = result.summary.cache_hit_ratio.unwrap();
    assert!(ratio > 0.0 && ratio <= 1.0);
}

#[tokio::test]
async fn test_same_seed_same_result() {
    let config = SimulationConfig::default().with_event_log(true);
    let sim = simulator(config);
    let g = indexed_heap(&sim);
    let workload = Workload::new(
        vec![
            OperationMix::new(OperationType::Insert, 60.0),
            OperationMix::new(OperationType::Select, 25.0),
            OperationMix::new(OperationType::Update, 10.0),
            OperationMix::new(OperationType::Delete, 5.0),
        ],
        2_000,
    )
    .with_concurrency(4)
    .with_zipfian(0.9);

    let a = sim.run(&g, &workload).await;
    let b = sim.run(&g, &workload).await;
    assert_eq!(a, b);
    assert!(!a.event_log.is_empty());
    assert!(a.event_log.windows(2).all(|w| w[0].seq < w[1].seq));

    let other = simulator(SimulationConfig::default().with_event_log(true).with_seed(7));
    let c = other.run(&g, &workload).await;
    assert_ne!(a.summary, c.summary);
}

#[tokio::test]
async fn test_parallel_runs_do_not_interfere() {
    let sim = Simulator::with_defaults();
    let g = indexed_heap(&sim);
    let workload = load_then_select(500, 200).with_concurrency(3);
    let expected = sim.run(&g, &workload).await;

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let sim = sim.clone();
            let g = g.clone();
            let workload = workload.clone();
            tokio::spawn(async move { sim.run(&g, &workload).await })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap(), expected);
    }
}

#[tokio::test]
async fn test_result_serializes_to_json() {
    let sim = Simulator::with_defaults();
    let result = sim
        .run(&indexed_heap(&sim), &load_then_select(50, 10))
        .await;
    let json = serde_json::to_value(&result).unwrap();

    assert_eq!(json["status"], "completed");
    assert_eq!(json["summary"]["completed_operations"], 60);
    assert!(json["block_metrics"]["btree"]["counters"]["btree_lookups"].is_number());
    assert!(json["summary"]["cache_hit_ratio"].is_null());
}

#[tokio::test]
async fn test_wal_group_commit_through_simulation() {
    let sim = Simulator::with_defaults();
    let mut g = sim.new_graph();
    add(&mut g, "schema", "schema");
    add_with(
        &mut g,
        "wal",
        "write_ahead_log",
        &[("group_commit_size", 4i64.into())],
    );
    add(&mut g, "heap", "heap_storage");
    wire(&mut g, "schema", "records", "wal", "records");
    wire(&mut g, "schema", "txn", "wal", "txn");
    wire(&mut g, "wal", "records", "heap", "records");

    let workload = Workload::new(only(OperationType::Insert), 40).with_ops_per_transaction(2);
    let result = sim.run(&g, &workload).await;
    assert_eq!(result.summary.committed_transactions, 20);

    let wal = result.block(&"wal".into()).unwrap();
    // One record per insert and one per commit.
    assert_eq!(wal.counter("log_records"), 60.0);
    assert_eq!(wal.counter("fsyncs"), 5.0);
    let heap = result.block(&"heap".into()).unwrap();
    assert_eq!(heap.gauge("live_records"), Some(40.0));
}

#[tokio::test]
async fn test_clustered_storage_scan_is_complete() -> anyhow::Result<()> {
    let sim = Simulator::with_defaults();
    let mut g = sim.new_graph();
    let schema = g.add_block_with_id("schema".into(), "schema", params(&[]))?;
    let table = g.add_block_with_id(
        "table".into(),
        "clustered_storage",
        params(&[("page_size", 512i64.into())]),
    )?;
    let scan = g.add_block_with_id("scan".into(), "sequential_scan", params(&[]))?;
    g.connect(&schema, "records", &table, "records")?;
    g.connect(&table, "pages", &scan, "pages")?;

    let result = sim.run(&g, &load_then_select(400, 1)).await;
    anyhow::ensure!(
        result.status == SimulationStatus::Completed,
        "run ended with {:?}: {:?}",
        result.status,
        result.error
    );

    let table = result
        .block(&table)
        .ok_or_else(|| anyhow::anyhow!("no metrics for the table"))?;
    assert!(table.counter("page_splits") > 0.0);
    assert!(table.gauge("tree_height").unwrap_or(0.0) >= 2.0);
    assert_eq!(table.gauge("live_records"), Some(400.0));
    assert_eq!(result.block(&scan).map(|m| m.counter("rows_returned")), Some(400.0));
    Ok(())
}
