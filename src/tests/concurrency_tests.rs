//! Snapshot isolation and lock-wait resolution, driven request by request

use std::sync::Arc;

use super::support::*;
use crate::core::block::{OperationType, Request, RequestKind};
use crate::core::metrics::MetricsSink;
use crate::core::TxnId;
use crate::runtime::config::SimulationConfig;
use crate::runtime::engine::{DispatchOutcome, ExecutionEngine};
use crate::runtime::graph::DraftGraph;
use crate::runtime::simulation::{SimulationStatus, Simulator};
use crate::runtime::workload::{OperationMix, Workload};

async fn engine(mut graph: DraftGraph) -> ExecutionEngine {
    let plan = Arc::new(graph.compile().unwrap());
    ExecutionEngine::initialize(plan, &SimulationConfig::default(), MetricsSink::new(true))
        .await
        .unwrap()
}

fn mvcc_heap(sim: &Simulator) -> DraftGraph {
    let mut g = sim.new_graph();
    add(&mut g, "schema", "schema");
    add(&mut g, "mvcc", "mvcc");
    add(&mut g, "heap", "heap_storage");
    wire(&mut g, "schema", "records", "mvcc", "records");
    wire(&mut g, "schema", "txn", "mvcc", "txn");
    wire(&mut g, "mvcc", "records", "heap", "records");
    g
}

/// `locked_heap` with a sequential scan over the heap's pages
fn locked_scanned_heap(sim: &Simulator) -> DraftGraph {
    let mut g = locked_heap(sim, true);
    add(&mut g, "scan", "sequential_scan");
    wire(&mut g, "heap", "pages", "scan", "pages");
    g
}

fn op(txn: u64, operation: OperationType, key: i64) -> Request {
    Request::operation(TxnId(txn), operation, key)
}

fn control(txn: u64, kind: RequestKind) -> Request {
    Request::control(TxnId(txn), kind)
}

/// Rows a select returned
fn rows(outcome: &DispatchOutcome) -> usize {
    match outcome {
        DispatchOutcome::Completed { rows } => *rows,
        other => panic!("expected completion, got {:?}", other),
    }
}

#[tokio::test]
async fn test_mvcc_reader_keeps_its_snapshot() {
    let sim = Simulator::with_defaults();
    let mut engine = engine(mvcc_heap(&sim)).await;

    engine.dispatch(control(1, RequestKind::Begin)).await;
    engine.dispatch(control(2, RequestKind::Begin)).await;
    engine.dispatch(op(1, OperationType::Insert, 5)).await;

    // Uncommitted: only the writer sees it.
    let own = engine.dispatch(op(1, OperationType::Select, 5)).await;
    assert_eq!(rows(&own.outcome), 1);
    let other = engine.dispatch(op(2, OperationType::Select, 5)).await;
    assert_eq!(rows(&other.outcome), 0);

    engine.dispatch(control(1, RequestKind::Commit)).await;

    // T2's snapshot predates the commit.
    let stale = engine.dispatch(op(2, OperationType::Select, 5)).await;
    assert_eq!(rows(&stale.outcome), 0);

    engine.dispatch(control(3, RequestKind::Begin)).await;
    let fresh = engine.dispatch(op(3, OperationType::Select, 5)).await;
    assert_eq!(rows(&fresh.outcome), 1);
}

#[tokio::test]
async fn test_mvcc_first_updater_wins() {
    let sim = Simulator::with_defaults();
    let mut engine = engine(mvcc_heap(&sim)).await;

    engine.dispatch(control(1, RequestKind::Begin)).await;
    engine.dispatch(op(1, OperationType::Insert, 9)).await;
    engine.dispatch(control(1, RequestKind::Commit)).await;

    engine.dispatch(control(2, RequestKind::Begin)).await;
    engine.dispatch(control(3, RequestKind::Begin)).await;
    let first = engine.dispatch(op(2, OperationType::Update, 9)).await;
    assert!(matches!(first.outcome, DispatchOutcome::Completed { .. }));

    let second = engine.dispatch(op(3, OperationType::Update, 9)).await;
    match second.outcome {
        DispatchOutcome::Failed { instance_id, error } => {
            assert_eq!(instance_id, "mvcc".into());
            assert_eq!(error.code(), "WriteConflict");
        }
        other => panic!("expected write conflict, got {:?}", other),
    }
}

#[tokio::test]
async fn test_deadlock_aborts_youngest_and_unblocks_the_other() {
    let sim = Simulator::with_defaults();
    let mut engine = engine(locked_heap(&sim, true)).await;

    engine.dispatch(control(1, RequestKind::Begin)).await;
    engine.dispatch(control(2, RequestKind::Begin)).await;
    engine.dispatch(op(1, OperationType::Insert, 1)).await;
    engine.dispatch(op(2, OperationType::Insert, 2)).await;

    let waiting = engine.dispatch(op(1, OperationType::Update, 2)).await;
    let suspended = match waiting.outcome {
        DispatchOutcome::Parked {
            waiting_for,
            suspended,
        } => {
            assert_eq!(waiting_for, vec![TxnId(2)]);
            suspended
        }
        other => panic!("expected park, got {:?}", other),
    };

    // Closing the cycle: T2 is the younger transaction.
    let closing = engine.dispatch(op(2, OperationType::Update, 1)).await;
    match closing.outcome {
        DispatchOutcome::Failed { error, .. } => assert_eq!(error.code(), "DeadlockDetected"),
        other => panic!("expected deadlock, got {:?}", other),
    }
    engine.dispatch(control(2, RequestKind::Abort)).await;

    let resumed = engine.resume(suspended).await;
    assert!(matches!(resumed.outcome, DispatchOutcome::Completed { .. }));

    let events = engine.sink().events();
    let deadlock = events.iter().find(|e| e.event_type == "deadlock").unwrap();
    assert_eq!(deadlock.payload["victim"], 2);
}

#[tokio::test]
async fn test_scan_returns_exactly_the_stored_row() {
    let sim = Simulator::with_defaults();
    let mut engine = engine(locked_scanned_heap(&sim)).await;

    engine.dispatch(control(1, RequestKind::Begin)).await;
    engine.dispatch(op(1, OperationType::Insert, 7)).await;
    engine.dispatch(control(1, RequestKind::Commit)).await;

    engine.dispatch(control(2, RequestKind::Begin)).await;
    let select = engine.dispatch(op(2, OperationType::Select, 7)).await;
    assert_eq!(rows(&select.outcome), 1);
}

#[tokio::test]
async fn test_aborted_insert_is_not_visible_to_later_scans() {
    let sim = Simulator::with_defaults();
    let mut engine = engine(locked_scanned_heap(&sim)).await;

    engine.dispatch(control(1, RequestKind::Begin)).await;
    engine.dispatch(op(1, OperationType::Insert, 3)).await;
    engine.dispatch(control(1, RequestKind::Commit)).await;

    engine.dispatch(control(2, RequestKind::Begin)).await;
    engine.dispatch(op(2, OperationType::Insert, 7)).await;
    engine.dispatch(op(2, OperationType::Delete, 3)).await;
    engine.dispatch(control(2, RequestKind::Abort)).await;

    engine.dispatch(control(3, RequestKind::Begin)).await;
    let select = engine.dispatch(op(3, OperationType::Select, 7)).await;
    // Only the committed row 3 is left.
    assert_eq!(rows(&select.outcome), 1);

    let heap = engine.block_state(&"heap".into()).unwrap();
    assert_eq!(heap.get::<usize>("live_records").unwrap(), Some(1));
}

#[tokio::test]
async fn test_deadlock_victim_writes_are_rolled_back() {
    let sim = Simulator::with_defaults();
    let mut engine = engine(locked_scanned_heap(&sim)).await;

    engine.dispatch(control(1, RequestKind::Begin)).await;
    engine.dispatch(control(2, RequestKind::Begin)).await;
    engine.dispatch(op(1, OperationType::Insert, 1)).await;
    engine.dispatch(op(2, OperationType::Insert, 2)).await;
    let waiting = engine.dispatch(op(1, OperationType::Select, 2)).await;
    assert!(matches!(waiting.outcome, DispatchOutcome::Parked { .. }));

    let closing = engine.dispatch(op(2, OperationType::Select, 1)).await;
    assert!(matches!(closing.outcome, DispatchOutcome::Failed { .. }));
    engine.dispatch(control(2, RequestKind::Abort)).await;
    engine.dispatch(control(1, RequestKind::Commit)).await;

    engine.dispatch(control(3, RequestKind::Begin)).await;
    let select = engine.dispatch(op(3, OperationType::Select, 2)).await;
    // T1's row survives; the victim's insert is gone.
    assert_eq!(rows(&select.outcome), 1);
}

#[tokio::test]
async fn test_contended_run_terminates_with_deadlock_detection() {
    let sim = Simulator::with_defaults();
    let g = locked_heap(&sim, true);
    let workload = Workload::new(only(OperationType::Insert), 4)
        .then(vec![OperationMix::new(OperationType::Update, 100.0)], 400)
        .with_concurrency(6)
        .with_ops_per_transaction(3);

    let mut run = sim.prepare(&g, &workload).await.unwrap();
    let mut steps = 0usize;
    while run.step().await {
        steps += 1;
        assert!(steps < 100_000, "run did not terminate");
    }
    let result = run.finalize();

    assert_eq!(result.status, SimulationStatus::Completed);
    let s = &result.summary;
    assert_eq!(s.completed_operations + s.failed_operations, 404);
    assert!(s.committed_transactions > 0);
    assert!(result
        .failures
        .iter()
        .all(|f| f.code == "DeadlockDetected" || f.code == "Stalled"));
    let locks = result.block(&"locks".into()).unwrap();
    assert!(locks.counter("lock_waits") > 0.0);
    // Strict 2PL: nothing is held once every transaction has ended.
    assert_eq!(locks.gauge("active_locks"), Some(0.0));
}

#[tokio::test]
async fn test_uncontended_streams_never_wait() {
    let sim = Simulator::with_defaults();
    let g = locked_heap(&sim, true);
    let workload = Workload::new(only(OperationType::Insert), 300).with_concurrency(5);
    let result = sim.run(&g, &workload).await;

    assert_eq!(result.summary.completed_operations, 300);
    assert_eq!(result.summary.failed_operations, 0);
    let locks = result.block(&"locks".into()).unwrap();
    assert_eq!(locks.counter("lock_waits"), 0.0);
    assert_eq!(locks.counter("locks_acquired"), 300.0);
}
