//! Simulation orchestrator
//!
//! Validates and compiles a design, initializes fresh block state, drives the
//! workload through the plan and aggregates the collector into a
//! [`SimulationResult`].
//!
//! ## Scheduling
//!
//! Dispatch is cooperative and single-threaded. Each logical stream issues
//! `begin`, up to `ops_per_transaction` operations, then `commit`; streams
//! take turns round-robin, one request per step. A request parked on a lock
//! is kept with its data bus and retried once any transaction commits or
//! aborts. When no stream can make progress (or `stall_limit` consecutive
//! steps re-park) the most recently started parked transaction is aborted.
//!
//! A failed operation aborts its transaction; the stream carries on with a
//! new one. Failures are recorded, never fatal to the run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::block::{BlockState, Request, RequestKind};
use crate::core::metrics::{BlockMetricsReport, HistogramSummary, MetricEvent, MetricsSink};
use crate::core::registry::BlockRegistry;
use crate::core::{InstanceId, TxnId};

use super::config::SimulationConfig;
use super::engine::{DispatchOutcome, DispatchReport, ExecutionEngine, InitError, Suspended};
use super::graph::{DraftGraph, GraphError, GraphSpec};
use super::plan::ExecutionPlan;
use super::validation::ValidationError;
use super::workload::{Workload, WorkloadError, WorkloadGenerator};

// ── Result types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimulationStatus {
    Completed,
    Failed,
    Cancelled,
}

/// An operation a block rejected
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationFailure {
    /// Workload position of the operation, if one was in flight
    pub seq: Option<u64>,
    pub stream: u32,
    pub txn: TxnId,
    /// Block that raised the error, if a block did
    pub instance_id: Option<InstanceId>,
    pub code: String,
    pub message: String,
}

/// Latency percentiles over completed operations, in simulated microseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub mean_us: f64,
    pub p50_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
}

/// System-wide aggregates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationSummary {
    pub total_operations: usize,
    pub completed_operations: usize,
    pub failed_operations: usize,
    pub committed_transactions: usize,
    pub aborted_transactions: usize,
    /// Simulated time the run took
    pub elapsed_us: f64,
    /// Completed operations per simulated second
    pub throughput_ops_per_sec: f64,
    pub latency: LatencySummary,
    pub total_pages_read: f64,
    pub total_pages_written: f64,
    /// `None` when no buffer pool saw a request
    pub cache_hit_ratio: Option<f64>,
}

/// Final output of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub status: SimulationStatus,
    pub summary: SimulationSummary,
    pub block_metrics: BTreeMap<InstanceId, BlockMetricsReport>,
    pub failures: Vec<OperationFailure>,
    pub validation_errors: Vec<ValidationError>,
    /// Why the run could not start, for failed runs
    pub error: Option<String>,
    /// Ordered trace events, when the config asks for them
    pub event_log: Vec<MetricEvent>,
}

impl SimulationResult {
    fn failed(error: &PrepareError) -> Self {
        Self {
            status: SimulationStatus::Failed,
            summary: SimulationSummary::default(),
            block_metrics: BTreeMap::new(),
            failures: Vec::new(),
            validation_errors: match error {
                PrepareError::Invalid(errors) => errors.clone(),
                _ => Vec::new(),
            },
            error: Some(error.to_string()),
            event_log: Vec::new(),
        }
    }

    /// Metrics of one block instance
    pub fn block(&self, instance_id: &InstanceId) -> Option<&BlockMetricsReport> {
        self.block_metrics.get(instance_id)
    }
}

/// Why a run could not start
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PrepareError {
    #[error("Graph failed validation with {} error(s)", .0.len())]
    Invalid(Vec<ValidationError>),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Initialization(#[from] InitError),

    #[error("Invalid workload: {0}")]
    Workload(#[from] WorkloadError),
}

// ── Cancellation ────────────────────────────────────────────────────────────

/// Stops a run from another task; the run finishes its current step
#[derive(Debug, Clone, Default)]
pub struct CancellationHandle {
    flag: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// ── Simulator ───────────────────────────────────────────────────────────────

/// Entry point: owns the registry and run settings, shareable across tasks
#[derive(Clone)]
pub struct Simulator {
    registry: Arc<BlockRegistry>,
    config: SimulationConfig,
}

impl Simulator {
    pub fn new(registry: Arc<BlockRegistry>, config: SimulationConfig) -> Self {
        Self { registry, config }
    }

    /// Simulator over every built-in block with default settings
    pub fn with_defaults() -> Self {
        Self::new(
            Arc::new(BlockRegistry::with_builtin_blocks()),
            SimulationConfig::default(),
        )
    }

    pub fn registry(&self) -> &Arc<BlockRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// A draft graph over this simulator's registry
    pub fn new_graph(&self) -> DraftGraph {
        DraftGraph::new(Arc::clone(&self.registry))
    }

    /// Validate, compile and initialize, ready for stepping
    pub async fn prepare(
        &self,
        graph: &DraftGraph,
        workload: &Workload,
    ) -> Result<SimulationRun, PrepareError> {
        let generator = WorkloadGenerator::new(workload, self.config.seed)?;
        let plan = ExecutionPlan::compile(graph)
            .map_err(|e| PrepareError::Invalid(e.validation_errors().to_vec()))?;

        let sink = MetricsSink::new(self.config.capture_event_log);
        let engine = ExecutionEngine::initialize(Arc::new(plan), &self.config, sink).await?;
        Ok(SimulationRun::new(engine, generator, workload, self.config.clone()))
    }

    /// Run `workload` against `graph` to completion
    pub async fn run(&self, graph: &DraftGraph, workload: &Workload) -> SimulationResult {
        match self.prepare(graph, workload).await {
            Ok(run) => run.run_to_end().await,
            Err(error) => {
                tracing::warn!(%error, "simulation could not start");
                SimulationResult::failed(&error)
            }
        }
    }

    /// Import `spec` and run it
    pub async fn run_spec(&self, spec: &GraphSpec, workload: &Workload) -> SimulationResult {
        match DraftGraph::from_spec(Arc::clone(&self.registry), spec) {
            Ok(graph) => self.run(&graph, workload).await,
            Err(error) => SimulationResult::failed(&PrepareError::Graph(error)),
        }
    }
}

// ── Run state ───────────────────────────────────────────────────────────────

/// An operation that is part-way through the plan
#[derive(Debug, Clone)]
struct InFlight {
    seq: u64,
    started_us: f64,
    suspended: Suspended,
}

#[derive(Debug, Clone)]
enum StreamState {
    /// Between transactions
    Idle,
    Active { txn: TxnId, ops_done: usize },
    Parked {
        txn: TxnId,
        ops_done: usize,
        op: InFlight,
        /// A commit or abort happened since it parked
        woken: bool,
    },
    Done,
}

impl StreamState {
    fn txn(&self) -> Option<TxnId> {
        match self {
            StreamState::Active { txn, .. } | StreamState::Parked { txn, .. } => Some(*txn),
            _ => None,
        }
    }

    fn is_runnable(&self) -> bool {
        match self {
            StreamState::Done => false,
            StreamState::Parked { woken, .. } => *woken,
            _ => true,
        }
    }
}

/// A live run that can be stepped and inspected
pub struct SimulationRun {
    engine: ExecutionEngine,
    generator: WorkloadGenerator,
    config: SimulationConfig,
    streams: Vec<StreamState>,
    ops_per_transaction: usize,
    cursor: usize,
    next_txn: u64,
    next_request_seq: u64,
    idle_steps: usize,
    cancel: CancellationHandle,
    cancelled: bool,
    total_operations: usize,
    completed: usize,
    failed: usize,
    committed: usize,
    aborted: usize,
    latencies: Vec<f64>,
    failures: Vec<OperationFailure>,
}

impl SimulationRun {
    fn new(
        engine: ExecutionEngine,
        generator: WorkloadGenerator,
        workload: &Workload,
        config: SimulationConfig,
    ) -> Self {
        tracing::info!(
            blocks = engine.plan().len(),
            operations = workload.operation_count(),
            streams = workload.concurrency,
            seed = config.seed,
            "simulation started"
        );
        Self {
            engine,
            generator,
            config,
            streams: vec![StreamState::Idle; workload.concurrency],
            ops_per_transaction: workload.ops_per_transaction,
            cursor: 0,
            next_txn: 1,
            next_request_seq: 0,
            idle_steps: 0,
            cancel: CancellationHandle::default(),
            cancelled: false,
            total_operations: workload.operation_count(),
            completed: 0,
            failed: 0,
            committed: 0,
            aborted: 0,
            latencies: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn cancel_handle(&self) -> CancellationHandle {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.cancelled || self.streams.iter().all(|s| matches!(s, StreamState::Done))
    }

    /// State of one block, for step-through inspection
    pub fn block_state(&self, instance_id: &InstanceId) -> Option<BlockState> {
        self.engine.block_state(instance_id)
    }

    pub fn plan(&self) -> &ExecutionPlan {
        self.engine.plan()
    }

    pub fn completed_operations(&self) -> usize {
        self.completed
    }

    /// Advance one stream by one request; `false` once the run is over
    pub async fn step(&mut self) -> bool {
        if self.is_finished() {
            return false;
        }
        if self.cancel.is_cancelled() {
            self.cancelled = true;
            tracing::info!(completed = self.completed, "simulation cancelled");
            return false;
        }

        let Some(stream) = self.next_runnable() else {
            // Everything left is parked on something that will never finish.
            self.break_stall().await;
            return !self.is_finished();
        };

        let state = std::mem::replace(&mut self.streams[stream], StreamState::Done);
        match state {
            StreamState::Idle => {
                if self.generator.is_exhausted() {
                    self.streams[stream] = StreamState::Done;
                } else {
                    let txn = TxnId(self.next_txn);
                    self.next_txn += 1;
                    self.streams[stream] = StreamState::Active { txn, ops_done: 0 };
                    let report = self.control(stream, txn, RequestKind::Begin).await;
                    let claimed = self.claim_victims(report.aborted_txns);
                    self.abort_all(claimed).await;
                }
            }
            StreamState::Active { txn, ops_done } => {
                if ops_done >= self.ops_per_transaction || self.generator.is_exhausted() {
                    self.streams[stream] = StreamState::Idle;
                    let report = self.control(stream, txn, RequestKind::Commit).await;
                    self.idle_steps = 0;
                    self.wake_parked();
                    let mut to_abort = Vec::new();
                    match report.outcome {
                        DispatchOutcome::Failed { instance_id, error } => {
                            // A rejected commit leaves the transaction to be rolled back.
                            self.record_failure(OperationFailure {
                                seq: None,
                                stream: stream as u32,
                                txn,
                                instance_id: Some(instance_id),
                                code: error.code().to_string(),
                                message: error.to_string(),
                            });
                            to_abort.push((stream, txn));
                        }
                        _ => self.committed += 1,
                    }
                    to_abort.extend(self.claim_victims(report.aborted_txns));
                    self.abort_all(to_abort).await;
                } else if let Some(op) = self.generator.next_operation() {
                    let request = Request {
                        seq: self.take_request_seq(),
                        stream: stream as u32,
                        txn,
                        kind: RequestKind::Operation(op.operation),
                        key: op.key,
                        range_width: op.range_width,
                        payload_bytes: op.payload_bytes,
                    };
                    let started_us = self.engine.sink().now_us();
                    let report = self.engine.dispatch(request).await;
                    self.settle(stream, txn, ops_done, op.seq, started_us, report)
                        .await;
                } else {
                    self.streams[stream] = StreamState::Active { txn, ops_done };
                }
            }
            StreamState::Parked {
                txn, ops_done, op, ..
            } => {
                let report = self.engine.resume(op.suspended).await;
                self.settle(stream, txn, ops_done, op.seq, op.started_us, report)
                    .await;
            }
            StreamState::Done => {}
        }

        self.cursor = (stream + 1) % self.streams.len();
        if self.idle_steps >= self.config.stall_limit {
            self.break_stall().await;
        }
        !self.is_finished()
    }

    /// Step until finished or cancelled
    pub async fn run_to_end(mut self) -> SimulationResult {
        while self.step().await {}
        self.finalize()
    }

    /// Aggregate the collector; valid at any point of the run
    pub fn finalize(self) -> SimulationResult {
        self.engine.record_gauges();
        let sink = self.engine.sink();

        let elapsed_us = sink.now_us();
        let throughput = if elapsed_us > 0.0 {
            self.completed as f64 / (elapsed_us / 1_000_000.0)
        } else {
            0.0
        };
        let hist = HistogramSummary::from_values(&self.latencies);
        let hits = sink.counter_total("cache_hits");
        let misses = sink.counter_total("cache_misses");
        let cache_hit_ratio = (hits + misses > 0.0).then(|| hits / (hits + misses));

        let status = if self.cancelled {
            SimulationStatus::Cancelled
        } else {
            SimulationStatus::Completed
        };
        let summary = SimulationSummary {
            total_operations: self.total_operations,
            completed_operations: self.completed,
            failed_operations: self.failed,
            committed_transactions: self.committed,
            aborted_transactions: self.aborted,
            elapsed_us,
            throughput_ops_per_sec: throughput,
            latency: LatencySummary {
                mean_us: hist.mean,
                p50_us: hist.p50,
                p95_us: hist.p95,
                p99_us: hist.p99,
            },
            total_pages_read: sink.counter_total("pages_read"),
            total_pages_written: sink.counter_total("pages_written"),
            cache_hit_ratio,
        };

        tracing::info!(
            ?status,
            completed = summary.completed_operations,
            failed = summary.failed_operations,
            elapsed_us,
            "simulation finished"
        );
        SimulationResult {
            status,
            summary,
            block_metrics: sink.snapshot(),
            failures: self.failures,
            validation_errors: Vec::new(),
            error: None,
            event_log: if sink.captures_events() {
                sink.events()
            } else {
                Vec::new()
            },
        }
    }

    // -- Scheduling ----------------------------------------------------------

    fn next_runnable(&self) -> Option<usize> {
        let n = self.streams.len();
        (0..n)
            .map(|offset| (self.cursor + offset) % n)
            .find(|&i| self.streams[i].is_runnable())
    }

    fn take_request_seq(&mut self) -> u64 {
        let seq = self.next_request_seq;
        self.next_request_seq += 1;
        seq
    }

    fn wake_parked(&mut self) {
        for state in &mut self.streams {
            if let StreamState::Parked { woken, .. } = state {
                *woken = true;
            }
        }
    }

    /// Dispatch a begin/commit/abort for `txn`
    async fn control(&mut self, stream: usize, txn: TxnId, kind: RequestKind) -> DispatchReport {
        let mut request = Request::control(txn, kind);
        request.seq = self.take_request_seq();
        request.stream = stream as u32;
        let report = self.engine.dispatch(request).await;
        if let DispatchOutcome::Failed { instance_id, error } = &report.outcome {
            tracing::warn!(%txn, ?kind, %instance_id, %error, "transaction signal rejected");
        }
        report
    }

    /// Apply the outcome of an operation dispatch for `stream`
    async fn settle(
        &mut self,
        stream: usize,
        txn: TxnId,
        ops_done: usize,
        seq: u64,
        started_us: f64,
        report: DispatchReport,
    ) {
        let mut to_abort = Vec::new();
        match report.outcome {
            DispatchOutcome::Completed { .. } => {
                self.idle_steps = 0;
                self.completed += 1;
                self.latencies.push(self.engine.sink().now_us() - started_us);
                self.streams[stream] = StreamState::Active {
                    txn,
                    ops_done: ops_done + 1,
                };
            }
            DispatchOutcome::Parked {
                waiting_for,
                suspended,
            } => {
                self.idle_steps += 1;
                tracing::trace!(%txn, ?waiting_for, "request parked");
                self.streams[stream] = StreamState::Parked {
                    txn,
                    ops_done,
                    op: InFlight {
                        seq,
                        started_us,
                        suspended,
                    },
                    woken: false,
                };
            }
            DispatchOutcome::Failed { instance_id, error } => {
                self.idle_steps = 0;
                self.failed += 1;
                self.record_failure(OperationFailure {
                    seq: Some(seq),
                    stream: stream as u32,
                    txn,
                    instance_id: Some(instance_id),
                    code: error.code().to_string(),
                    message: error.to_string(),
                });
                self.streams[stream] = StreamState::Idle;
                to_abort.push((stream, txn));
            }
        }
        to_abort.extend(self.claim_victims(report.aborted_txns));
        self.abort_all(to_abort).await;
    }

    /// Take over the streams of transactions a block already rolled back
    /// (deadlock victims). A parked operation of a victim counts as failed.
    fn claim_victims(&mut self, victims: Vec<TxnId>) -> Vec<(usize, TxnId)> {
        let mut claimed = Vec::new();
        for victim in victims {
            let Some(stream) = self.streams.iter().position(|s| s.txn() == Some(victim)) else {
                continue;
            };
            let state = std::mem::replace(&mut self.streams[stream], StreamState::Idle);
            if let StreamState::Parked { op, .. } = state {
                self.failed += 1;
                self.record_failure(OperationFailure {
                    seq: Some(op.seq),
                    stream: stream as u32,
                    txn: victim,
                    instance_id: None,
                    code: "DeadlockDetected".into(),
                    message: format!("{} aborted as a deadlock victim", victim),
                });
            }
            claimed.push((stream, victim));
        }
        claimed
    }

    /// Send an abort for each transaction; their streams start afresh.
    /// Aborts may surface further victims, which join the worklist.
    async fn abort_all(&mut self, mut pending: Vec<(usize, TxnId)>) {
        if pending.is_empty() {
            return;
        }
        while let Some((stream, txn)) = pending.pop() {
            let report = self.control(stream, txn, RequestKind::Abort).await;
            self.aborted += 1;
            self.streams[stream] = StreamState::Idle;
            pending.extend(self.claim_victims(report.aborted_txns));
        }
        self.wake_parked();
    }

    /// Abort the youngest parked transaction so the others can move
    async fn break_stall(&mut self) {
        let youngest = self
            .streams
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                StreamState::Parked { txn, op, .. } => Some((*txn, i, op.seq)),
                _ => None,
            })
            .max();
        let Some((txn, stream, seq)) = youngest else {
            return;
        };

        tracing::warn!(%txn, idle_steps = self.idle_steps, "stall detected, aborting youngest waiter");
        self.idle_steps = 0;
        self.failed += 1;
        self.record_failure(OperationFailure {
            seq: Some(seq),
            stream: stream as u32,
            txn,
            instance_id: None,
            code: "Stalled".into(),
            message: format!("{} aborted to break a stall", txn),
        });
        self.streams[stream] = StreamState::Idle;
        self.abort_all(vec![(stream, txn)]).await;
    }

    fn record_failure(&mut self, failure: OperationFailure) {
        if self.failures.len() < self.config.max_failures_recorded {
            self.failures.push(failure);
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categories::BlockKind;
    use crate::core::block::{
        Block, BlockError, ExecutionContext, ExecutionResult, InitContext,
    };
    use crate::core::parameter::{ParameterSet, ParameterValue};
    use crate::runtime::config::LatencyModel;
    use async_trait::async_trait;
    use crate::runtime::workload::{OperationMix, OperationType};

    fn heap_graph(sim: &Simulator) -> DraftGraph {
        let mut g = sim.new_graph();
        let schema = g.add_block_with_id("schema".into(), "schema", ParameterSet::new()).unwrap();
        let heap = g.add_block_with_id("heap".into(), "heap_storage", ParameterSet::new()).unwrap();
        g.connect(&schema, "records", &heap, "records").unwrap();
        g
    }

    fn inserts(n: usize) -> Workload {
        Workload::new(vec![OperationMix::new(OperationType::Insert, 100.0)], n)
    }

    #[tokio::test]
    async fn test_run_completes_and_counts() {
        let sim = Simulator::with_defaults();
        let result = sim.run(&heap_graph(&sim), &inserts(100)).await;

        assert_eq!(result.status, SimulationStatus::Completed);
        let summary = &result.summary;
        assert_eq!(summary.total_operations, 100);
        assert_eq!(summary.completed_operations, 100);
        assert_eq!(summary.failed_operations, 0);
        assert_eq!(summary.committed_transactions, 100);
        assert_eq!(summary.total_pages_written, 100.0);
        assert!(summary.elapsed_us > 0.0);
        assert!(summary.throughput_ops_per_sec > 0.0);
        assert!(summary.latency.p50_us >= LatencyModel::default().page_write_us);
        assert_eq!(summary.cache_hit_ratio, None);

        let heap = result.block(&"heap".into()).unwrap();
        assert_eq!(heap.gauge("live_records"), Some(100.0));
        assert!(result.event_log.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_graph_fails_with_errors() {
        let sim = Simulator::with_defaults();
        let mut g = sim.new_graph();
        g.add_block("heap_storage", ParameterSet::new()).unwrap();

        let result = sim.run(&g, &inserts(10)).await;
        assert_eq!(result.status, SimulationStatus::Failed);
        assert!(!result.validation_errors.is_empty());
        assert!(result.error.is_some());
        assert_eq!(result.summary.completed_operations, 0);
    }

    #[tokio::test]
    async fn test_invalid_workload_fails() {
        let sim = Simulator::with_defaults();
        let workload = inserts(10).with_concurrency(0);
        let err = sim.prepare(&heap_graph(&sim), &workload).await.err().unwrap();
        assert_eq!(err, PrepareError::Workload(WorkloadError::InvalidConcurrency));
    }

    #[tokio::test]
    async fn test_cancellation_keeps_completed_work() {
        let sim = Simulator::with_defaults();
        let mut run = sim.prepare(&heap_graph(&sim), &inserts(1000)).await.unwrap();
        let handle = run.cancel_handle();

        for _ in 0..30 {
            assert!(run.step().await);
        }
        handle.cancel();
        assert!(!run.step().await);
        assert!(run.is_finished());

        let completed = run.completed_operations();
        let result = run.finalize();
        assert_eq!(result.status, SimulationStatus::Cancelled);
        assert_eq!(result.summary.completed_operations, completed);
        assert!(completed > 0 && completed < 1000);
        let heap = result.block(&"heap".into()).unwrap();
        assert_eq!(heap.gauge("live_records"), Some(completed as f64));
    }

    #[tokio::test]
    async fn test_step_through_exposes_block_state() {
        let sim = Simulator::with_defaults();
        let mut run = sim.prepare(&heap_graph(&sim), &inserts(5)).await.unwrap();
        while run.step().await {}
        let state = run.block_state(&"heap".into()).unwrap();
        assert_eq!(state.get::<usize>("live_records").unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_failures_abort_transaction_and_run_continues() {
        let sim = Simulator::with_defaults();
        let mut g = heap_graph(&sim);
        let btree = g
            .add_block_with_id("btree".into(), "btree_index", ParameterSet::new())
            .unwrap();
        let scan = g
            .add_block_with_id("scan".into(), "index_scan", ParameterSet::new())
            .unwrap();
        g.connect(&"heap".into(), "stored", &btree, "records").unwrap();
        g.connect(&btree, "lookup_result", &scan, "lookup_result").unwrap();

        // A point-mode scan rejects every range probe.
        let workload = inserts(5).then(
            vec![OperationMix::new(OperationType::Select, 100.0).with_range(3)],
            5,
        );
        let result = sim.run(&g, &workload).await;

        assert_eq!(result.status, SimulationStatus::Completed);
        let s = &result.summary;
        assert_eq!(s.completed_operations, 5);
        assert_eq!(s.failed_operations, 5);
        assert_eq!(s.aborted_transactions, 5);
        assert_eq!(s.committed_transactions, 5);
        assert_eq!(result.failures.len(), 5);
        for failure in &result.failures {
            assert_eq!(failure.instance_id, Some(scan.clone()));
            assert_eq!(failure.code, "UnsupportedOperation");
        }
    }

    /// Runs the wrapped block but refuses every commit
    struct RefuseCommits(Box<dyn Block>);

    #[async_trait]
    impl Block for RefuseCommits {
        fn kind(&self) -> BlockKind {
            self.0.kind()
        }

        async fn initialize(&mut self, ctx: InitContext) -> Result<(), BlockError> {
            self.0.initialize(ctx).await
        }

        async fn execute(&mut self, ctx: ExecutionContext) -> Result<ExecutionResult, BlockError> {
            if ctx.request.kind == RequestKind::Commit {
                return Err(BlockError::InvalidInput("commit refused".into()));
            }
            self.0.execute(ctx).await
        }

        fn rollback_transaction(&mut self, txn: TxnId) {
            self.0.rollback_transaction(txn);
        }
    }

    #[tokio::test]
    async fn test_rejected_commit_aborts_instead_of_counting() {
        let sim = Simulator::with_defaults();
        let workload = inserts(4).with_ops_per_transaction(2);
        let mut run = sim.prepare(&heap_graph(&sim), &workload).await.unwrap();
        run.engine
            .wrap_block(&"schema".into(), |inner| Box::new(RefuseCommits(inner)));

        let result = run.run_to_end().await;
        let s = &result.summary;
        assert_eq!(s.completed_operations, 4);
        assert_eq!(s.failed_operations, 0);
        assert_eq!(s.committed_transactions, 0);
        assert_eq!(s.aborted_transactions, 2);

        assert_eq!(result.failures.len(), 2);
        for failure in &result.failures {
            assert_eq!(failure.seq, None);
            assert_eq!(failure.instance_id, Some("schema".into()));
            assert_eq!(failure.code, "InvalidInput");
        }
        // Both transactions were rolled back.
        let heap = result.block(&"heap".into()).unwrap();
        assert_eq!(heap.gauge("live_records"), Some(0.0));
    }

    #[tokio::test]
    async fn test_failure_list_is_capped() {
        let sim = Simulator::new(
            Arc::new(BlockRegistry::with_builtin_blocks()),
            SimulationConfig::default().with_max_failures_recorded(2),
        );
        let mut g = heap_graph(&sim);
        let btree = g
            .add_block_with_id("btree".into(), "btree_index", ParameterSet::new())
            .unwrap();
        let scan = g
            .add_block_with_id("scan".into(), "index_scan", ParameterSet::new())
            .unwrap();
        g.connect(&"heap".into(), "stored", &btree, "records").unwrap();
        g.connect(&btree, "lookup_result", &scan, "lookup_result").unwrap();

        let workload = inserts(1).then(
            vec![OperationMix::new(OperationType::Select, 100.0).with_range(2)],
            6,
        );
        let result = sim.run(&g, &workload).await;
        assert_eq!(result.summary.failed_operations, 6);
        assert_eq!(result.failures.len(), 2);
    }

    #[tokio::test]
    async fn test_stall_guard_breaks_lock_waits_without_detection() {
        let sim = Simulator::new(
            Arc::new(BlockRegistry::with_builtin_blocks()),
            SimulationConfig::default().with_stall_limit(5),
        );
        let mut g = sim.new_graph();
        let schema = g.add_block_with_id("schema".into(), "schema", ParameterSet::new()).unwrap();
        let mut params = ParameterSet::new();
        params.insert("deadlock_detection".into(), ParameterValue::Boolean(false));
        let locks = g.add_block_with_id("locks".into(), "two_phase_locking", params).unwrap();
        let heap = g.add_block_with_id("heap".into(), "heap_storage", ParameterSet::new()).unwrap();
        g.connect(&schema, "records", &locks, "records").unwrap();
        g.connect(&schema, "txn", &locks, "txn").unwrap();
        g.connect(&locks, "records", &heap, "records").unwrap();

        let workload = inserts(3)
            .then(vec![OperationMix::new(OperationType::Update, 100.0)], 200)
            .with_concurrency(4)
            .with_ops_per_transaction(3);
        let result = sim.run(&g, &workload).await;

        assert_eq!(result.status, SimulationStatus::Completed);
        let s = &result.summary;
        assert_eq!(s.completed_operations + s.failed_operations, 203);
        assert!(result.failures.iter().all(|f| f.code == "Stalled"));
    }
}
