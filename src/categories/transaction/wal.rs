//! Write-Ahead Log (WAL) Transaction Block
//!
//! Implements a **write-ahead log**, the foundational technique for crash
//! recovery. Every modification is appended to the log before the data
//! changes downstream, and a commit is durable once its commit record has
//! been fsync'd.
//!
//! ## How it works
//!
//! 1. Each row of a write appends a **log record** before the row is
//!    forwarded to storage.
//! 2. A commit appends a **commit record**. Commits are fsync'd in groups of
//!    `group_commit_size`; each fsync is charged to the simulated clock.
//! 3. Every `checkpoint_interval` records a **checkpoint** record is written
//!    and older log entries become recyclable.
//!
//! ## Log record types
//!
//! | Type | Written for |
//! |------|-------------|
//! | INSERT / UPDATE / DELETE | each row of a write |
//! | COMMIT | transaction commit |
//! | ABORT | transaction abort |
//! | CHECKPOINT | recovery point |
//!
//! ## Metrics tracked
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `log_records` | Counter | Total log records written |
//! | `log_bytes` | Counter | Total bytes written to the log |
//! | `fsyncs` | Counter | fsync operations (simulated) |
//! | `checkpoints` | Counter | Checkpoint records written |
//! | `log_size_bytes` | Gauge | Bytes since the last checkpoint |
//! | `current_lsn` | Gauge | Last assigned LSN |

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};

use crate::categories::BlockKind;
use crate::core::block::{
    Block, BlockCategory, BlockDocumentation, BlockError, BlockMetadata, BlockState,
    Complexity, ExecutionContext, ExecutionResult, InitContext, OperationType, Reference,
    ReferenceType,
};
use crate::core::metrics::{MetricDefinition, MetricsHandle};
use crate::core::parameter::Parameter;
use crate::core::port::{DataType, Port, PortType, PortValue, TxnSignalKind};
use crate::core::registry::BlockDefinition;
use crate::runtime::config::LatencyModel;

// ---------------------------------------------------------------------------
// Internal WAL model
// ---------------------------------------------------------------------------

/// Log Sequence Number, monotonically increasing.
pub type Lsn = u64;

/// LSN + type + size + checksum
const HEADER_BYTES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRecordType {
    Insert,
    Update,
    Delete,
    Commit,
    Abort,
    Checkpoint,
}

impl From<OperationType> for LogRecordType {
    fn from(op: OperationType) -> Self {
        match op {
            OperationType::Insert | OperationType::Select => LogRecordType::Insert,
            OperationType::Update => LogRecordType::Update,
            OperationType::Delete => LogRecordType::Delete,
        }
    }
}

/// Append-only log with group commit
#[derive(Debug, Clone)]
pub struct WriteAheadLog {
    group_commit_size: usize,
    checkpoint_interval: usize,
    next_lsn: Lsn,
    last_checkpoint_lsn: Lsn,
    bytes_since_checkpoint: usize,
    entries_since_checkpoint: usize,
    pending_commits: usize,
}

/// What one append did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendReport {
    pub records: usize,
    pub bytes: usize,
    pub fsynced: bool,
    pub checkpointed: bool,
}

impl WriteAheadLog {
    pub fn new(group_commit_size: usize, checkpoint_interval: usize) -> Self {
        Self {
            group_commit_size: group_commit_size.max(1),
            checkpoint_interval: checkpoint_interval.max(1),
            next_lsn: 1,
            last_checkpoint_lsn: 0,
            bytes_since_checkpoint: 0,
            entries_since_checkpoint: 0,
            pending_commits: 0,
        }
    }

    /// Append a log record; commits may trigger a group fsync.
    pub fn append(&mut self, record_type: LogRecordType, data_size: usize) -> AppendReport {
        let mut report = AppendReport::default();
        self.append_raw(data_size, &mut report);

        if record_type == LogRecordType::Commit {
            self.pending_commits += 1;
            if self.pending_commits >= self.group_commit_size {
                self.pending_commits = 0;
                report.fsynced = true;
            }
        }

        if self.entries_since_checkpoint >= self.checkpoint_interval {
            self.append_raw(0, &mut report);
            self.last_checkpoint_lsn = self.current_lsn();
            self.entries_since_checkpoint = 0;
            self.bytes_since_checkpoint = 0;
            report.checkpointed = true;
        }
        report
    }

    fn append_raw(&mut self, data_size: usize, report: &mut AppendReport) {
        let size = HEADER_BYTES + data_size;
        self.next_lsn += 1;
        self.bytes_since_checkpoint += size;
        self.entries_since_checkpoint += 1;
        report.records += 1;
        report.bytes += size;
    }

    pub fn current_lsn(&self) -> Lsn {
        self.next_lsn - 1
    }

    pub fn last_checkpoint_lsn(&self) -> Lsn {
        self.last_checkpoint_lsn
    }

    pub fn pending_commits(&self) -> usize {
        self.pending_commits
    }

    pub fn bytes_since_checkpoint(&self) -> usize {
        self.bytes_since_checkpoint
    }
}

// ---------------------------------------------------------------------------
// WALBlock
// ---------------------------------------------------------------------------

pub struct WALBlock {
    log: WriteAheadLog,
    metrics: MetricsHandle,
    latency: LatencyModel,
}

impl WALBlock {
    pub fn new() -> Self {
        Self {
            log: WriteAheadLog::new(1, 1000),
            metrics: MetricsHandle::detached("write_ahead_log"),
            latency: LatencyModel::default(),
        }
    }

    pub fn definition() -> BlockDefinition {
        BlockDefinition {
            kind: BlockKind::WriteAheadLog,
            metadata: Self::build_metadata(),
            inputs: Self::build_inputs(),
            outputs: Self::build_outputs(),
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
            id: "write_ahead_log".into(),
            name: "Write-Ahead Log".into(),
            category: BlockCategory::Transaction,
            description: "Append-only redo log with group commit".into(),
            version: "1.0.0".into(),
            documentation: BlockDocumentation {
                overview: "A write-ahead log records every change before it is applied, so \
                           committed work survives a crash. The fsync on commit dominates \
                           commit latency; group commit amortizes it over several transactions."
                    .into(),
                algorithm: "WRITE: append one log record per row, then forward the rows.\n\
                            COMMIT: append a commit record; fsync once group_commit_size \
                            commits are pending.\nEvery checkpoint_interval records, write a \
                            checkpoint."
                    .into(),
                complexity: Complexity {
                    time: "O(1) per record, one fsync per commit group".into(),
                    space: "O(records since the last checkpoint)".into(),
                },
                use_cases: vec![
                    "Durable OLTP commits".into(),
                    "LSM trees that need their memtable recoverable".into(),
                ],
                tradeoffs: vec![
                    "fsync latency on the commit path".into(),
                    "Larger commit groups trade latency for throughput".into(),
                ],
            },
            references: vec![Reference {
                ref_type: ReferenceType::Paper,
                title: "ARIES: A Transaction Recovery Method".into(),
                citation: Some("Mohan, C. et al. (1992). ACM TODS, 17(1), 94–162.".into()),
            }],
        }
    }

    fn build_inputs() -> Vec<Port> {
        vec![
            Port::input("records", "Records", PortType::RecordStream, DataType::Row)
                .required()
                .with_description("Rows to log before they reach storage"),
            Port::input("txn", "Transaction Control", PortType::TransactionControl, DataType::TxnSignal)
                .with_description("Commit and abort signals"),
        ]
    }

    fn build_outputs() -> Vec<Port> {
        vec![
            Port::output("records", "Records", PortType::RecordStream, DataType::Row)
                .with_description("Rows, forwarded once logged"),
            Port::output("txn", "Transaction Control", PortType::TransactionControl, DataType::TxnSignal)
                .with_description("Transaction signals, forwarded once logged"),
        ]
    }

    fn build_parameters() -> Vec<Parameter> {
        vec![
            Parameter::integer("group_commit_size", "Group Commit Size", 1, 1, 10_000)
                .with_description("Commits per fsync"),
            Parameter::integer("checkpoint_interval", "Checkpoint Interval", 1000, 1, 10_000_000)
                .with_description("Log records between checkpoints"),
        ]
    }

    fn build_metrics() -> Vec<MetricDefinition> {
        vec![
            MetricDefinition::counter("log_records", "records", "Total log records written"),
            MetricDefinition::counter("log_bytes", "bytes", "Total bytes written to the log"),
            MetricDefinition::counter("fsyncs", "ops", "fsync operations"),
            MetricDefinition::counter("checkpoints", "ops", "Checkpoint records written"),
            MetricDefinition::gauge("log_size_bytes", "bytes", "Bytes since the last checkpoint"),
            MetricDefinition::gauge("current_lsn", "lsn", "Last assigned LSN"),
        ]
    }

    // -- Core operations -----------------------------------------------------

    fn log(&mut self, record_type: LogRecordType, data_size: usize) {
        let report = self.log.append(record_type, data_size);
        self.metrics.counter("log_records", report.records as f64);
        self.metrics.counter("log_bytes", report.bytes as f64);
        self.metrics.charge(self.latency.memory_access_us * report.records as f64);
        if report.fsynced {
            self.metrics.increment("fsyncs");
            self.metrics.charge(self.latency.fsync_us);
        }
        if report.checkpointed {
            self.metrics.increment("checkpoints");
            tracing::debug!(lsn = self.log.last_checkpoint_lsn(), "wal checkpoint");
        }
    }
}

impl Default for WALBlock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Block for WALBlock {
    fn kind(&self) -> BlockKind {
        BlockKind::WriteAheadLog
    }

    async fn initialize(&mut self, ctx: InitContext) -> Result<(), BlockError> {
        self.log = WriteAheadLog::new(
            ctx.usize("group_commit_size")?,
            ctx.usize("checkpoint_interval")?,
        );
        self.latency = ctx.latency;
        self.metrics = ctx.metrics;
        Ok(())
    }

    async fn execute(&mut self, mut ctx: ExecutionContext) -> Result<ExecutionResult, BlockError> {
        if let PortValue::Txn(signal) = ctx.take("txn") {
            match signal.kind {
                TxnSignalKind::Begin => {}
                TxnSignalKind::Commit => self.log(LogRecordType::Commit, 0),
                TxnSignalKind::Abort => self.log(LogRecordType::Abort, 0),
            }
            return Ok(ExecutionResult::empty().with_output("txn", PortValue::Txn(signal)));
        }

        let records = ctx.take_records("records");
        match ctx.request.op() {
            Some(op) if op.is_write() => {
                for record in &records {
                    self.log(op.into(), record.estimated_size());
                }
            }
            _ => {}
        }
        Ok(ExecutionResult::empty().with_output("records", PortValue::Records(records)))
    }

    fn snapshot_metrics(&self) -> BTreeMap<String, f64> {
        let mut gauges = BTreeMap::new();
        gauges.insert("log_size_bytes".into(), self.log.bytes_since_checkpoint() as f64);
        gauges.insert("current_lsn".into(), self.log.current_lsn() as f64);
        gauges
    }

    fn get_state(&self) -> BlockState {
        let mut state = BlockState::new();
        let _ = state.insert("current_lsn", self.log.current_lsn());
        let _ = state.insert("last_checkpoint_lsn", self.log.last_checkpoint_lsn());
        let _ = state.insert("pending_commits", self.log.pending_commits());
        state
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
