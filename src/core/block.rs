//! Block trait and related types
//!
//! This module defines the core Block trait that all block runtimes implement,
//! along with supporting types for metadata, documentation, requests,
//! initialization and execution contexts, and error handling.
//!
//! A block runtime is initialized once per simulation run with its resolved
//! parameters, a metrics handle and (for blocks that read tables) a handle on
//! the nearest upstream storage block. It is then executed once per request
//! that reaches it through the compiled plan.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::metrics::MetricsHandle;
use super::parameter::{ParameterSet, ParameterValue};
use super::port::{PortValue, Record};
use super::{InstanceId, TxnId};
use crate::categories::storage::StorageHandle;
use crate::categories::BlockKind;
use crate::runtime::config::LatencyModel;

/// Core block trait that all blocks must implement
#[async_trait]
pub trait Block: Send + Sync {
    /// The built-in kind this runtime implements
    fn kind(&self) -> BlockKind;

    /// Initialize fresh state for one run
    async fn initialize(&mut self, ctx: InitContext) -> Result<(), BlockError>;

    /// Process one request that reached this block
    async fn execute(&mut self, ctx: ExecutionContext) -> Result<ExecutionResult, BlockError>;

    /// Gauges derived from current state, reported at finalization
    fn snapshot_metrics(&self) -> BTreeMap<String, f64> {
        BTreeMap::new()
    }

    /// The transaction committed; drop whatever was kept to undo its writes
    fn commit_transaction(&mut self, _txn: TxnId) {}

    /// The transaction aborted; undo every change it made to this block
    fn rollback_transaction(&mut self, _txn: TxnId) {}

    /// Shared read access to this block's table, for storage blocks
    fn storage_handle(&self) -> Option<StorageHandle> {
        None
    }

    /// Current block state (for step-through inspection)
    fn get_state(&self) -> BlockState {
        BlockState::new()
    }
}

/// Block metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockMetadata {
    /// Unique block definition identifier
    pub id: String,
    /// Human-readable block name
    pub name: String,
    /// Block category
    pub category: BlockCategory,
    /// Brief description of the block
    pub description: String,
    /// Block version
    pub version: String,
    /// Detailed documentation
    pub documentation: BlockDocumentation,
    /// References to papers, books, etc.
    pub references: Vec<Reference>,
}

/// Block categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockCategory {
    /// Workload entry points
    Source,
    /// Storage engines (heap files, clustered B-trees, LSM trees)
    Storage,
    /// Index structures
    Index,
    /// Buffer management
    Buffer,
    /// Concurrency control mechanisms
    Concurrency,
    /// Query execution operators
    QueryExecution,
    /// Transaction management
    Transaction,
}

impl BlockCategory {
    /// Get a human-readable name for the category
    pub fn display_name(&self) -> &'static str {
        match self {
            BlockCategory::Source => "Source",
            BlockCategory::Storage => "Storage",
            BlockCategory::Index => "Index",
            BlockCategory::Buffer => "Buffer",
            BlockCategory::Concurrency => "Concurrency",
            BlockCategory::QueryExecution => "Query Execution",
            BlockCategory::Transaction => "Transaction",
        }
    }
}

impl fmt::Display for BlockCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Block documentation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockDocumentation {
    /// Overview of the block's purpose
    pub overview: String,
    /// Algorithm description
    pub algorithm: String,
    /// Complexity analysis
    pub complexity: Complexity,
    /// Common use cases
    pub use_cases: Vec<String>,
    /// Tradeoffs to consider
    pub tradeoffs: Vec<String>,
}

/// Complexity analysis
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Complexity {
    /// Time complexity (e.g., "O(log n)")
    pub time: String,
    /// Space complexity (e.g., "O(n)")
    pub space: String,
}

/// Reference to external resources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
    /// Type of reference
    pub ref_type: ReferenceType,
    /// Title of the reference
    pub title: String,
    /// Citation information
    pub citation: Option<String>,
}

/// Types of references
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceType {
    /// Academic paper
    Paper,
    /// Book
    Book,
    /// Implementation reference
    Implementation,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Data operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Insert,
    Select,
    Update,
    Delete,
}

impl OperationType {
    pub fn is_write(self) -> bool {
        !matches!(self, OperationType::Select)
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Insert => write!(f, "INSERT"),
            OperationType::Select => write!(f, "SELECT"),
            OperationType::Update => write!(f, "UPDATE"),
            OperationType::Delete => write!(f, "DELETE"),
        }
    }
}

/// What a request asks the plan to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Begin,
    Commit,
    Abort,
    Operation(OperationType),
}

/// One unit of work dispatched through the plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Dispatch sequence number
    pub seq: u64,
    /// Logical client stream that issued the request
    pub stream: u32,
    pub txn: TxnId,
    pub kind: RequestKind,
    pub key: i64,
    /// Range probes cover `[key, key + width)`
    pub range_width: Option<u64>,
    /// Payload size for generated rows
    pub payload_bytes: usize,
}

impl Request {
    /// A data operation on `key`
    pub fn operation(txn: TxnId, operation: OperationType, key: i64) -> Self {
        Self {
            seq: 0,
            stream: 0,
            txn,
            kind: RequestKind::Operation(operation),
            key,
            range_width: None,
            payload_bytes: 64,
        }
    }

    /// A transaction control request
    pub fn control(txn: TxnId, kind: RequestKind) -> Self {
        Self {
            seq: 0,
            stream: 0,
            txn,
            kind,
            key: 0,
            range_width: None,
            payload_bytes: 0,
        }
    }

    pub fn with_range(mut self, width: u64) -> Self {
        self.range_width = Some(width);
        self
    }

    pub fn op(&self) -> Option<OperationType> {
        match self.kind {
            RequestKind::Operation(op) => Some(op),
            _ => None,
        }
    }

    pub fn is_select(&self) -> bool {
        self.op() == Some(OperationType::Select)
    }

    pub fn is_write(&self) -> bool {
        self.op().map_or(false, OperationType::is_write)
    }

    /// Exclusive end of the key range for range probes
    pub fn range_end(&self) -> Option<i64> {
        self.range_width
            .map(|w| self.key.saturating_add(w.min(i64::MAX as u64) as i64))
    }

    /// Whether `key` falls in the range (or equals the point) this request targets
    pub fn matches_key(&self, key: i64) -> bool {
        match self.range_end() {
            Some(end) => key >= self.key && key < end,
            None => key == self.key,
        }
    }
}

// ---------------------------------------------------------------------------
// Contexts and results
// ---------------------------------------------------------------------------

/// Everything a block receives when a run starts
#[derive(Debug, Clone)]
pub struct InitContext {
    pub instance_id: InstanceId,
    /// Resolved parameters, every declared parameter present
    pub parameters: ParameterSet,
    pub metrics: MetricsHandle,
    /// Nearest upstream storage block, when there is one
    pub storage: Option<StorageHandle>,
    pub latency: LatencyModel,
    /// Per-instance seed for blocks with randomized structure
    pub seed: u64,
    /// Output ports that have at least one connection
    pub connected_outputs: BTreeSet<String>,
}

impl InitContext {
    fn param(&self, name: &str) -> Result<&ParameterValue, BlockError> {
        self.parameters
            .get(name)
            .ok_or_else(|| BlockError::InvalidParameter(format!("{} is missing", name)))
    }

    pub fn integer(&self, name: &str) -> Result<i64, BlockError> {
        self.param(name)?
            .as_integer()
            .ok_or_else(|| BlockError::InvalidParameter(format!("{} must be an integer", name)))
    }

    /// Integer parameter that must be non-negative
    pub fn usize(&self, name: &str) -> Result<usize, BlockError> {
        let v = self.integer(name)?;
        usize::try_from(v).map_err(|_| {
            BlockError::InvalidParameter(format!("{} must not be negative", name))
        })
    }

    pub fn number(&self, name: &str) -> Result<f64, BlockError> {
        self.param(name)?
            .as_number()
            .ok_or_else(|| BlockError::InvalidParameter(format!("{} must be a number", name)))
    }

    pub fn boolean(&self, name: &str) -> Result<bool, BlockError> {
        self.param(name)?
            .as_bool()
            .ok_or_else(|| BlockError::InvalidParameter(format!("{} must be a boolean", name)))
    }

    pub fn string(&self, name: &str) -> Result<String, BlockError> {
        self.param(name)?
            .as_string()
            .map(str::to_string)
            .ok_or_else(|| BlockError::InvalidParameter(format!("{} must be a string", name)))
    }

    /// The upstream storage handle, or an initialization error naming the block
    pub fn require_storage(&self) -> Result<StorageHandle, BlockError> {
        self.storage.clone().ok_or_else(|| {
            BlockError::Initialization(format!(
                "{} needs a storage block upstream",
                self.instance_id
            ))
        })
    }

    pub fn output_connected(&self, port: &str) -> bool {
        self.connected_outputs.contains(port)
    }
}

/// Block execution context
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub request: Request,
    /// Values that arrived on bound input ports
    pub inputs: BTreeMap<String, PortValue>,
}

impl ExecutionContext {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            inputs: BTreeMap::new(),
        }
    }

    pub fn with_input(mut self, port: &str, value: PortValue) -> Self {
        self.inputs.insert(port.to_string(), value);
        self
    }

    /// Take an input value, leaving `None` behind
    pub fn take(&mut self, port: &str) -> PortValue {
        self.inputs.remove(port).unwrap_or(PortValue::None)
    }

    /// Take an input as records; non-record values yield an empty list
    pub fn take_records(&mut self, port: &str) -> Vec<Record> {
        self.take(port).into_records()
    }
}

/// How the dispatch should proceed after a block ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Outputs are ready for downstream blocks
    Continue,
    /// The request must wait for these transactions to finish
    Park { waiting_for: Vec<TxnId> },
}

/// Block execution result
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Output port values
    pub outputs: BTreeMap<String, PortValue>,
    pub status: ExecutionStatus,
    /// Other transactions this block aborted (deadlock victims)
    pub aborted_txns: Vec<TxnId>,
}

impl ExecutionResult {
    /// Continue with no outputs
    pub fn empty() -> Self {
        Self {
            outputs: BTreeMap::new(),
            status: ExecutionStatus::Continue,
            aborted_txns: Vec::new(),
        }
    }

    /// Park the request until one of `waiting_for` finishes
    pub fn parked(waiting_for: Vec<TxnId>) -> Self {
        Self {
            status: ExecutionStatus::Park { waiting_for },
            ..Self::empty()
        }
    }

    pub fn with_output(mut self, port: &str, value: PortValue) -> Self {
        if !value.is_none() {
            self.outputs.insert(port.to_string(), value);
        }
        self
    }

    pub fn with_aborted(mut self, txns: Vec<TxnId>) -> Self {
        self.aborted_txns.extend(txns);
        self
    }

    pub fn is_parked(&self) -> bool {
        matches!(self.status, ExecutionStatus::Park { .. })
    }

    pub fn output(&self, port: &str) -> Option<&PortValue> {
        self.outputs.get(port)
    }
}

/// Block state for inspection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockState {
    /// Arbitrary state data
    pub data: BTreeMap<String, serde_json::Value>,
}

impl BlockState {
    /// Create a new empty block state
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value into the state
    pub fn insert<T: Serialize>(&mut self, key: &str, value: T) -> Result<(), serde_json::Error> {
        let json_value = serde_json::to_value(value)?;
        self.data.insert(key.to_string(), json_value);
        Ok(())
    }

    /// Get a value from the state
    pub fn get<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<Option<T>, serde_json::Error> {
        match self.data.get(key) {
            Some(value) => {
                let result = serde_json::from_value(value.clone())?;
                Ok(Some(result))
            }
            None => Ok(None),
        }
    }
}

/// Block errors
///
/// Raised while a request runs through the plan; each aborts only the
/// affected operation and its transaction.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BlockError {
    /// Initialization failed
    #[error("Initialization failed: {0}")]
    Initialization(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Deadlock detected: {victim} aborted to break cycle {cycle:?}")]
    DeadlockDetected { victim: TxnId, cycle: Vec<TxnId> },

    #[error("Write conflict: {txn} lost the race to update key {key}")]
    WriteConflict { txn: TxnId, key: i64 },

    #[error("Out of simulated memory: {requested} rows exceed the limit of {limit}")]
    OutOfSimulatedMemory { limit: usize, requested: usize },

    #[error("Unique violation: key {0} is already indexed")]
    UniqueViolation(i64),

    #[error("Duplicate key: {0} is already stored")]
    DuplicateKey(i64),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
}

impl BlockError {
    /// Stable error code for reports
    pub fn code(&self) -> &'static str {
        match self {
            BlockError::Initialization(_) => "Initialization",
            BlockError::InvalidParameter(_) => "InvalidParameter",
            BlockError::InvalidInput(_) => "InvalidInput",
            BlockError::DeadlockDetected { .. } => "DeadlockDetected",
            BlockError::WriteConflict { .. } => "WriteConflict",
            BlockError::OutOfSimulatedMemory { .. } => "OutOfSimulatedMemory",
            BlockError::UniqueViolation(_) => "UniqueViolation",
            BlockError::DuplicateKey(_) => "DuplicateKey",
            BlockError::UnsupportedOperation(_) => "UnsupportedOperation",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_range_matching() {
        let point = Request::operation(TxnId(1), OperationType::Select, 10);
        assert!(point.matches_key(10));
        assert!(!point.matches_key(11));

        let range = point.clone().with_range(5);
        assert_eq!(range.range_end(), Some(15));
        assert!(range.matches_key(10));
        assert!(range.matches_key(14));
        assert!(!range.matches_key(15));
        assert!(!range.matches_key(9));
    }

    #[test]
    fn test_request_kind_helpers() {
        let insert = Request::operation(TxnId(1), OperationType::Insert, 1);
        assert!(insert.is_write());
        assert!(!insert.is_select());

        let commit = Request::control(TxnId(1), RequestKind::Commit);
        assert_eq!(commit.op(), None);
        assert!(!commit.is_write());
    }

    #[test]
    fn test_execution_result_drops_none_outputs() {
        let result = ExecutionResult::empty()
            .with_output("rows", PortValue::None)
            .with_output("pages", PortValue::Pages(Vec::new()));
        assert!(result.output("rows").is_none());
        assert!(result.output("pages").is_some());
        assert!(!result.is_parked());
        assert!(ExecutionResult::parked(vec![TxnId(2)]).is_parked());
    }

    #[test]
    fn test_error_codes() {
        let e = BlockError::DeadlockDetected {
            victim: TxnId(3),
            cycle: vec![TxnId(2), TxnId(3)],
        };
        assert_eq!(e.code(), "DeadlockDetected");
        assert!(e.to_string().contains("T3"));
        assert_eq!(BlockError::UniqueViolation(7).code(), "UniqueViolation");
    }

    #[test]
    fn test_block_state_roundtrip_value() {
        let mut state = BlockState::new();
        state.insert("page_count", 12usize).unwrap();
        assert_eq!(state.get::<usize>("page_count").unwrap(), Some(12));
        assert_eq!(state.get::<usize>("missing").unwrap(), None);
    }
}
