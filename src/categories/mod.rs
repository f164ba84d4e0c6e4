//! Built-in block implementations
//!
//! Every block the simulator knows is one variant of [`BlockKind`]. The kind
//! maps to a [`BlockDefinition`] (ports, parameters, constraints, metrics)
//! that the registry holds, and to a fresh runtime instance for each run.

pub mod buffer;
pub mod concurrency;
pub mod execution;
pub mod index;
pub mod source;
pub mod storage;
pub mod transaction;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub use crate::core::block::BlockCategory;
use crate::core::block::Block;
use crate::core::registry::BlockDefinition;
use crate::core::TxnId;

/// Physical page identifier within one storage block
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Location of a stored record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordId {
    /// Slot on a heap page
    Slot { page: PageId, slot: u32 },
    /// Key-addressed engines (clustered, LSM) locate records by primary key
    Key(i64),
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Slot { page, slot } => write!(f, "({}, {})", page, slot),
            RecordId::Key(k) => write!(f, "key:{}", k),
        }
    }
}

/// Changes a block made for each open transaction, in the order they were
/// made. Committing forgets them; aborting hands them back newest first so
/// they can be undone.
#[derive(Debug)]
pub(crate) struct WriteSet<T> {
    open: BTreeMap<TxnId, Vec<T>>,
}

impl<T> WriteSet<T> {
    pub fn new() -> Self {
        Self {
            open: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, txn: TxnId, change: T) {
        self.open.entry(txn).or_default().push(change);
    }

    pub fn commit(&mut self, txn: TxnId) {
        self.open.remove(&txn);
    }

    /// Changes of an aborted transaction, newest first
    pub fn take_for_undo(&mut self, txn: TxnId) -> Vec<T> {
        let mut changes = self.open.remove(&txn).unwrap_or_default();
        changes.reverse();
        changes
    }

    /// Transactions with changes not yet committed or rolled back
    #[cfg(test)]
    pub fn open_transactions(&self) -> usize {
        self.open.len()
    }
}

impl<T> Default for WriteSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Closed set of built-in blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BlockKind {
    #[serde(rename = "schema")]
    Schema,
    #[serde(rename = "heap_storage")]
    HeapStorage,
    #[serde(rename = "clustered_storage")]
    ClusteredStorage,
    #[serde(rename = "lsm_storage")]
    LsmStorage,
    #[serde(rename = "btree_index")]
    BTreeIndex,
    #[serde(rename = "hash_index")]
    HashIndex,
    #[serde(rename = "skiplist_index")]
    SkipListIndex,
    #[serde(rename = "lru_buffer")]
    LruBuffer,
    #[serde(rename = "clock_buffer")]
    ClockBuffer,
    #[serde(rename = "two_phase_locking")]
    TwoPhaseLocking,
    #[serde(rename = "mvcc")]
    Mvcc,
    #[serde(rename = "sequential_scan")]
    SequentialScan,
    #[serde(rename = "index_scan")]
    IndexScan,
    #[serde(rename = "hash_join")]
    HashJoin,
    #[serde(rename = "nested_loop_join")]
    NestedLoopJoin,
    #[serde(rename = "sort")]
    Sort,
    #[serde(rename = "write_ahead_log")]
    WriteAheadLog,
}

impl BlockKind {
    pub const ALL: [BlockKind; 17] = [
        BlockKind::Schema,
        BlockKind::HeapStorage,
        BlockKind::ClusteredStorage,
        BlockKind::LsmStorage,
        BlockKind::BTreeIndex,
        BlockKind::HashIndex,
        BlockKind::SkipListIndex,
        BlockKind::LruBuffer,
        BlockKind::ClockBuffer,
        BlockKind::TwoPhaseLocking,
        BlockKind::Mvcc,
        BlockKind::SequentialScan,
        BlockKind::IndexScan,
        BlockKind::HashJoin,
        BlockKind::NestedLoopJoin,
        BlockKind::Sort,
        BlockKind::WriteAheadLog,
    ];

    /// Registry identifier of the kind's definition
    pub fn definition_id(self) -> &'static str {
        match self {
            BlockKind::Schema => "schema",
            BlockKind::HeapStorage => "heap_storage",
            BlockKind::ClusteredStorage => "clustered_storage",
            BlockKind::LsmStorage => "lsm_storage",
            BlockKind::BTreeIndex => "btree_index",
            BlockKind::HashIndex => "hash_index",
            BlockKind::SkipListIndex => "skiplist_index",
            BlockKind::LruBuffer => "lru_buffer",
            BlockKind::ClockBuffer => "clock_buffer",
            BlockKind::TwoPhaseLocking => "two_phase_locking",
            BlockKind::Mvcc => "mvcc",
            BlockKind::SequentialScan => "sequential_scan",
            BlockKind::IndexScan => "index_scan",
            BlockKind::HashJoin => "hash_join",
            BlockKind::NestedLoopJoin => "nested_loop_join",
            BlockKind::Sort => "sort",
            BlockKind::WriteAheadLog => "write_ahead_log",
        }
    }

    /// Build the definition registered for this kind
    pub fn definition(self) -> BlockDefinition {
        match self {
            BlockKind::Schema => source::SchemaBlock::definition(),
            BlockKind::HeapStorage => storage::HeapFileBlock::definition(),
            BlockKind::ClusteredStorage => storage::ClusteredStorageBlock::definition(),
            BlockKind::LsmStorage => storage::LSMTreeBlock::definition(),
            BlockKind::BTreeIndex => index::BTreeIndexBlock::definition(),
            BlockKind::HashIndex => index::HashIndexBlock::definition(),
            BlockKind::SkipListIndex => index::SkipListIndexBlock::definition(),
            BlockKind::LruBuffer => buffer::LRUBufferBlock::definition(),
            BlockKind::ClockBuffer => buffer::ClockBufferBlock::definition(),
            BlockKind::TwoPhaseLocking => concurrency::RowLockBlock::definition(),
            BlockKind::Mvcc => concurrency::MVCCBlock::definition(),
            BlockKind::SequentialScan => execution::SequentialScanBlock::definition(),
            BlockKind::IndexScan => execution::IndexScanBlock::definition(),
            BlockKind::HashJoin => execution::HashJoinBlock::definition(),
            BlockKind::NestedLoopJoin => execution::NestedLoopJoinBlock::definition(),
            BlockKind::Sort => execution::SortBlock::definition(),
            BlockKind::WriteAheadLog => transaction::WALBlock::definition(),
        }
    }

    /// Fresh, uninitialized runtime state
    pub fn instantiate(self) -> Box<dyn Block> {
        match self {
            BlockKind::Schema => Box::new(source::SchemaBlock::new()),
            BlockKind::HeapStorage => Box::new(storage::HeapFileBlock::new()),
            BlockKind::ClusteredStorage => Box::new(storage::ClusteredStorageBlock::new()),
            BlockKind::LsmStorage => Box::new(storage::LSMTreeBlock::new()),
            BlockKind::BTreeIndex => Box::new(index::BTreeIndexBlock::new()),
            BlockKind::HashIndex => Box::new(index::HashIndexBlock::new()),
            BlockKind::SkipListIndex => Box::new(index::SkipListIndexBlock::new()),
            BlockKind::LruBuffer => Box::new(buffer::LRUBufferBlock::new()),
            BlockKind::ClockBuffer => Box::new(buffer::ClockBufferBlock::new()),
            BlockKind::TwoPhaseLocking => Box::new(concurrency::RowLockBlock::new()),
            BlockKind::Mvcc => Box::new(concurrency::MVCCBlock::new()),
            BlockKind::SequentialScan => Box::new(execution::SequentialScanBlock::new()),
            BlockKind::IndexScan => Box::new(execution::IndexScanBlock::new()),
            BlockKind::HashJoin => Box::new(execution::HashJoinBlock::new()),
            BlockKind::NestedLoopJoin => Box::new(execution::NestedLoopJoinBlock::new()),
            BlockKind::Sort => Box::new(execution::SortBlock::new()),
            BlockKind::WriteAheadLog => Box::new(transaction::WALBlock::new()),
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.definition_id())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Helpers for driving a single block outside a plan.

    use std::collections::{BTreeMap, BTreeSet};

    use super::BlockKind;
    use crate::categories::storage::StorageHandle;
    use crate::core::block::{
        Block, ExecutionContext, ExecutionResult, InitContext, OperationType, Request,
        RequestKind,
    };
    use crate::core::metrics::MetricsSink;
    use crate::core::parameter::{ParameterSet, ParameterValue};
    use crate::core::port::{PortValue, Record, TxnSignal, TxnSignalKind};
    use crate::core::{InstanceId, TxnId};
    use crate::runtime::config::LatencyModel;

    /// Init context with resolved parameters and every output connected
    pub fn init_context(
        kind: BlockKind,
        name: &str,
        overrides: &[(&str, ParameterValue)],
        sink: &MetricsSink,
        storage: Option<StorageHandle>,
    ) -> InitContext {
        let def = kind.definition();
        let overrides: ParameterSet = overrides
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        let parameters = def.resolve_parameters(&overrides).unwrap();
        let instance_id = InstanceId::from(name);
        InitContext {
            metrics: sink.handle(instance_id.clone(), kind.definition_id()),
            instance_id,
            parameters,
            storage,
            latency: LatencyModel::default(),
            seed: 7,
            connected_outputs: def.outputs.iter().map(|p| p.id.clone()).collect::<BTreeSet<_>>(),
        }
    }

    pub async fn build(
        kind: BlockKind,
        name: &str,
        overrides: &[(&str, ParameterValue)],
        sink: &MetricsSink,
        storage: Option<StorageHandle>,
    ) -> Box<dyn Block> {
        let mut block = kind.instantiate();
        block
            .initialize(init_context(kind, name, overrides, sink, storage))
            .await
            .unwrap();
        block
    }

    pub fn request(txn: u64, op: OperationType, key: i64) -> Request {
        Request::operation(TxnId(txn), op, key)
    }

    /// Execution context carrying one generated row on `port`
    pub fn row_input(req: Request, port: &str) -> ExecutionContext {
        let record = Record::new(req.key);
        ExecutionContext::new(req).with_input(port, PortValue::Records(vec![record]))
    }

    pub fn txn_input(txn: u64, kind: TxnSignalKind) -> ExecutionContext {
        let request_kind = match kind {
            TxnSignalKind::Begin => RequestKind::Begin,
            TxnSignalKind::Commit => RequestKind::Commit,
            TxnSignalKind::Abort => RequestKind::Abort,
        };
        ExecutionContext::new(Request::control(TxnId(txn), request_kind)).with_input(
            "txn",
            PortValue::Txn(TxnSignal {
                txn: TxnId(txn),
                kind,
            }),
        )
    }

    /// Run `op` on `key` through a block fed on `port`
    pub async fn run_op(
        block: &mut Box<dyn Block>,
        txn: u64,
        op: OperationType,
        key: i64,
        port: &str,
    ) -> ExecutionResult {
        block
            .execute(row_input(request(txn, op, key), port))
            .await
            .unwrap()
    }

    pub fn inputs(pairs: Vec<(&str, PortValue)>) -> BTreeMap<String, PortValue> {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }
}
