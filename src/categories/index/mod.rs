//! Index block implementations
//!
//! Index blocks maintain a key → record id mapping over the rows a storage
//! block has placed. Writes arrive on `records` carrying their record ids;
//! selects arrive as the request row and are answered on `lookup_result`.
//! A key maps to each record id at most once. Entries a transaction added or
//! removed are put back the other way if it aborts.

pub mod btree;
pub mod hash_index;
pub mod skip_list;

pub use btree::{BPlusTree, BTreeIndexBlock};
pub use hash_index::HashIndexBlock;
pub use skip_list::SkipListIndexBlock;

use crate::categories::{RecordId, WriteSet};
use crate::core::block::{
    BlockCategory, BlockError, ExecutionContext, ExecutionResult, OperationType,
};
use crate::core::constraint::DependencyConstraint;
use crate::core::port::{Cardinality, DataType, IndexLookup, Port, PortType, PortValue};
use crate::core::TxnId;

/// The structure behind an index block.
pub(crate) trait KeyIndex: Send + Sync {
    /// Map `key` to `record_id`. `Ok(false)` if the entry already exists.
    fn insert(&mut self, key: i64, record_id: RecordId) -> Result<bool, BlockError>;

    /// `false` if the entry was not there
    fn remove(&mut self, key: i64, record_id: &RecordId) -> bool;

    fn point(&mut self, key: i64) -> Vec<RecordId>;

    /// Record ids for keys in `[start, end)`, ascending by key
    fn range(&mut self, start: i64, end: i64) -> Result<Vec<RecordId>, BlockError>;
}

pub(crate) fn index_inputs() -> Vec<Port> {
    vec![Port::input("records", "Stored Records", PortType::RecordStream, DataType::StoredRow)
        .required()
        .with_description("Rows with the record ids assigned by storage")]
}

pub(crate) fn index_outputs() -> Vec<Port> {
    vec![Port::output(
        "lookup_result",
        "Lookup Result",
        PortType::IndexLookupResult,
        DataType::RecordIds,
    )
    .with_cardinality(Cardinality::Single)
    .with_description("Record ids matching a select's key or key range")]
}

pub(crate) fn needs_storage() -> DependencyConstraint {
    DependencyConstraint::upstream_category(
        BlockCategory::Storage,
        "An index maps keys to record ids assigned by a storage block",
    )
}

/// An index entry changed by an open transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IndexChange {
    Added(i64, RecordId),
    Removed(i64, RecordId),
}

/// Shared request handling: maintain the index on writes, probe it on selects.
pub(crate) fn execute_index<I: KeyIndex>(
    index: &mut I,
    changes: &mut WriteSet<IndexChange>,
    mut ctx: ExecutionContext,
) -> Result<ExecutionResult, BlockError> {
    let records = ctx.take_records("records");
    let Some(op) = ctx.request.op() else {
        return Ok(ExecutionResult::empty());
    };
    let txn = ctx.request.txn;

    match op {
        OperationType::Insert | OperationType::Delete => {
            for record in records {
                let record_id = record.record_id.ok_or_else(|| {
                    BlockError::InvalidInput(format!("row {} has no record id", record.key))
                })?;
                if op == OperationType::Insert {
                    if index.insert(record.key, record_id)? {
                        changes.record(txn, IndexChange::Added(record.key, record_id));
                    }
                } else if index.remove(record.key, &record_id) {
                    changes.record(txn, IndexChange::Removed(record.key, record_id));
                }
            }
            Ok(ExecutionResult::empty())
        }
        // Keys never change and storage keeps record ids stable on update.
        OperationType::Update => Ok(ExecutionResult::empty()),
        OperationType::Select => {
            let request = &ctx.request;
            let record_ids = match request.range_end() {
                Some(end) => index.range(request.key, end)?,
                None => index.point(request.key),
            };
            let lookup = IndexLookup {
                key: request.key,
                range_end: request.range_end(),
                record_ids,
            };
            Ok(ExecutionResult::empty().with_output("lookup_result", PortValue::Lookup(lookup)))
        }
    }
}

/// Undo an aborted transaction's entries, newest first. Returns how many
/// entries were put back.
pub(crate) fn rollback_index<I: KeyIndex>(
    index: &mut I,
    changes: &mut WriteSet<IndexChange>,
    txn: TxnId,
) -> usize {
    let mut undone = 0;
    for change in changes.take_for_undo(txn) {
        let restored = match change {
            IndexChange::Added(key, record_id) => index.remove(key, &record_id),
            IndexChange::Removed(key, record_id) => match index.insert(key, record_id) {
                Ok(added) => added,
                Err(error) => {
                    tracing::warn!(%txn, key, %error, "could not restore index entry");
                    false
                }
            },
        };
        if restored {
            undone += 1;
        }
    }
    if undone > 0 {
        tracing::debug!(%txn, undone, "index entries rolled back");
    }
    undone
}
