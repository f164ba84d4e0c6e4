//! Hash Index Block
//!
//! A hash-based index that maps keys to [`RecordId`]s using a hash table with
//! **bucket chaining** for collision resolution. Provides O(1) average-case
//! point lookups but does not support range scans.
//!
//! ## How it works
//!
//! Keys are hashed with FNV-1a to a bucket number. Each bucket is a chain
//! (Vec) of entries. When the **load factor** (entries / buckets) exceeds
//! `max_load_factor`, the bucket count doubles and all entries are
//! redistributed.
//!
//! ## Metrics tracked
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `hash_lookups` | Counter | Point lookups performed |
//! | `collisions` | Counter | Inserts that hit an occupied bucket |
//! | `hash_resize` | Event | Table doubled its bucket count |
//! | `chain_length` | Histogram | Entries scanned per lookup |
//! | `total_keys` | Gauge | Number of indexed entries |
//! | `bucket_count` | Gauge | Current number of buckets |
//! | `load_factor` | Gauge | entries / buckets |

use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

use super::{
    execute_index, index_inputs, index_outputs, needs_storage, rollback_index, IndexChange,
    KeyIndex,
};
use crate::categories::{BlockKind, RecordId, WriteSet};
use crate::core::block::{
    Block, BlockCategory, BlockDocumentation, BlockError, BlockMetadata, BlockState,
    Complexity, ExecutionContext, ExecutionResult, InitContext, Reference, ReferenceType,
};
use crate::core::constraint::Capability;
use crate::core::metrics::{MetricDefinition, MetricsHandle};
use crate::core::parameter::Parameter;
use crate::core::registry::BlockDefinition;
use crate::core::TxnId;
use crate::runtime::config::LatencyModel;

// ---------------------------------------------------------------------------
// Internal hash table model
// ---------------------------------------------------------------------------

/// A bucket is a chain of entries.
type Bucket = Vec<(i64, RecordId)>;

/// FNV-1a over the key's little-endian bytes.
fn hash_key(key: i64) -> u64 {
    let mut h: u64 = 14695981039346656037;
    for b in key.to_le_bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(1099511628211);
    }
    h
}

/// Chained hash table
#[derive(Debug, Clone)]
pub struct HashTable {
    buckets: Vec<Bucket>,
    entries: usize,
    max_load_factor: f64,
}

impl HashTable {
    pub fn new(initial_buckets: usize, max_load_factor: f64) -> Self {
        Self {
            buckets: vec![Vec::new(); initial_buckets.max(1)],
            entries: 0,
            max_load_factor,
        }
    }

    fn bucket_index(&self, key: i64) -> usize {
        (hash_key(key) % self.buckets.len() as u64) as usize
    }

    /// Add an entry. Returns whether the bucket was already occupied and
    /// whether the table resized.
    pub fn insert(&mut self, key: i64, record_id: RecordId) -> (bool, bool) {
        let idx = self.bucket_index(key);
        let collided = !self.buckets[idx].is_empty();
        self.buckets[idx].push((key, record_id));
        self.entries += 1;

        let resized = self.load_factor() > self.max_load_factor;
        if resized {
            self.rehash();
        }
        (collided, resized)
    }

    pub fn remove(&mut self, key: i64, record_id: &RecordId) -> bool {
        let idx = self.bucket_index(key);
        let bucket = &mut self.buckets[idx];
        match bucket.iter().position(|(k, r)| *k == key && r == record_id) {
            Some(pos) => {
                bucket.swap_remove(pos);
                self.entries -= 1;
                true
            }
            None => false,
        }
    }

    /// Matching record ids and the chain length scanned
    pub fn lookup(&self, key: i64) -> (Vec<RecordId>, usize) {
        let bucket = &self.buckets[self.bucket_index(key)];
        let ids = bucket
            .iter()
            .filter(|(k, _)| *k == key)
            .map(|(_, r)| *r)
            .collect();
        (ids, bucket.len())
    }

    /// Whether `key` already maps to `record_id`
    pub fn holds(&self, key: i64, record_id: &RecordId) -> bool {
        self.buckets[self.bucket_index(key)]
            .iter()
            .any(|(k, r)| *k == key && r == record_id)
    }

    pub fn contains(&self, key: i64) -> bool {
        self.buckets[self.bucket_index(key)].iter().any(|(k, _)| *k == key)
    }

    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn load_factor(&self) -> f64 {
        self.entries as f64 / self.buckets.len() as f64
    }

    /// Maximum chain length across all buckets.
    pub fn max_chain_length(&self) -> usize {
        self.buckets.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Double the bucket count and redistribute all entries.
    fn rehash(&mut self) {
        let new_size = self.buckets.len() * 2;
        let old_buckets = std::mem::replace(&mut self.buckets, vec![Vec::new(); new_size]);
        for (key, record_id) in old_buckets.into_iter().flatten() {
            let idx = (hash_key(key) % new_size as u64) as usize;
            self.buckets[idx].push((key, record_id));
        }
    }
}

// ---------------------------------------------------------------------------
// HashIndexBlock
// ---------------------------------------------------------------------------

struct HashIndex {
    table: HashTable,
    metrics: MetricsHandle,
    latency: LatencyModel,
}

impl KeyIndex for HashIndex {
    fn insert(&mut self, key: i64, record_id: RecordId) -> Result<bool, BlockError> {
        if self.table.holds(key, &record_id) {
            return Ok(false);
        }
        let (collided, resized) = self.table.insert(key, record_id);
        if collided {
            self.metrics.increment("collisions");
        }
        if resized {
            self.metrics.event(
                "hash_resize",
                json!({ "buckets": self.table.bucket_count(), "entries": self.table.len() }),
            );
            self.metrics.charge(self.table.len() as f64 * self.latency.memory_access_us);
        }
        Ok(true)
    }

    fn remove(&mut self, key: i64, record_id: &RecordId) -> bool {
        self.table.remove(key, record_id)
    }

    fn point(&mut self, key: i64) -> Vec<RecordId> {
        let (ids, chain) = self.table.lookup(key);
        self.metrics.increment("hash_lookups");
        self.metrics.histogram("chain_length", chain as f64);
        self.metrics.charge((1 + chain) as f64 * self.latency.memory_access_us);
        ids
    }

    fn range(&mut self, _start: i64, _end: i64) -> Result<Vec<RecordId>, BlockError> {
        Err(BlockError::UnsupportedOperation(
            "hash index cannot answer range probes".into(),
        ))
    }
}

pub struct HashIndexBlock {
    index: HashIndex,
    changes: WriteSet<IndexChange>,
}

impl HashIndexBlock {
    pub fn new() -> Self {
        Self {
            index: HashIndex {
                table: HashTable::new(64, 0.75),
                metrics: MetricsHandle::detached("hash_index"),
                latency: LatencyModel::default(),
            },
            changes: WriteSet::new(),
        }
    }

    pub fn definition() -> BlockDefinition {
        BlockDefinition {
            kind: BlockKind::HashIndex,
            metadata: Self::build_metadata(),
            inputs: index_inputs(),
            outputs: index_outputs(),
            parameters: Self::build_parameters(),
            constraints: vec![needs_storage()],
            capabilities: BTreeSet::from([Capability::PointLookup]),
            capability_requirements: Vec::new(),
            metrics: Self::build_metrics(),
            entry: false,
        }
    }

    fn build_metadata() -> BlockMetadata {
        BlockMetadata {
            id: "hash_index".into(),
            name: "Hash Index".into(),
            category: BlockCategory::Index,
            description: "Hash table index with O(1) point lookups".into(),
            version: "1.0.0".into(),
            documentation: BlockDocumentation {
                overview: "A hash index maps each key to a bucket via a hash function. \
                           Lookups are O(1) on average but range scans are not supported \
                           because hashing destroys key order."
                    .into(),
                algorithm: "Insert: hash the key, append to the bucket chain, rehash if the \
                            load factor is exceeded. Lookup: hash the key and scan the chain."
                    .into(),
                complexity: Complexity {
                    time: "O(1) average lookup and insert, O(n) rehash".into(),
                    space: "O(n)".into(),
                },
                use_cases: vec![
                    "Equality predicates on primary keys".into(),
                    "Hash join build side".into(),
                ],
                tradeoffs: vec![
                    "No range scans or ordered iteration".into(),
                    "Rehashing briefly doubles memory".into(),
                ],
            },
            references: vec![Reference {
                ref_type: ReferenceType::Book,
                title: "Introduction to Algorithms, Chapter 11: Hash Tables".into(),
                citation: Some("Cormen, T. H., et al. (2009). MIT Press.".into()),
            }],
        }
    }

    fn build_parameters() -> Vec<Parameter> {
        vec![
            Parameter::integer("initial_buckets", "Initial Buckets", 64, 1, 1_048_576)
                .with_description("Bucket count before any resize"),
            Parameter::number("max_load_factor", "Max Load Factor", 0.75, 0.1, 8.0)
                .with_description("Entries per bucket that trigger a doubling"),
        ]
    }

    fn build_metrics() -> Vec<MetricDefinition> {
        vec![
            MetricDefinition::counter("hash_lookups", "lookups", "Point lookups performed"),
            MetricDefinition::counter("collisions", "inserts", "Inserts into an occupied bucket"),
            MetricDefinition::event("hash_resize", "Bucket count doubled"),
            MetricDefinition::histogram("chain_length", "entries", "Entries scanned per lookup"),
            MetricDefinition::gauge("total_keys", "entries", "Indexed entries"),
            MetricDefinition::gauge("bucket_count", "buckets", "Current buckets"),
            MetricDefinition::gauge("load_factor", "ratio", "Entries per bucket"),
        ]
    }
}

impl Default for HashIndexBlock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Block for HashIndexBlock {
    fn kind(&self) -> BlockKind {
        BlockKind::HashIndex
    }

    async fn initialize(&mut self, ctx: InitContext) -> Result<(), BlockError> {
        self.index = HashIndex {
            table: HashTable::new(ctx.usize("initial_buckets")?, ctx.number("max_load_factor")?),
            metrics: ctx.metrics,
            latency: ctx.latency,
        };
        self.changes = WriteSet::new();
        Ok(())
    }

    async fn execute(&mut self, ctx: ExecutionContext) -> Result<ExecutionResult, BlockError> {
        execute_index(&mut self.index, &mut self.changes, ctx)
    }

    fn commit_transaction(&mut self, txn: TxnId) {
        self.changes.commit(txn);
    }

    fn rollback_transaction(&mut self, txn: TxnId) {
        rollback_index(&mut self.index, &mut self.changes, txn);
    }

    fn snapshot_metrics(&self) -> BTreeMap<String, f64> {
        let table = &self.index.table;
        let mut gauges = BTreeMap::new();
        gauges.insert("total_keys".into(), table.len() as f64);
        gauges.insert("bucket_count".into(), table.bucket_count() as f64);
        gauges.insert("load_factor".into(), table.load_factor());
        gauges
    }

    fn get_state(&self) -> BlockState {
        let table = &self.index.table;
        let mut state = BlockState::new();
        let _ = state.insert("entries", table.len());
        let _ = state.insert("buckets", table.bucket_count());
        let _ = state.insert("max_chain_length", table.max_chain_length());
        state
    }
}
