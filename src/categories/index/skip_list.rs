//! Skip List Index Block
//!
//! A probabilistic ordered index. Each key sits on level 0 and is promoted to
//! each next level with `promotion_probability`, so higher levels act as
//! express lanes over the sorted list below them.
//!
//! ## Metrics tracked
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `skiplist_lookups` | Counter | Select probes |
//! | `levels_traversed` | Histogram | Levels descended per probe |
//! | `nodes_visited` | Histogram | Forward steps per probe |
//! | `total_keys` | Gauge | Indexed keys |
//! | `current_level` | Gauge | Highest occupied level |

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
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

const HEAD: usize = 0;

#[derive(Debug, Clone)]
struct SkipNode {
    key: i64,
    record_ids: Vec<RecordId>,
    /// Next node on each level this node participates in
    forward: Vec<Option<usize>>,
}

/// Arena-backed skip list; slot 0 is the head sentinel.
#[derive(Debug, Clone)]
pub struct SkipList {
    nodes: Vec<SkipNode>,
    free: Vec<usize>,
    level: usize,
    max_level: usize,
    promotion_probability: f64,
    len: usize,
    rng: StdRng,
}

/// Cost of one search
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchCost {
    pub levels: usize,
    pub steps: usize,
}

impl SkipList {
    pub fn new(max_level: usize, promotion_probability: f64, seed: u64) -> Self {
        let max_level = max_level.max(1);
        Self {
            nodes: vec![SkipNode {
                key: i64::MIN,
                record_ids: Vec::new(),
                forward: vec![None; max_level],
            }],
            free: Vec::new(),
            level: 1,
            max_level,
            promotion_probability,
            len: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn random_level(&mut self) -> usize {
        let mut level = 1;
        while level < self.max_level && self.rng.gen_bool(self.promotion_probability) {
            level += 1;
        }
        level
    }

    /// Rightmost node before `key` on every level, plus the search cost
    fn predecessors(&self, key: i64) -> (Vec<usize>, SearchCost) {
        let mut update = vec![HEAD; self.max_level];
        let mut cost = SearchCost::default();
        let mut x = HEAD;
        for lvl in (0..self.level).rev() {
            cost.levels += 1;
            while let Some(next) = self.nodes[x].forward[lvl] {
                if self.nodes[next].key < key {
                    x = next;
                    cost.steps += 1;
                } else {
                    break;
                }
            }
            update[lvl] = x;
        }
        (update, cost)
    }

    fn node_at(&self, update: &[usize], key: i64) -> Option<usize> {
        self.nodes[update[0]].forward[0].filter(|&n| self.nodes[n].key == key)
    }

    /// Add a record id under `key`; returns whether the key was new.
    pub fn insert(&mut self, key: i64, record_id: RecordId) -> bool {
        let (update, _) = self.predecessors(key);
        if let Some(existing) = self.node_at(&update, key) {
            let ids = &mut self.nodes[existing].record_ids;
            if !ids.contains(&record_id) {
                ids.push(record_id);
            }
            return false;
        }

        let level = self.random_level();
        if level > self.level {
            self.level = level;
        }
        let node = SkipNode {
            key,
            record_ids: vec![record_id],
            forward: vec![None; level],
        };
        let idx = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        for (lvl, &pred) in update.iter().enumerate().take(level) {
            self.nodes[idx].forward[lvl] = self.nodes[pred].forward[lvl];
            self.nodes[pred].forward[lvl] = Some(idx);
        }
        self.len += 1;
        true
    }

    pub fn get(&self, key: i64) -> (Option<&Vec<RecordId>>, SearchCost) {
        let (update, cost) = self.predecessors(key);
        let ids = self.node_at(&update, key).map(|n| &self.nodes[n].record_ids);
        (ids, cost)
    }

    pub fn get_mut(&mut self, key: i64) -> Option<&mut Vec<RecordId>> {
        let (update, _) = self.predecessors(key);
        let node = self.node_at(&update, key)?;
        Some(&mut self.nodes[node].record_ids)
    }

    /// Unlink `key` and return its record ids
    pub fn remove(&mut self, key: i64) -> Option<Vec<RecordId>> {
        let (update, _) = self.predecessors(key);
        let target = self.node_at(&update, key)?;
        for lvl in 0..self.nodes[target].forward.len() {
            if self.nodes[update[lvl]].forward[lvl] == Some(target) {
                self.nodes[update[lvl]].forward[lvl] = self.nodes[target].forward[lvl];
            }
        }
        while self.level > 1 && self.nodes[HEAD].forward[self.level - 1].is_none() {
            self.level -= 1;
        }
        self.len -= 1;
        self.free.push(target);
        Some(std::mem::take(&mut self.nodes[target].record_ids))
    }

    /// Entries with keys in `[start, end)`, ascending
    pub fn range(&self, start: i64, end: i64) -> (Vec<(i64, &Vec<RecordId>)>, SearchCost) {
        let (update, mut cost) = self.predecessors(start);
        let mut out = Vec::new();
        let mut cursor = self.nodes[update[0]].forward[0];
        while let Some(n) = cursor {
            let node = &self.nodes[n];
            if node.key >= end {
                break;
            }
            out.push((node.key, &node.record_ids));
            cost.steps += 1;
            cursor = node.forward[0];
        }
        (out, cost)
    }

    /// Keys in level-0 order
    pub fn keys(&self) -> Vec<i64> {
        let mut keys = Vec::with_capacity(self.len);
        let mut cursor = self.nodes[HEAD].forward[0];
        while let Some(n) = cursor {
            keys.push(self.nodes[n].key);
            cursor = self.nodes[n].forward[0];
        }
        keys
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn level(&self) -> usize {
        self.level
    }
}

// ---------------------------------------------------------------------------
// SkipListIndexBlock
// ---------------------------------------------------------------------------

struct SkipListIndex {
    list: SkipList,
    metrics: MetricsHandle,
    latency: LatencyModel,
}

impl SkipListIndex {
    fn record_probe(&self, cost: SearchCost) {
        self.metrics.increment("skiplist_lookups");
        self.metrics.histogram("levels_traversed", cost.levels as f64);
        self.metrics.histogram("nodes_visited", cost.steps as f64);
        self.metrics
            .charge((cost.levels + cost.steps) as f64 * self.latency.memory_access_us);
    }
}

impl KeyIndex for SkipListIndex {
    fn insert(&mut self, key: i64, record_id: RecordId) -> Result<bool, BlockError> {
        if let Some(ids) = self.list.get_mut(key) {
            if ids.contains(&record_id) {
                return Ok(false);
            }
            ids.push(record_id);
            return Ok(true);
        }
        self.list.insert(key, record_id);
        Ok(true)
    }

    fn remove(&mut self, key: i64, record_id: &RecordId) -> bool {
        let Some(ids) = self.list.get_mut(key) else {
            return false;
        };
        let before = ids.len();
        ids.retain(|r| r != record_id);
        let (removed, now_empty) = (ids.len() < before, ids.is_empty());
        if now_empty {
            self.list.remove(key);
        }
        removed
    }

    fn point(&mut self, key: i64) -> Vec<RecordId> {
        let (ids, cost) = self.list.get(key);
        let ids = ids.cloned().unwrap_or_default();
        self.record_probe(cost);
        ids
    }

    fn range(&mut self, start: i64, end: i64) -> Result<Vec<RecordId>, BlockError> {
        let (entries, cost) = self.list.range(start, end);
        let ids = entries.into_iter().flat_map(|(_, ids)| ids.clone()).collect();
        self.record_probe(cost);
        Ok(ids)
    }
}

pub struct SkipListIndexBlock {
    index: SkipListIndex,
    changes: WriteSet<IndexChange>,
}

impl SkipListIndexBlock {
    pub fn new() -> Self {
        Self {
            index: SkipListIndex {
                list: SkipList::new(16, 0.5, 0),
                metrics: MetricsHandle::detached("skiplist_index"),
                latency: LatencyModel::default(),
            },
            changes: WriteSet::new(),
        }
    }

    pub fn definition() -> BlockDefinition {
        BlockDefinition {
            kind: BlockKind::SkipListIndex,
            metadata: Self::build_metadata(),
            inputs: index_inputs(),
            outputs: index_outputs(),
            parameters: Self::build_parameters(),
            constraints: vec![needs_storage()],
            capabilities: BTreeSet::from([
                Capability::PointLookup,
                Capability::RangeScan,
                Capability::OrderedIteration,
            ]),
            capability_requirements: Vec::new(),
            metrics: Self::build_metrics(),
            entry: false,
        }
    }

    fn build_metadata() -> BlockMetadata {
        BlockMetadata {
            id: "skiplist_index".into(),
            name: "Skip List Index".into(),
            category: BlockCategory::Index,
            description: "Probabilistic ordered index with expected logarithmic search".into(),
            version: "1.0.0".into(),
            documentation: BlockDocumentation {
                overview: "A skip list layers sparse linked lists over a sorted base list. \
                           It matches a balanced tree's expected cost without any rebalancing, \
                           which is why memtables in LevelDB and RocksDB use one."
                    .into(),
                algorithm: "Search: start at the top level, move right while the next key is \
                            smaller, drop a level otherwise. Insert: link the new node on \
                            1 + Geometric(p) levels."
                    .into(),
                complexity: Complexity {
                    time: "O(log n) expected search, insert and delete".into(),
                    space: "O(n / (1 - p)) forward pointers".into(),
                },
                use_cases: vec![
                    "In-memory ordered indexes".into(),
                    "LSM memtables".into(),
                ],
                tradeoffs: vec![
                    "Performance is probabilistic, not guaranteed".into(),
                    "Pointer chasing is less cache friendly than B-tree nodes".into(),
                ],
            },
            references: vec![Reference {
                ref_type: ReferenceType::Paper,
                title: "Skip Lists: A Probabilistic Alternative to Balanced Trees".into(),
                citation: Some("Pugh, W. (1990). Communications of the ACM.".into()),
            }],
        }
    }

    fn build_parameters() -> Vec<Parameter> {
        vec![
            Parameter::integer("max_level", "Max Level", 16, 1, 32)
                .with_description("Maximum number of levels"),
            Parameter::number("promotion_probability", "Promotion Probability", 0.5, 0.05, 0.95)
                .with_description("Chance that a node is promoted to the next level"),
        ]
    }

    fn build_metrics() -> Vec<MetricDefinition> {
        vec![
            MetricDefinition::counter("skiplist_lookups", "lookups", "Select probes"),
            MetricDefinition::histogram("levels_traversed", "levels", "Levels descended per probe"),
            MetricDefinition::histogram("nodes_visited", "nodes", "Forward steps per probe"),
            MetricDefinition::gauge("total_keys", "keys", "Indexed keys"),
            MetricDefinition::gauge("current_level", "levels", "Highest occupied level"),
        ]
    }
}

impl Default for SkipListIndexBlock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Block for SkipListIndexBlock {
    fn kind(&self) -> BlockKind {
        BlockKind::SkipListIndex
    }

    async fn initialize(&mut self, ctx: InitContext) -> Result<(), BlockError> {
        self.index = SkipListIndex {
            list: SkipList::new(
                ctx.usize("max_level")?,
                ctx.number("promotion_probability")?,
                ctx.seed,
            ),
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
        let mut gauges = BTreeMap::new();
        gauges.insert("total_keys".into(), self.index.list.len() as f64);
        gauges.insert("current_level".into(), self.index.list.level() as f64);
        gauges
    }

    fn get_state(&self) -> BlockState {
        let mut state = BlockState::new();
        let _ = state.insert("keys", self.index.list.len());
        let _ = state.insert("level", self.index.list.level());
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categories::test_support::{build, request};
    use crate::core::block::OperationType;
    use crate::core::metrics::MetricsSink;
    use crate::core::port::{PortValue, Record};

    #[test]
    fn test_keys_stay_sorted() {
        let mut list = SkipList::new(8, 0.5, 1);
        for k in [5, 1, 9, 3, 7, -2, 0] {
            list.insert(k, RecordId::Key(k));
        }
        assert_eq!(list.keys(), vec![-2, 0, 1, 3, 5, 7, 9]);
        assert_eq!(list.len(), 7);
    }

    #[test]
    fn test_same_seed_same_shape() {
        let mut a = SkipList::new(16, 0.5, 99);
        let mut b = SkipList::new(16, 0.5, 99);
        for k in 0..500 {
            a.insert(k, RecordId::Key(k));
            b.insert(k, RecordId::Key(k));
        }
        assert_eq!(a.level(), b.level());
        assert_eq!(a.get(250).1, b.get(250).1);
    }

    #[test]
    fn test_search_cost_is_sublinear() {
        let mut list = SkipList::new(16, 0.5, 3);
        for k in 0..4096 {
            list.insert(k, RecordId::Key(k));
        }
        let (ids, cost) = list.get(4000);
        assert_eq!(ids, Some(&vec![RecordId::Key(4000)]));
        assert!(cost.steps < 400, "steps {}", cost.steps);
        assert_eq!(cost.levels, list.level());
    }

    #[test]
    fn test_remove_unlinks_and_reuses_slot() {
        let mut list = SkipList::new(8, 0.5, 5);
        for k in 0..20 {
            list.insert(k, RecordId::Key(k));
        }
        assert_eq!(list.remove(7), Some(vec![RecordId::Key(7)]));
        assert!(list.remove(7).is_none());
        assert!(list.get(7).0.is_none());

        list.insert(100, RecordId::Key(100));
        assert_eq!(list.len(), 20);
        assert_eq!(list.keys().last(), Some(&100));
    }

    #[test]
    fn test_range_half_open() {
        let mut list = SkipList::new(8, 0.5, 5);
        for k in 0..50 {
            list.insert(k, RecordId::Key(k));
        }
        let (entries, _) = list.range(10, 15);
        let keys: Vec<i64> = entries.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![10, 11, 12, 13, 14]);
    }

    #[tokio::test]
    async fn test_block_records_levels_traversed() {
        let sink = MetricsSink::new(false);
        let mut block = build(BlockKind::SkipListIndex, "skip", &[], &sink, None).await;

        for k in 0..64 {
            let row = Record::new(k).with_record_id(RecordId::Key(k));
            let ctx = ExecutionContext::new(request(1, OperationType::Insert, k))
                .with_input("records", PortValue::Records(vec![row]));
            block.execute(ctx).await.unwrap();
        }

        let probe = ExecutionContext::new(request(1, OperationType::Select, 10).with_range(4))
            .with_input("records", PortValue::Records(vec![Record::new(10)]));
        let result = block.execute(probe).await.unwrap();
        match result.output("lookup_result") {
            Some(PortValue::Lookup(lookup)) => assert_eq!(lookup.record_ids.len(), 4),
            other => panic!("unexpected output {:?}", other),
        }

        let id = "skip".into();
        assert_eq!(sink.counter(&id, "skiplist_lookups"), 1.0);
        assert_eq!(sink.histogram_values(&id, "levels_traversed").len(), 1);
        assert_eq!(block.snapshot_metrics()["total_keys"], 64.0);
    }
}
