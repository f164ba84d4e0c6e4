//! B-tree Index Block
//!
//! A B+tree index that maps key values to [`RecordId`]s. It supports point
//! lookups and ordered range scans, making it the workhorse index structure in
//! virtually all relational databases.
//!
//! ## How it works
//!
//! The tree consists of **internal nodes** (which hold separator keys and child
//! pointers) and **leaf nodes** (which hold keys and values). A configurable
//! **fanout** bounds the children per node, which directly affects tree height
//! and therefore lookup cost. An overflowing node splits in half and pushes a
//! separator into its parent; a root split adds a level.
//!
//! Leaf nodes are linked via `next` pointers so range scans can walk the leaf
//! chain without revisiting internal nodes. Deletes remove entries without
//! merging nodes, so the height never decreases.
//!
//! The tree itself ([`BPlusTree`]) is generic over the leaf value and also
//! backs the clustered storage engine, where leaves are data pages.
//!
//! ## Metrics tracked
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `btree_lookups` | Counter | Select probes (point or range) |
//! | `range_scans` | Counter | Range probes |
//! | `pages_traversed` | Histogram | Nodes visited per probe |
//! | `page_splits` | Counter | Node splits during insert |
//! | `page_split` | Event | One per split, with the resulting height |
//! | `tree_height` | Gauge | Current height of the tree |
//! | `total_keys` | Gauge | Number of indexed keys |

use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;

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
// Internal B+tree model
// ---------------------------------------------------------------------------

/// A tree node (either internal or leaf).
#[derive(Debug, Clone)]
enum Node<V> {
    Internal {
        keys: Vec<i64>,
        children: Vec<usize>, // indices into the nodes Vec
    },
    Leaf {
        keys: Vec<i64>,
        values: Vec<V>,
        next: Option<usize>, // linked-list for range scans
    },
}

/// Splits caused by one insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitReport {
    pub splits: usize,
    pub root_split: bool,
}

/// Arena-allocated B+tree with unique `i64` keys.
#[derive(Debug, Clone)]
pub struct BPlusTree<V> {
    nodes: Vec<Node<V>>,
    root: usize,
    height: usize,
    len: usize,
    max_keys: usize,
}

impl<V> BPlusTree<V> {
    /// Tree whose nodes hold at most `fanout` children (`fanout - 1` keys).
    pub fn new(fanout: usize) -> Self {
        Self {
            nodes: vec![Node::Leaf {
                keys: Vec::new(),
                values: Vec::new(),
                next: None,
            }],
            root: 0,
            height: 1,
            len: 0,
            max_keys: fanout.max(3) - 1,
        }
    }

    /// Number of levels; a lone leaf has height 1.
    pub fn height(&self) -> usize {
        self.height
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Descend to the leaf that would hold `key`.
    fn leaf_for(&self, key: i64) -> usize {
        let mut idx = self.root;
        loop {
            match &self.nodes[idx] {
                Node::Internal { keys, children } => {
                    idx = children[keys.partition_point(|k| *k <= key)];
                }
                Node::Leaf { .. } => return idx,
            }
        }
    }

    /// Leaf node id holding `key`, if present.
    pub fn leaf_of(&self, key: i64) -> Option<usize> {
        let leaf = self.leaf_for(key);
        match &self.nodes[leaf] {
            Node::Leaf { keys, .. } if keys.binary_search(&key).is_ok() => Some(leaf),
            _ => None,
        }
    }

    /// Point lookup. Every probe visits `height()` nodes.
    pub fn get(&self, key: i64) -> Option<&V> {
        match &self.nodes[self.leaf_for(key)] {
            Node::Leaf { keys, values, .. } => keys.binary_search(&key).ok().map(|i| &values[i]),
            Node::Internal { .. } => None,
        }
    }

    pub fn get_mut(&mut self, key: i64) -> Option<&mut V> {
        let leaf = self.leaf_for(key);
        match &mut self.nodes[leaf] {
            Node::Leaf { keys, values, .. } => match keys.binary_search(&key) {
                Ok(i) => Some(&mut values[i]),
                Err(_) => None,
            },
            Node::Internal { .. } => None,
        }
    }

    pub fn contains(&self, key: i64) -> bool {
        self.get(key).is_some()
    }

    /// Insert a new key. An existing key is left untouched and the value is
    /// handed back.
    pub fn insert(&mut self, key: i64, value: V) -> Result<SplitReport, V> {
        let mut report = SplitReport::default();
        if let Some((separator, right)) = self.insert_into(self.root, key, value, &mut report)? {
            // Root was split: create a new root.
            let new_root = self.nodes.len();
            self.nodes.push(Node::Internal {
                keys: vec![separator],
                children: vec![self.root, right],
            });
            self.root = new_root;
            self.height += 1;
            report.root_split = true;
        }
        self.len += 1;
        Ok(report)
    }

    /// Recursively insert into the subtree rooted at `idx`.
    /// Returns `Some((separator, new_node))` if the node was split.
    fn insert_into(
        &mut self,
        idx: usize,
        key: i64,
        value: V,
        report: &mut SplitReport,
    ) -> Result<Option<(i64, usize)>, V> {
        let child = match &mut self.nodes[idx] {
            Node::Leaf { keys, values, .. } => {
                match keys.binary_search(&key) {
                    Ok(_) => return Err(value),
                    Err(pos) => {
                        keys.insert(pos, key);
                        values.insert(pos, value);
                    }
                }
                return Ok(self.split_leaf(idx, report));
            }
            Node::Internal { keys, children } => children[keys.partition_point(|k| *k <= key)],
        };

        match self.insert_into(child, key, value, report)? {
            None => Ok(None),
            Some((separator, right)) => {
                if let Node::Internal { keys, children } = &mut self.nodes[idx] {
                    let pos = keys.partition_point(|k| *k <= separator);
                    keys.insert(pos, separator);
                    children.insert(pos + 1, right);
                }
                Ok(self.split_internal(idx, report))
            }
        }
    }

    fn split_leaf(&mut self, idx: usize, report: &mut SplitReport) -> Option<(i64, usize)> {
        let max_keys = self.max_keys;
        let new_idx = self.nodes.len();
        let (right_keys, right_values, old_next) = match &mut self.nodes[idx] {
            Node::Leaf { keys, values, next } if keys.len() > max_keys => {
                let mid = keys.len() / 2;
                let right_keys = keys.split_off(mid);
                let right_values = values.split_off(mid);
                (right_keys, right_values, next.replace(new_idx))
            }
            _ => return None,
        };

        let separator = right_keys[0];
        self.nodes.push(Node::Leaf {
            keys: right_keys,
            values: right_values,
            next: old_next,
        });
        report.splits += 1;
        Some((separator, new_idx))
    }

    fn split_internal(&mut self, idx: usize, report: &mut SplitReport) -> Option<(i64, usize)> {
        let max_keys = self.max_keys;
        let (up_key, right_keys, right_children) = match &mut self.nodes[idx] {
            Node::Internal { keys, children } if keys.len() > max_keys => {
                let mid = keys.len() / 2;
                let right_keys = keys.split_off(mid + 1);
                let up_key = keys.pop()?;
                let right_children = children.split_off(mid + 1);
                (up_key, right_keys, right_children)
            }
            _ => return None,
        };

        let new_idx = self.nodes.len();
        self.nodes.push(Node::Internal {
            keys: right_keys,
            children: right_children,
        });
        report.splits += 1;
        Some((up_key, new_idx))
    }

    /// Remove a key without rebalancing.
    pub fn remove(&mut self, key: i64) -> Option<V> {
        let leaf = self.leaf_for(key);
        let removed = match &mut self.nodes[leaf] {
            Node::Leaf { keys, values, .. } => {
                let pos = keys.binary_search(&key).ok()?;
                keys.remove(pos);
                Some(values.remove(pos))
            }
            Node::Internal { .. } => None,
        };
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    /// Entries with keys in `[start, end)`, ascending, plus the number of
    /// nodes visited (descent plus every leaf walked).
    pub fn range(&self, start: i64, end: i64) -> (Vec<(i64, &V)>, usize) {
        let mut results = Vec::new();
        let mut visited = self.height;
        let mut idx = Some(self.leaf_for(start));

        while let Some(leaf) = idx {
            let Node::Leaf { keys, values, next } = &self.nodes[leaf] else {
                break;
            };
            for (k, v) in keys.iter().zip(values) {
                if *k >= end {
                    return (results, visited);
                }
                if *k >= start {
                    results.push((*k, v));
                }
            }
            idx = *next;
            if idx.is_some() {
                visited += 1;
            }
        }
        (results, visited)
    }

    /// Leaf node ids in key order
    pub fn leaf_ids(&self) -> Vec<usize> {
        let mut idx = self.root;
        while let Node::Internal { children, .. } = &self.nodes[idx] {
            idx = children[0];
        }

        let mut leaves = vec![idx];
        while let Node::Leaf { next: Some(next), .. } = &self.nodes[idx] {
            idx = *next;
            leaves.push(idx);
        }
        leaves
    }

    /// Entries of one leaf, or nothing for internal or unknown nodes
    pub fn leaf_entries(&self, leaf: usize) -> Vec<(i64, &V)> {
        match self.nodes.get(leaf) {
            Some(Node::Leaf { keys, values, .. }) => keys.iter().copied().zip(values).collect(),
            _ => Vec::new(),
        }
    }

    /// In-order traversal
    pub fn iter(&self) -> impl Iterator<Item = (i64, &V)> + '_ {
        self.leaf_ids()
            .into_iter()
            .flat_map(move |leaf| self.leaf_entries(leaf))
    }
}

// ---------------------------------------------------------------------------
// BTreeIndexBlock
// ---------------------------------------------------------------------------

/// Index state for one run
struct BTreeIndex {
    tree: BPlusTree<Vec<RecordId>>,
    unique: bool,
    metrics: MetricsHandle,
    latency: LatencyModel,
}

impl BTreeIndex {
    fn traverse(&self, nodes: usize) {
        self.metrics.increment("btree_lookups");
        self.metrics.histogram("pages_traversed", nodes as f64);
        self.metrics.charge(nodes as f64 * self.latency.memory_access_us);
    }
}

impl KeyIndex for BTreeIndex {
    fn insert(&mut self, key: i64, record_id: RecordId) -> Result<bool, BlockError> {
        if let Some(ids) = self.tree.get_mut(key) {
            if ids.contains(&record_id) {
                return Ok(false);
            }
            if self.unique && !ids.is_empty() {
                self.metrics.increment("unique_violations");
                return Err(BlockError::UniqueViolation(key));
            }
            ids.push(record_id);
            return Ok(true);
        }

        let report = self.tree.insert(key, vec![record_id]).unwrap_or_default();
        if report.splits > 0 {
            self.metrics.counter("page_splits", report.splits as f64);
            for _ in 0..report.splits {
                self.metrics.event(
                    "page_split",
                    json!({ "key": key, "height": self.tree.height() }),
                );
            }
        }
        Ok(true)
    }

    fn remove(&mut self, key: i64, record_id: &RecordId) -> bool {
        let Some(ids) = self.tree.get_mut(key) else {
            return false;
        };
        let before = ids.len();
        ids.retain(|r| r != record_id);
        let (removed, now_empty) = (ids.len() < before, ids.is_empty());
        if now_empty {
            self.tree.remove(key);
        }
        removed
    }

    fn point(&mut self, key: i64) -> Vec<RecordId> {
        self.traverse(self.tree.height());
        self.tree.get(key).cloned().unwrap_or_default()
    }

    fn range(&mut self, start: i64, end: i64) -> Result<Vec<RecordId>, BlockError> {
        let (entries, visited) = self.tree.range(start, end);
        let ids: Vec<RecordId> = entries.into_iter().flat_map(|(_, ids)| ids.clone()).collect();
        self.metrics.increment("range_scans");
        self.traverse(visited);
        Ok(ids)
    }
}

/// B+tree index block.
pub struct BTreeIndexBlock {
    index: BTreeIndex,
    changes: WriteSet<IndexChange>,
}

impl BTreeIndexBlock {
    pub fn new() -> Self {
        Self {
            index: BTreeIndex {
                tree: BPlusTree::new(128),
                unique: false,
                metrics: MetricsHandle::detached("btree_index"),
                latency: LatencyModel::default(),
            },
            changes: WriteSet::new(),
        }
    }

    pub fn definition() -> BlockDefinition {
        BlockDefinition {
            kind: BlockKind::BTreeIndex,
            metadata: Self::build_metadata(),
            inputs: index_inputs(),
            outputs: index_outputs(),
            parameters: Self::build_parameters(),
            constraints: vec![needs_storage()],
            capabilities: [
                Capability::PointLookup,
                Capability::RangeScan,
                Capability::OrderedIteration,
            ]
            .into_iter()
            .collect(),
            capability_requirements: Vec::new(),
            metrics: Self::build_metrics(),
            entry: false,
        }
    }

    // -- Metadata builders ---------------------------------------------------

    fn build_metadata() -> BlockMetadata {
        BlockMetadata {
            id: "btree_index".into(),
            name: "B-tree Index".into(),
            category: BlockCategory::Index,
            description: "Balanced tree index for point lookups and ordered range scans".into(),
            version: "1.0.0".into(),
            documentation: BlockDocumentation {
                overview: "The B+tree keeps keys sorted in leaf pages linked left to right, \
                           with internal pages routing searches. Height grows only when the \
                           root splits, so every leaf is at the same depth."
                    .into(),
                algorithm: "Lookup: binary search each node from root to leaf. Insert: add to \
                            leaf, split on overflow and push the separator up. Range: descend \
                            to the start key, then walk the leaf chain."
                    .into(),
                complexity: Complexity {
                    time: "O(log_f n) lookup and insert, O(log_f n + k) range".into(),
                    space: "O(n)".into(),
                },
                use_cases: vec![
                    "Primary and secondary indexes in OLTP databases".into(),
                    "Range predicates and ORDER BY without sorting".into(),
                ],
                tradeoffs: vec![
                    "Higher fanout means fewer levels but larger pages".into(),
                    "Splits make random inserts more expensive than appends".into(),
                ],
            },
            references: vec![Reference {
                ref_type: ReferenceType::Paper,
                title: "Organization and Maintenance of Large Ordered Indices".into(),
                citation: Some("Bayer, R., McCreight, E. (1972). Acta Informatica.".into()),
            }],
        }
    }

    fn build_parameters() -> Vec<Parameter> {
        vec![
            Parameter::integer("fanout", "Fanout", 128, 3, 1024)
                .with_description("Maximum children per node"),
            Parameter::boolean("unique", "Unique", false)
                .with_description("Reject a second record id for an existing key"),
        ]
    }

    fn build_metrics() -> Vec<MetricDefinition> {
        vec![
            MetricDefinition::counter("btree_lookups", "lookups", "Select probes"),
            MetricDefinition::counter("range_scans", "scans", "Range probes"),
            MetricDefinition::histogram("pages_traversed", "pages", "Nodes visited per probe"),
            MetricDefinition::counter("page_splits", "splits", "Node splits during insert"),
            MetricDefinition::event("page_split", "A node split"),
            MetricDefinition::counter("unique_violations", "rows", "Rejected duplicate keys"),
            MetricDefinition::gauge("tree_height", "levels", "Current tree height"),
            MetricDefinition::gauge("total_keys", "keys", "Indexed keys"),
        ]
    }
}

impl Default for BTreeIndexBlock {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Block trait implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl Block for BTreeIndexBlock {
    fn kind(&self) -> BlockKind {
        BlockKind::BTreeIndex
    }

    async fn initialize(&mut self, ctx: InitContext) -> Result<(), BlockError> {
        let fanout = ctx.usize("fanout")?;
        if !(3..=1024).contains(&fanout) {
            return Err(BlockError::InvalidParameter(
                "fanout must be between 3 and 1024".into(),
            ));
        }
        self.index = BTreeIndex {
            tree: BPlusTree::new(fanout),
            unique: ctx.boolean("unique")?,
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
        gauges.insert("tree_height".into(), self.index.tree.height() as f64);
        gauges.insert("total_keys".into(), self.index.tree.len() as f64);
        gauges
    }

    fn get_state(&self) -> BlockState {
        let mut state = BlockState::new();
        let _ = state.insert("height", self.index.tree.height());
        let _ = state.insert("keys", self.index.tree.len());
        let _ = state.insert("nodes", self.index.tree.node_count());
        let _ = state.insert("unique", self.index.unique);
        state
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categories::test_support::{build, request};
    use crate::categories::PageId;
    use crate::core::block::OperationType;
    use crate::core::metrics::MetricsSink;
    use crate::core::port::{PortValue, Record};

    fn rid(n: u32) -> RecordId {
        RecordId::Slot {
            page: PageId(0),
            slot: n,
        }
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut tree = BPlusTree::new(4);
        for k in [50, 10, 30, 20, 40] {
            tree.insert(k, k * 10).unwrap();
        }
        assert_eq!(tree.get(30), Some(&300));
        assert_eq!(tree.get(35), None);
        assert_eq!(tree.len(), 5);
    }

    #[test]
    fn test_duplicate_key_hands_value_back() {
        let mut tree = BPlusTree::new(4);
        tree.insert(1, "a").unwrap();
        assert_eq!(tree.insert(1, "b"), Err("b"));
        assert_eq!(tree.get(1), Some(&"a"));
    }

    #[test]
    fn test_height_grows_logarithmically() {
        let mut tree = BPlusTree::new(4);
        let mut last_height = tree.height();
        for k in 0..1000 {
            tree.insert(k, ()).unwrap();
            assert!(tree.height() >= last_height, "height must never decrease");
            last_height = tree.height();
        }
        // 3 keys per node: 1000 keys need at least log_4(1000) levels.
        assert!(tree.height() >= 5 && tree.height() <= 12, "height {}", tree.height());
    }

    #[test]
    fn test_in_order_traversal_ascending() {
        let mut tree = BPlusTree::new(3);
        let keys = [17, 3, 99, -4, 42, 8, 23, 61, 0, 15, 77, 5];
        for k in keys {
            tree.insert(k, ()).unwrap();
        }
        let walked: Vec<i64> = tree.iter().map(|(k, _)| k).collect();
        let mut sorted = keys.to_vec();
        sorted.sort();
        assert_eq!(walked, sorted);
    }

    #[test]
    fn test_range_scan_half_open() {
        let mut tree = BPlusTree::new(4);
        for k in 0..100 {
            tree.insert(k, k).unwrap();
        }
        let (entries, visited) = tree.range(10, 20);
        let keys: Vec<i64> = entries.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, (10..20).collect::<Vec<_>>());
        assert!(visited > tree.height());
    }

    #[test]
    fn test_remove_keeps_height() {
        let mut tree = BPlusTree::new(3);
        for k in 0..50 {
            tree.insert(k, ()).unwrap();
        }
        let height = tree.height();
        for k in 0..50 {
            assert!(tree.remove(k).is_some());
        }
        assert!(tree.is_empty());
        assert_eq!(tree.height(), height);
        assert_eq!(tree.remove(3), None);
    }

    #[test]
    fn test_unique_constraint() {
        let mut index = BTreeIndexBlock::new().index;
        index.unique = true;
        index.insert(5, rid(0)).unwrap();
        assert_eq!(index.insert(5, rid(1)), Err(BlockError::UniqueViolation(5)));
    }

    #[test]
    fn test_unique_index_accepts_same_entry_again() {
        let mut index = BTreeIndexBlock::new().index;
        index.unique = true;
        assert_eq!(index.insert(5, rid(0)), Ok(true));
        assert_eq!(index.insert(5, rid(0)), Ok(false));
        assert_eq!(index.point(5), vec![rid(0)]);
    }

    #[test]
    fn test_non_unique_keeps_all_record_ids() {
        let mut index = BTreeIndexBlock::new().index;
        index.insert(5, rid(0)).unwrap();
        index.insert(5, rid(1)).unwrap();
        assert_eq!(index.point(5), vec![rid(0), rid(1)]);

        assert!(index.remove(5, &rid(0)));
        assert!(!index.remove(5, &rid(0)));
        assert_eq!(index.point(5), vec![rid(1)]);
        index.remove(5, &rid(1));
        assert!(index.point(5).is_empty());
        assert!(index.tree.is_empty());
    }

    #[test]
    fn test_non_unique_maps_a_record_id_once() {
        let mut index = BTreeIndexBlock::new().index;
        assert_eq!(index.insert(5, rid(0)), Ok(true));
        assert_eq!(index.insert(5, rid(0)), Ok(false));
        index.insert(5, rid(1)).unwrap();
        assert_eq!(index.point(5), vec![rid(0), rid(1)]);

        index.remove(5, &rid(0));
        assert_eq!(index.point(5), vec![rid(1)]);
    }

    #[tokio::test]
    async fn test_rollback_undoes_aborted_entries_only() {
        let sink = MetricsSink::new(false);
        let mut block = build(BlockKind::BTreeIndex, "idx", &[], &sink, None).await;
        let write = |txn: u64, op: OperationType, k: i64| {
            let rec = Record::new(k).with_record_id(rid(k as u32));
            ExecutionContext::new(request(txn, op, k))
                .with_input("records", PortValue::Records(vec![rec]))
        };

        block.execute(write(1, OperationType::Insert, 1)).await.unwrap();
        block.execute(write(1, OperationType::Insert, 2)).await.unwrap();
        block.commit_transaction(TxnId(1));

        block.execute(write(2, OperationType::Insert, 3)).await.unwrap();
        block.execute(write(2, OperationType::Delete, 1)).await.unwrap();
        // Already indexed by T1; not T2's to take back.
        block.execute(write(2, OperationType::Insert, 2)).await.unwrap();
        block.rollback_transaction(TxnId(2));

        let select = |k: i64| {
            ExecutionContext::new(request(3, OperationType::Select, k))
                .with_input("records", PortValue::Records(vec![Record::new(k)]))
        };
        for (key, expected) in [(1, vec![rid(1)]), (2, vec![rid(2)]), (3, vec![])] {
            let result = block.execute(select(key)).await.unwrap();
            let Some(PortValue::Lookup(lookup)) = result.output("lookup_result") else {
                panic!("select must answer on lookup_result");
            };
            assert_eq!(lookup.record_ids, expected, "key {}", key);
        }
    }

    #[tokio::test]
    async fn test_block_lookup_counts_selects_only() {
        let sink = MetricsSink::new(true);
        let mut block = build(
            BlockKind::BTreeIndex,
            "idx",
            &[("fanout", 4i64.into())],
            &sink,
            None,
        )
        .await;

        for k in 0..20 {
            let rec = Record::new(k).with_record_id(rid(k as u32));
            let ctx = ExecutionContext::new(request(1, OperationType::Insert, k))
                .with_input("records", PortValue::Records(vec![rec]));
            block.execute(ctx).await.unwrap();
        }
        let id = "idx".into();
        assert_eq!(sink.counter(&id, "btree_lookups"), 0.0);
        assert!(sink.counter(&id, "page_splits") > 0.0);

        let ctx = ExecutionContext::new(request(2, OperationType::Select, 7))
            .with_input("records", PortValue::Records(vec![Record::new(7)]));
        let result = block.execute(ctx).await.unwrap();
        match result.output("lookup_result") {
            Some(PortValue::Lookup(lookup)) => assert_eq!(lookup.record_ids, vec![rid(7)]),
            other => panic!("unexpected output {:?}", other),
        }

        assert_eq!(sink.counter(&id, "btree_lookups"), 1.0);
        let height = block.snapshot_metrics()["tree_height"];
        assert_eq!(sink.histogram_values(&id, "pages_traversed"), vec![height]);
    }

    #[tokio::test]
    async fn test_block_range_select() {
        let sink = MetricsSink::new(false);
        let mut block = build(BlockKind::BTreeIndex, "idx", &[], &sink, None).await;
        for k in 0..10 {
            let rec = Record::new(k).with_record_id(RecordId::Key(k));
            let ctx = ExecutionContext::new(request(1, OperationType::Insert, k))
                .with_input("records", PortValue::Records(vec![rec]));
            block.execute(ctx).await.unwrap();
        }

        let ctx = ExecutionContext::new(request(2, OperationType::Select, 3).with_range(4))
            .with_input("records", PortValue::Records(vec![Record::new(3)]));
        let result = block.execute(ctx).await.unwrap();
        let Some(PortValue::Lookup(lookup)) = result.output("lookup_result") else {
            panic!("expected lookup result");
        };
        assert_eq!(
            lookup.record_ids,
            (3..7).map(RecordId::Key).collect::<Vec<_>>()
        );
        assert_eq!(lookup.range_end, Some(7));
    }

    #[tokio::test]
    async fn test_block_rejects_rows_without_record_id() {
        let sink = MetricsSink::new(false);
        let mut block = build(BlockKind::BTreeIndex, "idx", &[], &sink, None).await;
        let ctx = ExecutionContext::new(request(1, OperationType::Insert, 1))
            .with_input("records", PortValue::Records(vec![Record::new(1)]));
        assert!(matches!(
            block.execute(ctx).await,
            Err(BlockError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_definition_capabilities() {
        let def = BTreeIndexBlock::definition();
        assert!(def.offers(Capability::RangeScan));
        assert!(def.offers(Capability::OrderedIteration));
        assert_eq!(def.constraints.len(), 1);
    }
}
