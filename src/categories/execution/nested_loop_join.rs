//! Nested-Loop Join Execution Block
//!
//! Compares every left row with every right row. No memory beyond the inputs
//! is needed, but the comparison count is |left| × |right|, each one charged
//! to the simulated clock. Next to a hash join on the same inputs it shows
//! why equi-joins are hashed.

use async_trait::async_trait;
use std::collections::BTreeSet;

use super::{combine, join_inputs, join_key_parameter, join_value, rows_output};
use crate::categories::BlockKind;
use crate::core::block::{
    Block, BlockCategory, BlockDocumentation, BlockError, BlockMetadata, BlockState,
    Complexity, ExecutionContext, ExecutionResult, InitContext, Reference, ReferenceType,
};
use crate::core::metrics::{MetricDefinition, MetricsHandle};
use crate::core::port::{PortValue, Record};
use crate::core::registry::BlockDefinition;
use crate::runtime::config::LatencyModel;

pub struct NestedLoopJoinBlock {
    join_key: String,
    metrics: MetricsHandle,
    latency: LatencyModel,
    comparisons: u64,
}

impl NestedLoopJoinBlock {
    pub fn new() -> Self {
        Self {
            join_key: "key".into(),
            metrics: MetricsHandle::detached("nested_loop_join"),
            latency: LatencyModel::default(),
            comparisons: 0,
        }
    }

    pub fn definition() -> BlockDefinition {
        BlockDefinition {
            kind: BlockKind::NestedLoopJoin,
            metadata: Self::build_metadata(),
            inputs: join_inputs(),
            outputs: vec![rows_output()],
            parameters: vec![join_key_parameter()],
            constraints: Vec::new(),
            capabilities: BTreeSet::new(),
            capability_requirements: Vec::new(),
            metrics: vec![
                MetricDefinition::counter("comparisons", "comparisons", "Join key comparisons"),
                MetricDefinition::counter("rows_joined", "rows", "Output rows"),
            ],
            entry: false,
        }
    }

    fn build_metadata() -> BlockMetadata {
        BlockMetadata {
            id: "nested_loop_join".into(),
            name: "Nested-Loop Join".into(),
            category: BlockCategory::QueryExecution,
            description: "Joins by comparing every pair of input rows".into(),
            version: "1.0.0".into(),
            documentation: BlockDocumentation {
                overview: "The simplest join: for each outer row, scan the entire inner input. \
                           It handles any predicate and needs no extra memory, at quadratic cost."
                    .into(),
                algorithm: "FOR l IN left: FOR r IN right: IF l.key = r.key THEN emit(l, r)".into(),
                complexity: Complexity {
                    time: "O(n × m)".into(),
                    space: "O(1) beyond the inputs".into(),
                },
                use_cases: vec![
                    "Tiny inputs".into(),
                    "Baseline to compare hash joins against".into(),
                ],
                tradeoffs: vec!["Quadratic comparisons".into()],
            },
            references: vec![Reference {
                ref_type: ReferenceType::Book,
                title: "Database System Concepts, Chapter 15.5: Join Operation".into(),
                citation: Some(
                    "Silberschatz, A., Korth, H. F., Sudarshan, S. (2019). McGraw-Hill.".into(),
                ),
            }],
        }
    }

    pub fn join(&mut self, left: &[Record], right: &[Record]) -> Vec<Record> {
        let mut joined = Vec::new();
        for l in left {
            let lk = join_value(l, &self.join_key);
            for r in right {
                if lk.is_some() && lk == join_value(r, &self.join_key) {
                    joined.push(combine(l, r));
                }
            }
        }

        let comparisons = (left.len() * right.len()) as u64;
        self.comparisons += comparisons;
        self.metrics.counter("comparisons", comparisons as f64);
        self.metrics.counter("rows_joined", joined.len() as f64);
        self.metrics.charge(comparisons as f64 * self.latency.cpu_compare_us);
        joined
    }
}

impl Default for NestedLoopJoinBlock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Block for NestedLoopJoinBlock {
    fn kind(&self) -> BlockKind {
        BlockKind::NestedLoopJoin
    }

    async fn initialize(&mut self, ctx: InitContext) -> Result<(), BlockError> {
        self.join_key = ctx.string("join_key")?;
        self.latency = ctx.latency;
        self.metrics = ctx.metrics;
        self.comparisons = 0;
        Ok(())
    }

    async fn execute(&mut self, mut ctx: ExecutionContext) -> Result<ExecutionResult, BlockError> {
        let left = ctx.take_records("left");
        let right = ctx.take_records("right");
        if !ctx.request.is_select() {
            return Ok(ExecutionResult::empty());
        }
        let joined = self.join(&left, &right);
        Ok(ExecutionResult::empty().with_output("rows", PortValue::Records(joined)))
    }

    fn get_state(&self) -> BlockState {
        let mut state = BlockState::new();
        let _ = state.insert("comparisons", self.comparisons);
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categories::execution::keyed_rows;
    use crate::categories::test_support::{build, inputs, request};
    use crate::core::block::OperationType;
    use crate::core::metrics::MetricsSink;

    #[tokio::test]
    async fn test_quadratic_comparisons_charged() {
        let sink = MetricsSink::new(false);
        let mut block = build(BlockKind::NestedLoopJoin, "nlj", &[], &sink, None).await;

        let mut ctx = ExecutionContext::new(request(1, OperationType::Select, 0));
        ctx.inputs = inputs(vec![
            ("left", PortValue::Records(keyed_rows(&[1, 2, 3, 4]))),
            ("right", PortValue::Records(keyed_rows(&[2, 3, 9]))),
        ]);
        let before = sink.now_us();
        let result = block.execute(ctx).await.unwrap();

        let rows = result.output("rows").unwrap().clone().into_records();
        assert_eq!(rows.iter().map(|r| r.key).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(sink.counter(&"nlj".into(), "comparisons"), 12.0);
        assert!((sink.now_us() - before - 12.0 * 0.01).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_matches_hash_join_output() {
        let sink = MetricsSink::new(false);
        let mut nlj = build(BlockKind::NestedLoopJoin, "nlj", &[], &sink, None).await;
        let mut hj = build(BlockKind::HashJoin, "hj", &[], &sink, None).await;

        let left = keyed_rows(&[5, 1, 5, 2]);
        let right = keyed_rows(&[5, 2, 7]);
        let mut outputs = Vec::new();
        for block in [&mut nlj, &mut hj] {
            let mut ctx = ExecutionContext::new(request(1, OperationType::Select, 0));
            ctx.inputs = inputs(vec![
                ("left", PortValue::Records(left.clone())),
                ("right", PortValue::Records(right.clone())),
            ]);
            let mut keys: Vec<i64> = block
                .execute(ctx)
                .await
                .unwrap()
                .output("rows")
                .unwrap()
                .clone()
                .into_records()
                .iter()
                .map(|r| r.key)
                .collect();
            keys.sort();
            outputs.push(keys);
        }
        assert_eq!(outputs[0], outputs[1]);
        assert_eq!(outputs[0], vec![2, 5, 5]);
    }
}
