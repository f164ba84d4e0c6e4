//! Schema Source Block
//!
//! The entry point of every design. It turns workload requests into rows and
//! transaction control signals that flow downstream.
//!
//! ## How it works
//!
//! Each data operation becomes one row holding the request key plus
//! `columns` generated text columns. The generated values are derived from the
//! key and the request sequence, so the same workload always produces the same
//! rows. The total payload is spread evenly over the columns. Begin, commit
//! and abort requests are emitted on `txn` only.
//!
//! ## Metrics tracked
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `rows_generated` | Counter | Rows emitted for data operations |
//! | `bytes_generated` | Counter | Estimated size of emitted rows |
//! | `txn_signals` | Counter | Begin/commit/abort signals emitted |

use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::categories::BlockKind;
use crate::core::block::{
    Block, BlockCategory, BlockDocumentation, BlockError, BlockMetadata, BlockState,
    Complexity, ExecutionContext, ExecutionResult, InitContext, Request, RequestKind,
};
use crate::core::metrics::{MetricDefinition, MetricsHandle};
use crate::core::parameter::Parameter;
use crate::core::port::{
    DataType, Port, PortType, PortValue, Record, TxnSignal, TxnSignalKind,
};
use crate::core::registry::BlockDefinition;

/// Workload entry block.
pub struct SchemaBlock {
    columns: usize,
    metrics: MetricsHandle,
    rows_generated: u64,
}

impl SchemaBlock {
    pub fn new() -> Self {
        Self {
            columns: 4,
            metrics: MetricsHandle::detached("schema"),
            rows_generated: 0,
        }
    }

    pub fn definition() -> BlockDefinition {
        BlockDefinition {
            kind: BlockKind::Schema,
            metadata: Self::build_metadata(),
            inputs: Vec::new(),
            outputs: Self::build_outputs(),
            parameters: Self::build_parameters(),
            constraints: Vec::new(),
            capabilities: BTreeSet::new(),
            capability_requirements: Vec::new(),
            metrics: Self::build_metrics(),
            entry: true,
        }
    }

    // -- Metadata builders ---------------------------------------------------

    fn build_metadata() -> BlockMetadata {
        BlockMetadata {
            id: "schema".into(),
            name: "Table Schema".into(),
            category: BlockCategory::Source,
            description: "Entry point that turns workload requests into rows and transaction signals"
                .into(),
            version: "1.0.0".into(),
            documentation: BlockDocumentation {
                overview: "Defines the shape of the simulated table and feeds the rest of the \
                           design with one row per data operation."
                    .into(),
                algorithm: "Row = primary key + N generated columns sized from the request \
                            payload. Control requests become transaction signals."
                    .into(),
                complexity: Complexity {
                    time: "O(columns) per request".into(),
                    space: "O(1)".into(),
                },
                use_cases: vec!["Every design starts here".into()],
                tradeoffs: vec!["Wider rows fill pages faster".into()],
            },
            references: Vec::new(),
        }
    }

    fn build_outputs() -> Vec<Port> {
        vec![
            Port::output("records", "Records", PortType::RecordStream, DataType::Row)
                .with_description("One generated row per data operation"),
            Port::output("txn", "Transaction Control", PortType::TransactionControl, DataType::TxnSignal)
                .with_description("Begin, commit and abort signals"),
        ]
    }

    fn build_parameters() -> Vec<Parameter> {
        vec![Parameter::integer("columns", "Columns", 4, 1, 32)
            .with_description("Generated columns per row in addition to the key")]
    }

    fn build_metrics() -> Vec<MetricDefinition> {
        vec![
            MetricDefinition::counter("rows_generated", "rows", "Rows emitted for data operations"),
            MetricDefinition::counter("bytes_generated", "bytes", "Estimated size of emitted rows"),
            MetricDefinition::counter("txn_signals", "signals", "Transaction signals emitted"),
        ]
    }

    // -- Core operations -----------------------------------------------------

    /// Generate the row for a data operation.
    fn generate_row(&self, request: &Request) -> Record {
        let mut record = Record::new(request.key);
        let width = (request.payload_bytes / self.columns).max(1);
        for col in 0..self.columns {
            let seed = format!("{}-{}-{}", request.key, request.seq, col);
            let mut value = String::with_capacity(width);
            while value.len() < width {
                value.push_str(&seed);
            }
            value.truncate(width);
            record
                .data
                .insert(format!("col_{}", col), serde_json::Value::String(value));
        }
        record
    }
}

impl Default for SchemaBlock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Block for SchemaBlock {
    fn kind(&self) -> BlockKind {
        BlockKind::Schema
    }

    async fn initialize(&mut self, ctx: InitContext) -> Result<(), BlockError> {
        self.columns = ctx.usize("columns")?.max(1);
        self.metrics = ctx.metrics;
        self.rows_generated = 0;
        Ok(())
    }

    async fn execute(&mut self, ctx: ExecutionContext) -> Result<ExecutionResult, BlockError> {
        let request = &ctx.request;
        let signal = |kind| {
            PortValue::Txn(TxnSignal {
                txn: request.txn,
                kind,
            })
        };

        let result = match request.kind {
            RequestKind::Begin => ExecutionResult::empty().with_output("txn", signal(TxnSignalKind::Begin)),
            RequestKind::Commit => ExecutionResult::empty().with_output("txn", signal(TxnSignalKind::Commit)),
            RequestKind::Abort => ExecutionResult::empty().with_output("txn", signal(TxnSignalKind::Abort)),
            RequestKind::Operation(_) => {
                let row = self.generate_row(request);
                self.rows_generated += 1;
                self.metrics.increment("rows_generated");
                self.metrics.counter("bytes_generated", row.estimated_size() as f64);
                return Ok(ExecutionResult::empty().with_output("records", PortValue::Records(vec![row])));
            }
        };

        self.metrics.increment("txn_signals");
        Ok(result)
    }

    fn get_state(&self) -> BlockState {
        let mut state = BlockState::new();
        let _ = state.insert("columns", self.columns);
        let _ = state.insert("rows_generated", self.rows_generated);
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categories::test_support::{build, request};
    use crate::core::block::OperationType;
    use crate::core::metrics::MetricsSink;
    use crate::core::TxnId;

    #[tokio::test]
    async fn test_operation_becomes_row() {
        let sink = MetricsSink::new(false);
        let mut block = build(BlockKind::Schema, "src", &[("columns", 3i64.into())], &sink, None).await;

        let mut req = request(1, OperationType::Insert, 42);
        req.payload_bytes = 30;
        let result = block.execute(ExecutionContext::new(req)).await.unwrap();

        let rows = result.output("records").unwrap().clone().into_records();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, 42);
        assert_eq!(rows[0].get::<i64>("key").unwrap(), Some(42));
        assert_eq!(rows[0].get::<String>("col_2").unwrap().map(|s| s.len()), Some(10));
        assert!(result.output("txn").is_none());
        assert_eq!(sink.counter(&"src".into(), "rows_generated"), 1.0);
    }

    #[tokio::test]
    async fn test_control_becomes_signal() {
        let sink = MetricsSink::new(false);
        let mut block = build(BlockKind::Schema, "src", &[], &sink, None).await;

        let req = Request::control(TxnId(5), RequestKind::Commit);
        let result = block.execute(ExecutionContext::new(req)).await.unwrap();

        assert_eq!(
            result.output("txn"),
            Some(&PortValue::Txn(TxnSignal {
                txn: TxnId(5),
                kind: TxnSignalKind::Commit
            }))
        );
        assert!(result.output("records").is_none());
    }

    #[test]
    fn test_definition_is_entry() {
        let def = SchemaBlock::definition();
        assert!(def.entry);
        assert!(def.inputs.is_empty());
        assert_eq!(def.outputs.len(), 2);
    }
}
