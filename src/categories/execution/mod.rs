//! Execution block implementations
//!
//! Execution blocks implement query processing operators: scans, joins and
//! sort. They act on selects only; writes pass them by. Every operator emits
//! its result on `rows`, and rows left on an unconnected `rows` port are the
//! request's answer.

pub mod hash_join;
pub mod index_scan;
pub mod nested_loop_join;
pub mod sequential_scan;
pub mod sort;

pub use hash_join::HashJoinBlock;
pub use index_scan::IndexScanBlock;
pub use nested_loop_join::NestedLoopJoinBlock;
pub use sequential_scan::SequentialScanBlock;
pub use sort::SortBlock;

use crate::core::parameter::Parameter;
use crate::core::port::{ColumnKey, DataType, Port, PortType, Record};

pub(crate) fn rows_output() -> Port {
    Port::output("rows", "Rows", PortType::RecordStream, DataType::Row)
        .with_description("Result rows of the operator")
}

pub(crate) fn join_inputs() -> Vec<Port> {
    vec![
        Port::input("left", "Left", PortType::RecordStream, DataType::Row)
            .required()
            .with_description("Outer input rows"),
        Port::input("right", "Right", PortType::RecordStream, DataType::Row)
            .required()
            .with_description("Inner input rows"),
    ]
}

pub(crate) fn join_key_parameter() -> Parameter {
    Parameter::string("join_key", "Join Key", "key")
        .with_description("Column both inputs are joined on")
}

/// Output row of an equi-join: the left key, every column prefixed by side.
pub(crate) fn combine(left: &Record, right: &Record) -> Record {
    let mut joined = Record::new(left.key);
    for (column, value) in &left.data {
        joined.data.insert(format!("left_{}", column), value.clone());
    }
    for (column, value) in &right.data {
        joined.data.insert(format!("right_{}", column), value.clone());
    }
    joined
}

/// Join key of a row; rows without the column never match.
pub(crate) fn join_value(record: &Record, column: &str) -> Option<ColumnKey> {
    record.column_key(column)
}

#[cfg(test)]
pub(crate) fn keyed_rows(keys: &[i64]) -> Vec<Record> {
    keys.iter().map(|&k| Record::new(k)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_prefixes_columns() {
        let mut left = Record::new(1);
        left.insert("name", "a").unwrap();
        let right = Record::new(1);
        let joined = combine(&left, &right);
        assert_eq!(joined.key, 1);
        assert_eq!(joined.get::<String>("left_name").unwrap(), Some("a".into()));
        assert_eq!(joined.get::<i64>("right_key").unwrap(), Some(1));
        assert_eq!(join_value(&joined, "left_key"), Some(ColumnKey::Int(1)));
    }
}
