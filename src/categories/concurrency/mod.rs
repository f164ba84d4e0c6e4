//! Concurrency control block implementations
//!
//! Concurrency blocks manage how multiple transactions access shared data
//! safely. They sit between the source and storage: rows arrive on `records`
//! and transaction signals on `txn`, and both are forwarded downstream once
//! the protocol allows it.

pub mod mvcc;
pub mod row_lock;

pub use mvcc::MVCCBlock;
pub use row_lock::RowLockBlock;

use crate::core::port::{DataType, Port, PortType};

pub(crate) fn concurrency_inputs() -> Vec<Port> {
    vec![
        Port::input("records", "Records", PortType::RecordStream, DataType::Row)
            .required()
            .with_description("Rows read or written by transactions"),
        Port::input("txn", "Transaction Control", PortType::TransactionControl, DataType::TxnSignal)
            .required()
            .with_description("Begin, commit and abort signals"),
    ]
}

pub(crate) fn forwarded_outputs() -> Vec<Port> {
    vec![
        Port::output("records", "Records", PortType::RecordStream, DataType::Row)
            .with_description("Rows allowed through to storage"),
        Port::output("txn", "Transaction Control", PortType::TransactionControl, DataType::TxnSignal)
            .with_description("Transaction signals, forwarded after local processing"),
    ]
}
