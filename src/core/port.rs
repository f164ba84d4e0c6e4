//! Port system for block connections
//!
//! Ports are the typed endpoints of a block. A connection is only legal when
//! the semantic [`PortType`], the payload [`DataType`] and the [`Cardinality`]
//! of both ends agree exactly. This module also defines the values that flow
//! through ports at run time.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

use crate::categories::{PageId, RecordId};
use crate::core::{InstanceId, TxnId};

/// Port definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    /// Port identifier, unique per direction within a block
    pub id: String,
    /// Human-readable port name
    pub name: String,
    /// Semantic type
    pub port_type: PortType,
    /// Payload carried by the port
    pub data_type: DataType,
    /// Single value or stream per unit of work
    pub cardinality: Cardinality,
    /// Port direction (input or output)
    pub direction: PortDirection,
    /// Whether an input must be bound before the graph can compile
    pub required: bool,
    /// Whether a stream input may merge several connections
    pub fan_in: bool,
    /// Port description
    pub description: String,
}

impl Port {
    fn new(
        id: &str,
        name: &str,
        port_type: PortType,
        data_type: DataType,
        direction: PortDirection,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            port_type,
            data_type,
            cardinality: port_type.default_cardinality(),
            direction,
            required: false,
            fan_in: false,
            description: String::new(),
        }
    }

    /// Create an optional input port with the port type's default cardinality
    pub fn input(id: &str, name: &str, port_type: PortType, data_type: DataType) -> Self {
        Self::new(id, name, port_type, data_type, PortDirection::Input)
    }

    /// Create an output port with the port type's default cardinality
    pub fn output(id: &str, name: &str, port_type: PortType, data_type: DataType) -> Self {
        Self::new(id, name, port_type, data_type, PortDirection::Output)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_fan_in(mut self) -> Self {
        self.fan_in = true;
        self
    }

    pub fn with_cardinality(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Port direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortDirection {
    /// Input port
    Input,
    /// Output port
    Output,
}

/// Semantic port types. This set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortType {
    RecordStream,
    PageStream,
    IndexLookupRequest,
    IndexLookupResult,
    TransactionControl,
    LockRequest,
    LockGrant,
    Statistics,
    Metrics,
}

impl PortType {
    pub fn default_cardinality(self) -> Cardinality {
        match self {
            PortType::RecordStream
            | PortType::PageStream
            | PortType::LockRequest
            | PortType::LockGrant
            | PortType::Metrics => Cardinality::Stream,
            PortType::IndexLookupRequest
            | PortType::IndexLookupResult
            | PortType::TransactionControl
            | PortType::Statistics => Cardinality::Single,
        }
    }
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PortType::RecordStream => "record-stream",
            PortType::PageStream => "page-stream",
            PortType::IndexLookupRequest => "index-lookup-request",
            PortType::IndexLookupResult => "index-lookup-result",
            PortType::TransactionControl => "transaction-control",
            PortType::LockRequest => "lock-request",
            PortType::LockGrant => "lock-grant",
            PortType::Statistics => "statistics",
            PortType::Metrics => "metrics",
        };
        f.write_str(name)
    }
}

/// Payload data types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Logical row without a physical location
    Row,
    /// Row carrying the record id assigned by a storage block
    StoredRow,
    /// Page reference, optionally with page contents attached
    PageRef,
    /// Key or key range to look up
    KeyRange,
    /// Record ids resolved by an index
    RecordIds,
    /// Begin / commit / abort signal
    TxnSignal,
    /// Lock request or grant
    LockSpec,
    /// Row and page counts
    TableStats,
    /// Metric samples
    MetricSample,
}

/// Whether a port carries one value or a stream of values per unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    Single,
    Stream,
}

/// Port value - actual data flowing through ports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PortValue {
    /// Rows, with or without record ids
    Records(Vec<Record>),
    /// Page references
    Pages(Vec<PageRef>),
    /// Result of an index probe
    Lookup(IndexLookup),
    /// Transaction control signal
    Txn(TxnSignal),
    /// No value
    None,
}

impl PortValue {
    /// Check if the value is empty/none
    pub fn is_none(&self) -> bool {
        matches!(self, PortValue::None)
    }

    /// Get the number of items in the value
    pub fn len(&self) -> usize {
        match self {
            PortValue::Records(records) => records.len(),
            PortValue::Pages(pages) => pages.len(),
            PortValue::Lookup(lookup) => lookup.record_ids.len(),
            PortValue::Txn(_) => 1,
            PortValue::None => 0,
        }
    }

    /// Check if the value contains no items
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge a value arriving on a fan-in port with what is already there.
    pub fn merge(self, other: PortValue) -> PortValue {
        match (self, other) {
            (PortValue::None, v) | (v, PortValue::None) => v,
            (PortValue::Records(mut a), PortValue::Records(b)) => {
                a.extend(b);
                PortValue::Records(a)
            }
            (PortValue::Pages(mut a), PortValue::Pages(b)) => {
                a.extend(b);
                PortValue::Pages(a)
            }
            // Single-valued payloads: the first binding wins.
            (first, _) => first,
        }
    }

    pub fn into_records(self) -> Vec<Record> {
        match self {
            PortValue::Records(records) => records,
            _ => Vec::new(),
        }
    }

    pub fn into_pages(self) -> Vec<PageRef> {
        match self {
            PortValue::Pages(pages) => pages,
            _ => Vec::new(),
        }
    }
}

/// A single record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Primary key
    pub key: i64,
    /// Record data as key-value pairs
    pub data: BTreeMap<String, JsonValue>,
    /// Physical location, set once a storage block has placed the record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<RecordId>,
}

impl Record {
    /// Create a record holding only its key
    pub fn new(key: i64) -> Self {
        let mut data = BTreeMap::new();
        data.insert("key".to_string(), JsonValue::from(key));
        Self {
            key,
            data,
            record_id: None,
        }
    }

    /// Insert a field into the record
    pub fn insert<T: Serialize>(&mut self, key: &str, value: T) -> Result<(), serde_json::Error> {
        let json_value = serde_json::to_value(value)?;
        self.data.insert(key.to_string(), json_value);
        Ok(())
    }

    /// Get a field from the record
    pub fn get<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<Option<T>, serde_json::Error> {
        match self.data.get(key) {
            Some(value) => {
                let result = serde_json::from_value(value.clone())?;
                Ok(Some(result))
            }
            None => Ok(None),
        }
    }

    /// Read a column used as a join or sort key. Integer columns compare
    /// numerically; anything else falls back to its JSON text.
    pub fn column_key(&self, column: &str) -> Option<ColumnKey> {
        match self.data.get(column)? {
            JsonValue::Number(n) => n.as_i64().map(ColumnKey::Int),
            other => Some(ColumnKey::Text(other.to_string())),
        }
    }

    pub fn with_record_id(mut self, record_id: RecordId) -> Self {
        self.record_id = Some(record_id);
        self
    }

    /// Estimated on-page size: JSON length plus a 16-byte slot header.
    pub fn estimated_size(&self) -> usize {
        let json_size = serde_json::to_string(&self.data)
            .map(|s| s.len())
            .unwrap_or(64);
        json_size + 16
    }
}

/// Comparable value of a single column
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ColumnKey {
    Int(i64),
    Text(String),
}

/// Page reference emitted on page streams
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageRef {
    pub id: PageId,
    /// Page image, present once a buffer pool has materialized the page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<Record>>,
}

impl PageRef {
    pub fn new(id: PageId) -> Self {
        Self { id, records: None }
    }
}

/// Result of an index probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexLookup {
    pub key: i64,
    /// Exclusive upper bound for range probes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_end: Option<i64>,
    pub record_ids: Vec<RecordId>,
}

/// Transaction control kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnSignalKind {
    Begin,
    Commit,
    Abort,
}

/// Transaction control signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnSignal {
    pub txn: TxnId,
    pub kind: TxnSignalKind,
}

/// Connection between ports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Source instance ID
    pub source_instance_id: InstanceId,
    /// Source port ID
    pub source_port: String,
    /// Target instance ID
    pub target_instance_id: InstanceId,
    /// Target port ID
    pub target_port: String,
}

impl Connection {
    /// Create a new connection
    pub fn new(
        source_instance_id: InstanceId,
        source_port: impl Into<String>,
        target_instance_id: InstanceId,
        target_port: impl Into<String>,
    ) -> Self {
        Self {
            source_instance_id,
            source_port: source_port.into(),
            target_instance_id,
            target_port: target_port.into(),
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.source_instance_id, self.source_port, self.target_instance_id, self.target_port
        )
    }
}
