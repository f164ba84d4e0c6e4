//! Composition graph
//!
//! A [`DraftGraph`] is the mutable, user-authored wiring of block instances.
//! Construction errors (unknown block, bad parameter) and wiring errors (type,
//! cardinality, capability) are reported synchronously by the call that
//! causes them. Structural problems that only make sense for the graph as a
//! whole are reported as a batch by [`DraftGraph::validate`].
//!
//! A graph that validates compiles into an immutable
//! [`ExecutionPlan`](super::plan::ExecutionPlan).

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::plan::{CompileError, ExecutionPlan};
use super::validation::{validate_graph, ValidationError};
use crate::core::constraint::Capability;
use crate::core::parameter::{ParameterSet, ParameterValue};
use crate::core::port::Connection;
use crate::core::registry::{BlockDefinition, BlockRegistry, RegistryError};
use crate::core::InstanceId;

// ── Types ───────────────────────────────────────────────────────────────────

/// One block instance inside a graph
#[derive(Debug, Clone)]
pub struct BlockInstance {
    pub instance_id: InstanceId,
    pub definition: Arc<BlockDefinition>,
    /// Resolved parameters, every declared parameter present
    pub parameters: ParameterSet,
}

/// Validation status of a draft
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphStatus {
    /// Modified since the last validation
    Draft,
    Valid,
    Invalid,
}

/// Serializable form of a graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSpec {
    pub instances: Vec<InstanceSpec>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub instance_id: InstanceId,
    pub block_definition_id: String,
    #[serde(default)]
    pub parameters: ParameterSet,
}

/// Construction and wiring errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error("Unknown block: {0}")]
    UnknownBlock(String),

    #[error("Invalid parameter '{parameter}': {reason}")]
    InvalidParameter { parameter: String, reason: String },

    #[error("Unknown instance: {0}")]
    UnknownInstance(InstanceId),

    #[error("Duplicate instance id: {0}")]
    DuplicateInstanceId(InstanceId),

    #[error("Unknown port '{port}' on {instance}: {reason}")]
    UnknownPort {
        instance: InstanceId,
        port: String,
        reason: String,
    },

    #[error("Type mismatch connecting {from} to {to}: {reason}")]
    TypeMismatch {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Cardinality violation on {to}: {reason}")]
    CardinalityViolation { to: String, reason: String },

    #[error("Capability mismatch on {to}: {from} does not offer {capability}")]
    CapabilityMismatch {
        from: String,
        to: String,
        capability: Capability,
    },
}

impl GraphError {
    /// Stable error code for reports
    pub fn code(&self) -> &'static str {
        match self {
            GraphError::UnknownBlock(_) => "UnknownBlock",
            GraphError::InvalidParameter { .. } => "InvalidParameter",
            GraphError::UnknownInstance(_) => "UnknownInstance",
            GraphError::DuplicateInstanceId(_) => "DuplicateInstanceId",
            GraphError::UnknownPort { .. } => "UnknownPort",
            GraphError::TypeMismatch { .. } => "TypeMismatch",
            GraphError::CardinalityViolation { .. } => "CardinalityViolation",
            GraphError::CapabilityMismatch { .. } => "CapabilityMismatch",
        }
    }
}

impl From<RegistryError> for GraphError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UnknownBlock(id) => GraphError::UnknownBlock(id),
            other => GraphError::UnknownBlock(other.to_string()),
        }
    }
}

// ── Draft graph ─────────────────────────────────────────────────────────────

/// Mutable composition graph
#[derive(Debug, Clone)]
pub struct DraftGraph {
    registry: Arc<BlockRegistry>,
    /// Instances in insertion order
    instances: Vec<BlockInstance>,
    connections: Vec<Connection>,
    status: GraphStatus,
}

impl DraftGraph {
    pub fn new(registry: Arc<BlockRegistry>) -> Self {
        Self {
            registry,
            instances: Vec::new(),
            connections: Vec::new(),
            status: GraphStatus::Draft,
        }
    }

    /// Rebuild a graph from its serialized form
    pub fn from_spec(registry: Arc<BlockRegistry>, spec: &GraphSpec) -> Result<Self, GraphError> {
        let mut graph = Self::new(registry);
        for inst in &spec.instances {
            graph.add_block_with_id(
                inst.instance_id.clone(),
                &inst.block_definition_id,
                inst.parameters.clone(),
            )?;
        }
        for c in &spec.connections {
            graph.connect(
                &c.source_instance_id,
                &c.source_port,
                &c.target_instance_id,
                &c.target_port,
            )?;
        }
        Ok(graph)
    }

    pub fn to_spec(&self) -> GraphSpec {
        GraphSpec {
            instances: self
                .instances
                .iter()
                .map(|i| InstanceSpec {
                    instance_id: i.instance_id.clone(),
                    block_definition_id: i.definition.id().to_string(),
                    parameters: i.parameters.clone(),
                })
                .collect(),
            connections: self.connections.clone(),
        }
    }

    // -- Construction ----------------------------------------------------------

    /// Add an instance of `definition_id` under a fresh id
    pub fn add_block(
        &mut self,
        definition_id: &str,
        parameters: ParameterSet,
    ) -> Result<InstanceId, GraphError> {
        self.add_block_with_id(InstanceId::new(), definition_id, parameters)
    }

    /// Add an instance under a caller-chosen id
    pub fn add_block_with_id(
        &mut self,
        instance_id: InstanceId,
        definition_id: &str,
        parameters: ParameterSet,
    ) -> Result<InstanceId, GraphError> {
        if self.position(&instance_id).is_some() {
            return Err(GraphError::DuplicateInstanceId(instance_id));
        }
        let definition = self.registry.lookup(definition_id)?;
        let parameters = definition
            .resolve_parameters(&parameters)
            .map_err(|(parameter, reason)| GraphError::InvalidParameter { parameter, reason })?;

        self.instances.push(BlockInstance {
            instance_id: instance_id.clone(),
            definition,
            parameters,
        });
        self.status = GraphStatus::Draft;
        Ok(instance_id)
    }

    /// Change one parameter of an instance. Rejected when the new value would
    /// make an existing connection violate a capability requirement.
    pub fn set_parameter(
        &mut self,
        instance_id: &InstanceId,
        name: &str,
        value: impl Into<ParameterValue>,
    ) -> Result<(), GraphError> {
        let idx = self.require(instance_id)?;
        let instance = &self.instances[idx];
        let param = instance
            .definition
            .parameters
            .iter()
            .find(|p| p.id == name)
            .ok_or_else(|| GraphError::InvalidParameter {
                parameter: name.to_string(),
                reason: format!("unknown parameter '{}'", name),
            })?;
        let value = param
            .validate(&value.into())
            .map_err(|reason| GraphError::InvalidParameter {
                parameter: name.to_string(),
                reason,
            })?;

        let mut parameters = instance.parameters.clone();
        parameters.insert(name.to_string(), value);
        for c in self.connections.iter().filter(|c| &c.target_instance_id == instance_id) {
            self.check_capability(c, &instance.definition, &parameters)?;
        }

        self.instances[idx].parameters = parameters;
        self.status = GraphStatus::Draft;
        Ok(())
    }

    /// Remove an instance and every connection touching it
    pub fn remove_block(&mut self, instance_id: &InstanceId) -> Result<(), GraphError> {
        let idx = self.require(instance_id)?;
        self.instances.remove(idx);
        self.connections.retain(|c| {
            &c.source_instance_id != instance_id && &c.target_instance_id != instance_id
        });
        self.status = GraphStatus::Draft;
        Ok(())
    }

    /// Connect an output port to an input port
    pub fn connect(
        &mut self,
        from: &InstanceId,
        from_port: &str,
        to: &InstanceId,
        to_port: &str,
    ) -> Result<(), GraphError> {
        let source = &self.instances[self.require(from)?];
        let target = &self.instances[self.require(to)?];

        let out = source.definition.output(from_port).ok_or_else(|| GraphError::UnknownPort {
            instance: from.clone(),
            port: from_port.to_string(),
            reason: missing_port_reason(&source.definition, from_port, "output"),
        })?;
        let input = target.definition.input(to_port).ok_or_else(|| GraphError::UnknownPort {
            instance: to.clone(),
            port: to_port.to_string(),
            reason: missing_port_reason(&target.definition, to_port, "input"),
        })?;

        let from_label = format!("{}:{}", from, from_port);
        let to_label = format!("{}:{}", to, to_port);

        if out.port_type != input.port_type {
            return Err(GraphError::TypeMismatch {
                from: from_label,
                to: to_label,
                reason: format!("port type {} vs {}", out.port_type, input.port_type),
            });
        }
        if out.data_type != input.data_type {
            return Err(GraphError::TypeMismatch {
                from: from_label,
                to: to_label,
                reason: format!("payload {:?} vs {:?}", out.data_type, input.data_type),
            });
        }
        if out.cardinality != input.cardinality {
            return Err(GraphError::CardinalityViolation {
                to: to_label,
                reason: format!("{:?} output into {:?} input", out.cardinality, input.cardinality),
            });
        }

        let bound = self
            .connections
            .iter()
            .filter(|c| &c.target_instance_id == to && c.target_port == to_port)
            .count();
        if bound > 0 && !input.fan_in {
            return Err(GraphError::CardinalityViolation {
                to: to_label,
                reason: "input is already bound and declares no fan-in".into(),
            });
        }

        let connection = Connection::new(from.clone(), from_port, to.clone(), to_port);
        if self.connections.contains(&connection) {
            return Err(GraphError::CardinalityViolation {
                to: to_label,
                reason: "connection already exists".into(),
            });
        }
        self.check_capability(&connection, &target.definition, &target.parameters)?;

        tracing::debug!(connection = %connection, "connected");
        self.connections.push(connection);
        self.status = GraphStatus::Draft;
        Ok(())
    }

    // -- Validation and compilation ----------------------------------------------

    /// Structural validation; an empty list means the graph compiles
    pub fn validate(&mut self) -> Vec<ValidationError> {
        let errors = validate_graph(self);
        self.status = if errors.is_empty() {
            GraphStatus::Valid
        } else {
            GraphStatus::Invalid
        };
        errors
    }

    /// Validate and compile into an execution plan
    pub fn compile(&mut self) -> Result<ExecutionPlan, CompileError> {
        let result = ExecutionPlan::compile(self);
        self.status = if result.is_ok() {
            GraphStatus::Valid
        } else {
            GraphStatus::Invalid
        };
        result
    }

    // -- Accessors ---------------------------------------------------------------

    pub fn registry(&self) -> &Arc<BlockRegistry> {
        &self.registry
    }

    pub fn instances(&self) -> &[BlockInstance] {
        &self.instances
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn instance(&self, instance_id: &InstanceId) -> Option<&BlockInstance> {
        self.instances.iter().find(|i| &i.instance_id == instance_id)
    }

    /// Insertion index of an instance
    pub fn position(&self, instance_id: &InstanceId) -> Option<usize> {
        self.instances.iter().position(|i| &i.instance_id == instance_id)
    }

    pub fn status(&self) -> GraphStatus {
        self.status
    }

    fn require(&self, instance_id: &InstanceId) -> Result<usize, GraphError> {
        self.position(instance_id)
            .ok_or_else(|| GraphError::UnknownInstance(instance_id.clone()))
    }

    fn check_capability(
        &self,
        connection: &Connection,
        target: &BlockDefinition,
        target_parameters: &ParameterSet,
    ) -> Result<(), GraphError> {
        let Some(source) = self.instance(&connection.source_instance_id) else {
            return Ok(());
        };
        for req in &target.capability_requirements {
            if req.port == connection.target_port
                && req.applies(target_parameters)
                && !source.definition.offers(req.capability)
            {
                return Err(GraphError::CapabilityMismatch {
                    from: format!("{} ({})", source.instance_id, source.definition.id()),
                    to: format!("{}:{}", connection.target_instance_id, connection.target_port),
                    capability: req.capability,
                });
            }
        }
        Ok(())
    }
}

fn missing_port_reason(definition: &BlockDefinition, port: &str, wanted: &str) -> String {
    let exists_other_way = match wanted {
        "output" => definition.input(port).is_some(),
        _ => definition.output(port).is_some(),
    };
    if exists_other_way {
        format!("'{}' is not an {} port of {}", port, wanted, definition.id())
    } else {
        format!("{} declares no {} port '{}'", definition.id(), wanted, port)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> DraftGraph {
        DraftGraph::new(Arc::new(BlockRegistry::with_builtin_blocks()))
    }

    fn params(pairs: &[(&str, ParameterValue)]) -> ParameterSet {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn add(g: &mut DraftGraph, id: &str, def: &str) -> InstanceId {
        g.add_block_with_id(id.into(), def, ParameterSet::new()).unwrap()
    }

    #[test]
    fn test_add_block_resolves_defaults() {
        let mut g = graph();
        let id = g.add_block("btree_index", params(&[("unique", true.into())])).unwrap();
        let inst = g.instance(&id).unwrap();
        assert_eq!(inst.parameters["unique"], ParameterValue::Boolean(true));
        assert!(inst.parameters.len() > 1);
        assert_eq!(g.status(), GraphStatus::Draft);
    }

    #[test]
    fn test_add_block_errors() {
        let mut g = graph();
        assert_eq!(
            g.add_block("quantum_index", ParameterSet::new()).unwrap_err(),
            GraphError::UnknownBlock("quantum_index".into())
        );

        let err = g
            .add_block("heap_storage", params(&[("colour", "blue".into())]))
            .unwrap_err();
        assert_eq!(err.code(), "InvalidParameter");

        let err = g
            .add_block("index_scan", params(&[("scan_type", "sideways".into())]))
            .unwrap_err();
        assert_eq!(err.code(), "InvalidParameter");
        assert!(g.instances().is_empty());

        add(&mut g, "heap", "heap_storage");
        assert_eq!(
            g.add_block_with_id("heap".into(), "heap_storage", ParameterSet::new())
                .unwrap_err(),
            GraphError::DuplicateInstanceId("heap".into())
        );
    }

    #[test]
    fn test_connect_checks_ports_and_types() {
        let mut g = graph();
        let schema = add(&mut g, "schema", "schema");
        let heap = add(&mut g, "heap", "heap_storage");
        let btree = add(&mut g, "btree", "btree_index");
        let scan = add(&mut g, "scan", "sequential_scan");

        g.connect(&schema, "records", &heap, "records").unwrap();
        g.connect(&heap, "stored", &btree, "records").unwrap();

        let err = g.connect(&heap, "nope", &btree, "records").unwrap_err();
        assert_eq!(err.code(), "UnknownPort");
        let err = g.connect(&heap, "records", &btree, "records").unwrap_err();
        assert!(err.to_string().contains("not an output port"), "{}", err);

        let err = g.connect(&btree, "lookup_result", &scan, "pages").unwrap_err();
        assert_eq!(err.code(), "TypeMismatch");

        let err = g.connect(&schema, "records", &btree, "records").unwrap_err();
        assert_eq!(err.code(), "TypeMismatch");

        let err = g.connect(&"ghost".into(), "records", &heap, "records").unwrap_err();
        assert_eq!(err, GraphError::UnknownInstance("ghost".into()));
    }

    #[test]
    fn test_single_input_binds_once() {
        let mut g = graph();
        let schema = add(&mut g, "schema", "schema");
        let heap = add(&mut g, "heap", "heap_storage");
        let heap2 = add(&mut g, "heap2", "heap_storage");
        let btree = add(&mut g, "btree", "btree_index");
        let iscan = add(&mut g, "iscan", "index_scan");
        g.connect(&schema, "records", &heap, "records").unwrap();
        g.connect(&schema, "records", &heap2, "records").unwrap();
        g.connect(&heap, "stored", &btree, "records").unwrap();
        g.connect(&btree, "lookup_result", &iscan, "lookup_result").unwrap();

        let err = g.connect(&btree, "lookup_result", &iscan, "lookup_result").unwrap_err();
        assert_eq!(err.code(), "CardinalityViolation");

        // A second storage feeding the same non-fan-in stream input.
        let err = g.connect(&heap2, "stored", &btree, "records").unwrap_err();
        assert_eq!(err.code(), "CardinalityViolation");
    }

    #[test]
    fn test_fan_in_accepts_several_sources() {
        let mut g = graph();
        let a = add(&mut g, "a", "sequential_scan");
        let b = add(&mut g, "b", "sequential_scan");
        let sort = add(&mut g, "sort", "sort");
        g.connect(&a, "rows", &sort, "rows").unwrap();
        g.connect(&b, "rows", &sort, "rows").unwrap();
        assert_eq!(g.connections().len(), 2);
    }

    #[test]
    fn test_capability_mismatch() {
        let mut g = graph();
        let hash = add(&mut g, "hash", "hash_index");
        let range = g
            .add_block_with_id(
                "range".into(),
                "index_scan",
                params(&[("scan_type", "range".into())]),
            )
            .unwrap();
        let err = g.connect(&hash, "lookup_result", &range, "lookup_result").unwrap_err();
        assert_eq!(err.code(), "CapabilityMismatch");

        // Point mode accepts the hash index, but cannot be switched to range later.
        let point = add(&mut g, "point", "index_scan");
        g.connect(&hash, "lookup_result", &point, "lookup_result").unwrap();
        let err = g.set_parameter(&point, "scan_type", "range").unwrap_err();
        assert_eq!(err.code(), "CapabilityMismatch");
        assert_eq!(
            g.instance(&point).unwrap().parameters["scan_type"],
            ParameterValue::String("point".into())
        );
    }

    #[test]
    fn test_remove_block_drops_connections() {
        let mut g = graph();
        let schema = add(&mut g, "schema", "schema");
        let heap = add(&mut g, "heap", "heap_storage");
        g.connect(&schema, "records", &heap, "records").unwrap();
        g.remove_block(&heap).unwrap();
        assert!(g.connections().is_empty());
        assert_eq!(g.instances().len(), 1);
        assert_eq!(g.remove_block(&heap).unwrap_err().code(), "UnknownInstance");
    }

    #[test]
    fn test_spec_roundtrip_through_json() {
        let mut g = graph();
        let schema = add(&mut g, "schema", "schema");
        let heap = add(&mut g, "heap", "heap_storage");
        g.connect(&schema, "records", &heap, "records").unwrap();

        let json = serde_json::to_string(&g.to_spec()).unwrap();
        let spec: GraphSpec = serde_json::from_str(&json).unwrap();
        let rebuilt = DraftGraph::from_spec(g.registry().clone(), &spec).unwrap();
        assert_eq!(rebuilt.to_spec(), g.to_spec());
    }

    #[test]
    fn test_status_tracks_validation() {
        let mut g = graph();
        let schema = add(&mut g, "schema", "schema");
        let heap = add(&mut g, "heap", "heap_storage");
        assert!(!g.validate().is_empty());
        assert_eq!(g.status(), GraphStatus::Invalid);

        g.connect(&schema, "records", &heap, "records").unwrap();
        assert_eq!(g.status(), GraphStatus::Draft);
        assert!(g.validate().is_empty());
        assert_eq!(g.status(), GraphStatus::Valid);
    }
}
