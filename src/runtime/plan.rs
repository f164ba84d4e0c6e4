//! Execution plan
//!
//! The compiled, immutable form of a validated graph: instances in
//! topological order with their input bindings resolved to earlier steps.
//! Ties between independent instances are broken by insertion order, so the
//! same graph always compiles to the same plan.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use super::graph::DraftGraph;
use super::validation::{validate_graph, ValidationError};
use crate::core::block::BlockCategory;
use crate::core::parameter::ParameterSet;
use crate::core::registry::BlockDefinition;
use crate::core::InstanceId;

/// Where an input port reads its value from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputBinding {
    pub port: String,
    /// Index of the producing step; always lower than the consumer's
    pub from_step: usize,
    pub from_port: String,
}

/// One instance in plan order
#[derive(Debug, Clone)]
pub struct PlanStep {
    pub instance_id: InstanceId,
    pub definition: Arc<BlockDefinition>,
    pub parameters: ParameterSet,
    /// Input bindings in connection order
    pub bindings: Vec<InputBinding>,
    pub is_entry: bool,
    /// Nearest upstream storage step, whose handle the block receives
    pub storage_source: Option<usize>,
    /// Output ports with at least one consumer
    pub connected_outputs: BTreeSet<String>,
}

/// Compilation failure
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error("Graph failed validation with {} error(s)", .0.len())]
    Invalid(Vec<ValidationError>),
}

impl CompileError {
    pub fn validation_errors(&self) -> &[ValidationError] {
        match self {
            CompileError::Invalid(errors) => errors,
        }
    }
}

/// Topologically ordered, immutable plan
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    steps: Vec<PlanStep>,
    by_instance: BTreeMap<InstanceId, usize>,
}

impl ExecutionPlan {
    /// Validate `graph` and order it with Kahn's algorithm
    pub fn compile(graph: &DraftGraph) -> Result<Self, CompileError> {
        let errors = validate_graph(graph);
        if !errors.is_empty() {
            return Err(CompileError::Invalid(errors));
        }

        let instances = graph.instances();
        let n = instances.len();
        let mut in_degree = vec![0usize; n];
        let mut children: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
        for c in graph.connections() {
            if let (Some(s), Some(t)) = (
                graph.position(&c.source_instance_id),
                graph.position(&c.target_instance_id),
            ) {
                if children[s].insert(t) {
                    in_degree[t] += 1;
                }
            }
        }

        // Ready set ordered by insertion index
        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &child in &children[next] {
                in_degree[child] -= 1;
                if in_degree[child] == 0 {
                    ready.insert(child);
                }
            }
        }
        // Validation already rejected cycles.
        assert_eq!(order.len(), n, "acyclic graph must order every instance");

        let step_of: BTreeMap<&InstanceId, usize> = order
            .iter()
            .enumerate()
            .map(|(step, &idx)| (&instances[idx].instance_id, step))
            .collect();

        let mut steps: Vec<PlanStep> = order
            .iter()
            .map(|&idx| {
                let inst = &instances[idx];
                PlanStep {
                    instance_id: inst.instance_id.clone(),
                    definition: Arc::clone(&inst.definition),
                    parameters: inst.parameters.clone(),
                    bindings: Vec::new(),
                    is_entry: inst.definition.entry,
                    storage_source: None,
                    connected_outputs: BTreeSet::new(),
                }
            })
            .collect();

        for c in graph.connections() {
            let from_step = step_of[&c.source_instance_id];
            let to_step = step_of[&c.target_instance_id];
            steps[to_step].bindings.push(InputBinding {
                port: c.target_port.clone(),
                from_step,
                from_port: c.source_port.clone(),
            });
            steps[from_step].connected_outputs.insert(c.source_port.clone());
        }

        for step in 0..steps.len() {
            steps[step].storage_source = nearest_storage(&steps, step);
        }

        let by_instance = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.instance_id.clone(), i))
            .collect();

        tracing::debug!(
            steps = steps.len(),
            order = ?steps.iter().map(|s| s.instance_id.as_str()).collect::<Vec<_>>(),
            "compiled execution plan"
        );
        Ok(Self { steps, by_instance })
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> &PlanStep {
        &self.steps[index]
    }

    pub fn step_index(&self, instance_id: &InstanceId) -> Option<usize> {
        self.by_instance.get(instance_id).copied()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Instance ids in execution order
    pub fn order(&self) -> Vec<InstanceId> {
        self.steps.iter().map(|s| s.instance_id.clone()).collect()
    }
}

/// Breadth-first search upstream; the first storage step found wins, with
/// bindings visited in connection order.
fn nearest_storage(steps: &[PlanStep], start: usize) -> Option<usize> {
    let mut seen = BTreeSet::new();
    let mut queue: VecDeque<usize> = steps[start].bindings.iter().map(|b| b.from_step).collect();
    while let Some(step) = queue.pop_front() {
        if !seen.insert(step) {
            continue;
        }
        if steps[step].definition.category() == BlockCategory::Storage {
            return Some(step);
        }
        queue.extend(steps[step].bindings.iter().map(|b| b.from_step));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::BlockRegistry;

    fn graph() -> DraftGraph {
        DraftGraph::new(Arc::new(BlockRegistry::with_builtin_blocks()))
    }

    fn add(g: &mut DraftGraph, id: &str, def: &str) -> InstanceId {
        g.add_block_with_id(id.into(), def, ParameterSet::new()).unwrap()
    }

    #[test]
    fn test_topological_order_with_insertion_ties() {
        let mut g = graph();
        // Inserted out of data-flow order on purpose.
        let iscan = add(&mut g, "iscan", "index_scan");
        let btree = add(&mut g, "btree", "btree_index");
        let heap = add(&mut g, "heap", "heap_storage");
        let scan = add(&mut g, "scan", "sequential_scan");
        let schema = add(&mut g, "schema", "schema");
        g.connect(&schema, "records", &heap, "records").unwrap();
        g.connect(&heap, "stored", &btree, "records").unwrap();
        g.connect(&heap, "pages", &scan, "pages").unwrap();
        g.connect(&btree, "lookup_result", &iscan, "lookup_result").unwrap();

        let plan = g.compile().unwrap();
        let order: Vec<String> = plan.order().iter().map(|i| i.to_string()).collect();
        assert_eq!(order, vec!["schema", "heap", "btree", "scan", "iscan"]);

        // Every binding reads from an earlier step.
        for (i, step) in plan.steps().iter().enumerate() {
            for b in &step.bindings {
                assert!(b.from_step < i);
            }
        }
    }

    #[test]
    fn test_storage_source_and_connected_outputs() {
        let mut g = graph();
        let schema = add(&mut g, "schema", "schema");
        let heap = add(&mut g, "heap", "heap_storage");
        let lru = add(&mut g, "lru", "lru_buffer");
        let scan = add(&mut g, "scan", "sequential_scan");
        g.connect(&schema, "records", &heap, "records").unwrap();
        g.connect(&heap, "pages", &lru, "pages").unwrap();
        g.connect(&lru, "pages", &scan, "pages").unwrap();

        let plan = g.compile().unwrap();
        let heap_step = plan.step_index(&heap).unwrap();
        assert_eq!(plan.step(plan.step_index(&scan).unwrap()).storage_source, Some(heap_step));
        assert_eq!(plan.step(plan.step_index(&lru).unwrap()).storage_source, Some(heap_step));
        assert_eq!(plan.step(heap_step).storage_source, None);

        let heap_outputs = &plan.step(heap_step).connected_outputs;
        assert!(heap_outputs.contains("pages"));
        assert!(!heap_outputs.contains("stored"));
        assert!(plan.step(0).is_entry);
    }

    #[test]
    fn test_compile_rejects_invalid_graph() {
        let mut g = graph();
        add(&mut g, "heap", "heap_storage");
        let err = g.compile().unwrap_err();
        assert!(!err.validation_errors().is_empty());
    }

    #[test]
    fn test_compile_is_deterministic() {
        let mut g = graph();
        let schema = add(&mut g, "schema", "schema");
        for name in ["h1", "h2", "h3"] {
            let heap = add(&mut g, name, "heap_storage");
            g.connect(&schema, "records", &heap, "records").unwrap();
        }
        let a = g.compile().unwrap().order();
        let b = g.compile().unwrap().order();
        assert_eq!(a, b);
        assert_eq!(a[1], InstanceId::from("h1"));
    }
}
