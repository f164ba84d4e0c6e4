//! Graph validation engine
//!
//! Structural checks that need the whole graph: required inputs bound,
//! dependency constraints satisfied by upstream reachability, no cycles, and
//! at least one entry block. Every problem is reported, in that order, so a
//! caller can fix them all at once.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;

use super::graph::{BlockInstance, DraftGraph};
use crate::core::constraint::{ConstraintKind, DependencyConstraint};
use crate::core::InstanceId;

// ── Result types ────────────────────────────────────────────────────────────

/// Structural error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValidationCode {
    MissingConnection,
    UnsatisfiedDependency,
    CyclicGraph,
    NoEntryBlock,
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A single validation error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub code: ValidationCode,
    /// Human-readable description
    pub message: String,
    pub involved_instance_ids: Vec<InstanceId>,
}

impl ValidationError {
    fn new(code: ValidationCode, message: impl Into<String>, involved: Vec<InstanceId>) -> Self {
        Self {
            code,
            message: message.into(),
            involved_instance_ids: involved,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

// ── Validator ───────────────────────────────────────────────────────────────

/// Run every structural check against a draft graph
pub fn validate_graph(graph: &DraftGraph) -> Vec<ValidationError> {
    GraphValidator::new(graph).validate()
}

/// Validates a draft graph
pub struct GraphValidator<'a> {
    graph: &'a DraftGraph,
    /// Upstream neighbors by insertion index, in connection order
    parents: Vec<Vec<usize>>,
    /// Downstream neighbors by insertion index, in connection order
    children: Vec<Vec<usize>>,
}

impl<'a> GraphValidator<'a> {
    pub fn new(graph: &'a DraftGraph) -> Self {
        let n = graph.instances().len();
        let mut parents = vec![Vec::new(); n];
        let mut children = vec![Vec::new(); n];
        for c in graph.connections() {
            if let (Some(s), Some(t)) = (
                graph.position(&c.source_instance_id),
                graph.position(&c.target_instance_id),
            ) {
                if !children[s].contains(&t) {
                    children[s].push(t);
                    parents[t].push(s);
                }
            }
        }
        Self {
            graph,
            parents,
            children,
        }
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        errors.extend(self.check_required_inputs());
        errors.extend(self.check_dependencies());
        errors.extend(self.check_cycles());
        errors.extend(self.check_entry_block());
        if !errors.is_empty() {
            tracing::debug!(errors = errors.len(), "graph failed validation");
        }
        errors
    }

    // ── Individual checks ───────────────────────────────────────────────

    /// Every required input port must have an incoming connection.
    fn check_required_inputs(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        for inst in self.graph.instances() {
            for port in inst.definition.inputs.iter().filter(|p| p.required) {
                let bound = self.graph.connections().iter().any(|c| {
                    c.target_instance_id == inst.instance_id && c.target_port == port.id
                });
                if !bound {
                    errors.push(ValidationError::new(
                        ValidationCode::MissingConnection,
                        format!(
                            "Required input '{}' on {} ({}) is not connected",
                            port.id,
                            inst.instance_id,
                            inst.definition.id()
                        ),
                        vec![inst.instance_id.clone()],
                    ));
                }
            }
        }
        errors
    }

    /// Each applicable dependency constraint must be met by some block
    /// reachable upstream.
    fn check_dependencies(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        for (idx, inst) in self.graph.instances().iter().enumerate() {
            let applicable: Vec<&DependencyConstraint> = inst
                .definition
                .constraints
                .iter()
                .filter(|c| c.applies(&inst.parameters))
                .collect();
            if applicable.is_empty() {
                continue;
            }

            let upstream = self.upstream_of(idx);
            for constraint in applicable {
                let satisfied = upstream
                    .iter()
                    .any(|&u| satisfies(&self.graph.instances()[u], &constraint.kind));
                if !satisfied {
                    errors.push(ValidationError::new(
                        ValidationCode::UnsatisfiedDependency,
                        format!(
                            "{} ({}) needs {} upstream: {}",
                            inst.instance_id,
                            inst.definition.id(),
                            constraint.kind,
                            constraint.description
                        ),
                        vec![inst.instance_id.clone()],
                    ));
                }
            }
        }
        errors
    }

    /// Depth-first search; every back edge closes a cycle. Each distinct set
    /// of instances is reported once, in path order.
    fn check_cycles(&self) -> Vec<ValidationError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            OnStack,
            Done,
        }

        let n = self.children.len();
        let mut marks = vec![Mark::New; n];
        let mut seen: BTreeSet<Vec<usize>> = BTreeSet::new();
        let mut errors = Vec::new();

        for root in 0..n {
            if marks[root] != Mark::New {
                continue;
            }
            // (node, next child index)
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            marks[root] = Mark::OnStack;

            while let Some(top) = stack.last_mut() {
                let node = top.0;
                if let Some(&child) = self.children[node].get(top.1) {
                    top.1 += 1;
                    match marks[child] {
                        Mark::New => {
                            marks[child] = Mark::OnStack;
                            stack.push((child, 0));
                        }
                        Mark::OnStack => {
                            let start = stack.iter().position(|&(v, _)| v == child).unwrap_or(0);
                            let cycle: Vec<usize> = stack[start..].iter().map(|&(v, _)| v).collect();
                            let mut key = cycle.clone();
                            key.sort_unstable();
                            if seen.insert(key) {
                                errors.push(self.cycle_error(&cycle));
                            }
                        }
                        Mark::Done => {}
                    }
                } else {
                    marks[node] = Mark::Done;
                    stack.pop();
                }
            }
        }
        errors
    }

    /// Workload requests enter through entry blocks; without one nothing runs.
    fn check_entry_block(&self) -> Vec<ValidationError> {
        if self.graph.instances().iter().any(|i| i.definition.entry) {
            return Vec::new();
        }
        vec![ValidationError::new(
            ValidationCode::NoEntryBlock,
            "Graph has no entry block to receive workload requests",
            Vec::new(),
        )]
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    /// Every instance reachable upstream of `idx`, excluding `idx` itself
    /// unless it lies on a cycle.
    fn upstream_of(&self, idx: usize) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<usize> = self.parents[idx].iter().copied().collect();
        while let Some(u) = queue.pop_front() {
            if seen.insert(u) {
                queue.extend(self.parents[u].iter().copied());
            }
        }
        seen
    }

    fn cycle_error(&self, cycle: &[usize]) -> ValidationError {
        let ids: Vec<InstanceId> = cycle
            .iter()
            .map(|&i| self.graph.instances()[i].instance_id.clone())
            .collect();
        let path: Vec<&str> = ids.iter().map(InstanceId::as_str).collect();
        ValidationError::new(
            ValidationCode::CyclicGraph,
            format!("Graph contains a cycle: {} -> {}", path.join(" -> "), path[0]),
            ids,
        )
    }
}

fn satisfies(instance: &BlockInstance, kind: &ConstraintKind) -> bool {
    match kind {
        ConstraintKind::UpstreamBlock(id) => instance.definition.id() == id,
        ConstraintKind::UpstreamCategory(category) => instance.definition.category() == *category,
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
