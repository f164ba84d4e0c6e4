//! Shared builders for the scenario suites.

use crate::core::parameter::{ParameterSet, ParameterValue};
use crate::core::InstanceId;
use crate::runtime::graph::DraftGraph;
use crate::runtime::simulation::Simulator;
use crate::runtime::workload::{OperationMix, OperationType, Workload};

pub fn params(pairs: &[(&str, ParameterValue)]) -> ParameterSet {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

pub fn add(graph: &mut DraftGraph, id: &str, definition: &str) -> InstanceId {
    add_with(graph, id, definition, &[])
}

pub fn add_with(
    graph: &mut DraftGraph,
    id: &str,
    definition: &str,
    overrides: &[(&str, ParameterValue)],
) -> InstanceId {
    graph
        .add_block_with_id(id.into(), definition, params(overrides))
        .unwrap()
}

pub fn wire(graph: &mut DraftGraph, from: &str, from_port: &str, to: &str, to_port: &str) {
    graph
        .connect(&from.into(), from_port, &to.into(), to_port)
        .unwrap();
}

/// `schema -> heap -> btree(unique) -> index scan`
pub fn indexed_heap(sim: &Simulator) -> DraftGraph {
    let mut g = sim.new_graph();
    add(&mut g, "schema", "schema");
    add(&mut g, "heap", "heap_storage");
    add_with(&mut g, "btree", "btree_index", &[("unique", true.into())]);
    add(&mut g, "scan", "index_scan");
    wire(&mut g, "schema", "records", "heap", "records");
    wire(&mut g, "heap", "stored", "btree", "records");
    wire(&mut g, "btree", "lookup_result", "scan", "lookup_result");
    g
}

/// `schema -> heap -> sequential scan`
pub fn scanned_heap(sim: &Simulator) -> DraftGraph {
    let mut g = sim.new_graph();
    add(&mut g, "schema", "schema");
    add(&mut g, "heap", "heap_storage");
    add(&mut g, "scan", "sequential_scan");
    wire(&mut g, "schema", "records", "heap", "records");
    wire(&mut g, "heap", "pages", "scan", "pages");
    g
}

/// `schema -> two-phase locking -> heap`
pub fn locked_heap(sim: &Simulator, deadlock_detection: bool) -> DraftGraph {
    let mut g = sim.new_graph();
    add(&mut g, "schema", "schema");
    add_with(
        &mut g,
        "locks",
        "two_phase_locking",
        &[("deadlock_detection", deadlock_detection.into())],
    );
    add(&mut g, "heap", "heap_storage");
    wire(&mut g, "schema", "records", "locks", "records");
    wire(&mut g, "schema", "txn", "locks", "txn");
    wire(&mut g, "locks", "records", "heap", "records");
    g
}

pub fn only(op: OperationType) -> Vec<OperationMix> {
    vec![OperationMix::new(op, 100.0)]
}

/// `inserts` inserts, then `selects` point selects
pub fn load_then_select(inserts: usize, selects: usize) -> Workload {
    Workload::new(only(OperationType::Insert), inserts).then(only(OperationType::Select), selects)
}
