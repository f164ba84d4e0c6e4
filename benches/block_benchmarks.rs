//! Criterion benchmarks for the block simulator.
//!
//! Run with: `cargo bench`
//!
//! The first groups time the data structures behind individual blocks under
//! different configurations (B+ tree fanout, memtable size, sort memory).
//! The last group times whole simulations of comparable designs.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

use db_block_sim::categories::concurrency::mvcc::VersionStore;
use db_block_sim::categories::concurrency::row_lock::{LockManager, LockMode};
use db_block_sim::categories::execution::sort::external_sort;
use db_block_sim::categories::index::BPlusTree;
use db_block_sim::categories::storage::lsm_tree::LsmTree;
use db_block_sim::categories::transaction::wal::{LogRecordType, WriteAheadLog};
use db_block_sim::core::block::OperationType;
use db_block_sim::core::port::Record;
use db_block_sim::core::parameter::ParameterSet;
use db_block_sim::core::TxnId;
use db_block_sim::runtime::workload::{OperationMix, Workload, WorkloadGenerator};
use db_block_sim::{BlockRegistry, DraftGraph, SimulationConfig, Simulator};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn make_record(key: i64) -> Record {
    let mut r = Record::new(key);
    r.insert("name", format!("user_{}", key)).unwrap();
    r
}

/// Pseudo-random but repeatable key order
fn scrambled(n: i64) -> Vec<i64> {
    (0..n).map(|i| (i * 7_919) % n).collect()
}

// ---------------------------------------------------------------------------
// Index structures
// ---------------------------------------------------------------------------

fn bench_btree_insert_by_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree_insert_10k");
    let keys = scrambled(10_007);

    for fanout in [4usize, 16, 128] {
        group.bench_with_input(BenchmarkId::from_parameter(fanout), &fanout, |b, &fanout| {
            b.iter(|| {
                let mut tree = BPlusTree::new(fanout);
                for &k in &keys {
                    let _ = tree.insert(k, k);
                }
                black_box(tree.height())
            });
        });
    }
    group.finish();
}

fn bench_btree_range(c: &mut Criterion) {
    let mut tree = BPlusTree::new(128);
    for k in 0..100_000i64 {
        let _ = tree.insert(k, k);
    }

    c.bench_function("btree_range_100_of_100k", |b| {
        let mut start = 0i64;
        b.iter(|| {
            start = (start + 977) % 99_900;
            black_box(tree.range(start, start + 100).0.len())
        });
    });
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

fn bench_lsm_put_by_memtable(c: &mut Criterion) {
    let mut group = c.benchmark_group("lsm_put_10k");

    for memtable in [64usize, 1_024] {
        group.bench_with_input(BenchmarkId::from_parameter(memtable), &memtable, |b, &m| {
            b.iter(|| {
                let mut tree = LsmTree::new(m, 4, 64);
                for k in 0..10_000i64 {
                    tree.put(k, Some(make_record(k)));
                }
                black_box(tree.write_amplification())
            });
        });
    }
    group.finish();
}

fn bench_wal_group_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_append_commit");

    for group_size in [1usize, 8, 64] {
        group.bench_with_input(
            BenchmarkId::from_parameter(group_size),
            &group_size,
            |b, &size| {
                b.iter(|| {
                    let mut wal = WriteAheadLog::new(size, 1_000);
                    for _ in 0..1_000 {
                        wal.append(LogRecordType::Insert, 128);
                        wal.append(LogRecordType::Commit, 0);
                    }
                    black_box(wal.current_lsn())
                });
            },
        );
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Concurrency control
// ---------------------------------------------------------------------------

fn bench_lock_acquire_release(c: &mut Criterion) {
    c.bench_function("lock_acquire_release_100", |b| {
        let mut locks = LockManager::new();
        let mut txn = 0u64;
        b.iter(|| {
            txn += 1;
            for key in 0..100 {
                black_box(locks.try_acquire(TxnId(txn), key, LockMode::Exclusive));
            }
            locks.release_all(TxnId(txn))
        });
    });
}

fn bench_mvcc_write_read(c: &mut Criterion) {
    c.bench_function("mvcc_update_then_read_1k", |b| {
        b.iter(|| {
            let mut store = VersionStore::new();
            for round in 1..=10u64 {
                let txn = TxnId(round);
                store.begin(txn);
                for key in 0..100 {
                    let op = if round == 1 {
                        OperationType::Insert
                    } else {
                        OperationType::Update
                    };
                    let _ = store.write(txn, op, make_record(key));
                }
                store.commit(txn);
            }
            black_box(store.read(TxnId(99), 50))
        });
    });
}

// ---------------------------------------------------------------------------
// Query execution
// ---------------------------------------------------------------------------

fn bench_external_sort(c: &mut Criterion) {
    let mut group = c.benchmark_group("sort_10k");
    let rows: Vec<Record> = scrambled(10_007).into_iter().map(make_record).collect();

    for memory in [100usize, 1_000, 20_000] {
        group.bench_with_input(BenchmarkId::from_parameter(memory), &memory, |b, &m| {
            b.iter(|| black_box(external_sort(rows.clone(), "key", m, false).runs));
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Workloads and whole runs
// ---------------------------------------------------------------------------

fn bench_workload_generation(c: &mut Criterion) {
    let mix = vec![
        OperationMix::new(OperationType::Insert, 20.0),
        OperationMix::new(OperationType::Select, 80.0),
    ];
    let uniform = Workload::new(mix.clone(), 10_000);
    let zipfian = Workload::new(mix, 10_000).with_zipfian(0.99);

    let mut group = c.benchmark_group("workload_generate_10k");
    group.bench_function("uniform", |b| {
        b.iter(|| black_box(WorkloadGenerator::generate(&uniform, 42).unwrap().len()))
    });
    group.bench_function("zipfian", |b| {
        b.iter(|| black_box(WorkloadGenerator::generate(&zipfian, 42).unwrap().len()))
    });
    group.finish();
}

fn storage_design(registry: &Arc<BlockRegistry>, storage: &str) -> anyhow::Result<DraftGraph> {
    let mut g = DraftGraph::new(Arc::clone(registry));
    let schema = g.add_block("schema", ParameterSet::new())?;
    let store = g.add_block(storage, ParameterSet::new())?;
    g.connect(&schema, "records", &store, "records")?;
    Ok(g)
}

fn bench_simulation_by_storage(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let registry = Arc::new(BlockRegistry::with_builtin_blocks());
    let sim = Simulator::new(Arc::clone(&registry), SimulationConfig::default());
    let workload = Workload::new(vec![OperationMix::new(OperationType::Insert, 100.0)], 2_000)
        .then(vec![OperationMix::new(OperationType::Update, 100.0)], 500);

    let mut group = c.benchmark_group("simulate_2k_inserts_500_updates");
    group.sample_size(10);
    for storage in ["heap_storage", "clustered_storage", "lsm_storage"] {
        let graph = storage_design(&registry, storage).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(storage), &graph, |b, g| {
            b.iter(|| {
                let result = runtime.block_on(sim.run(g, &workload));
                black_box(result.summary.elapsed_us)
            });
        });
    }
    group.finish();
}

criterion_group!(
    index_benches,
    bench_btree_insert_by_fanout,
    bench_btree_range,
);

criterion_group!(
    storage_benches,
    bench_lsm_put_by_memtable,
    bench_wal_group_commit,
);

criterion_group!(
    concurrency_benches,
    bench_lock_acquire_release,
    bench_mvcc_write_read,
);

criterion_group!(execution_benches, bench_external_sort);

criterion_group!(
    simulation_benches,
    bench_workload_generation,
    bench_simulation_by_storage,
);

criterion_main!(
    index_benches,
    storage_benches,
    concurrency_benches,
    execution_benches,
    simulation_benches,
);
