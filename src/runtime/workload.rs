//! Workload generator
//!
//! Generates the stream of database operations (INSERT, SELECT, UPDATE,
//! DELETE) a simulation dispatches, with weighted operation types and a
//! uniform or Zipfian key distribution.
//!
//! Inserts always take the next fresh key. Every other operation draws from
//! the keys inserted so far; when nothing has been inserted yet the
//! operation is turned into an insert. Zipfian sampling is exact: rank `r`
//! (key `r - 1`) is drawn with probability proportional to `1 / r^θ`, by
//! binary search over the cumulative weights.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use crate::core::block::OperationType;

// ── Configuration types ─────────────────────────────────────────────────────

/// Key distribution strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyDistribution {
    /// Each inserted key equally likely
    #[default]
    Uniform,
    /// Low keys much more popular, skew set by `distribution_parameter`
    Zipfian,
}

/// Shape of the operations generated from one mix entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationTemplate {
    /// Selects with a width probe `[key, key + width)`
    pub range_width: Option<u64>,
    /// Generated row payload size
    pub payload_bytes: usize,
}

impl Default for OperationTemplate {
    fn default() -> Self {
        Self {
            range_width: None,
            payload_bytes: 64,
        }
    }
}

/// One operation type and its relative weight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationMix {
    pub operation_type: OperationType,
    /// Relative weight; weights are normalized, they need not sum to 100
    pub weight_percent: f64,
    #[serde(default)]
    pub template: OperationTemplate,
}

impl OperationMix {
    pub fn new(operation_type: OperationType, weight_percent: f64) -> Self {
        Self {
            operation_type,
            weight_percent,
            template: OperationTemplate::default(),
        }
    }

    pub fn with_range(mut self, width: u64) -> Self {
        self.template.range_width = Some(width);
        self
    }

    pub fn with_payload(mut self, bytes: usize) -> Self {
        self.template.payload_bytes = bytes;
        self
    }
}

/// Follow-on phase with its own mix, run after the main one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadPhase {
    pub operations: Vec<OperationMix>,
    pub total_operations: usize,
}

/// Complete workload definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub operations: Vec<OperationMix>,
    pub total_operations: usize,
    /// Logical client streams interleaved round-robin
    #[serde(default = "one")]
    pub concurrency: usize,
    #[serde(default)]
    pub distribution: KeyDistribution,
    /// Zipfian skew θ
    #[serde(default = "default_theta")]
    pub distribution_parameter: f64,
    #[serde(default = "one")]
    pub ops_per_transaction: usize,
    #[serde(default)]
    pub phases: Vec<WorkloadPhase>,
}

fn one() -> usize {
    1
}

fn default_theta() -> f64 {
    0.99
}

impl Workload {
    /// Single-phase, single-stream workload with a uniform key distribution
    pub fn new(operations: Vec<OperationMix>, total_operations: usize) -> Self {
        Self {
            operations,
            total_operations,
            concurrency: 1,
            distribution: KeyDistribution::Uniform,
            distribution_parameter: default_theta(),
            ops_per_transaction: 1,
            phases: Vec::new(),
        }
    }

    pub fn with_concurrency(mut self, streams: usize) -> Self {
        self.concurrency = streams;
        self
    }

    pub fn with_zipfian(mut self, theta: f64) -> Self {
        self.distribution = KeyDistribution::Zipfian;
        self.distribution_parameter = theta;
        self
    }

    pub fn with_ops_per_transaction(mut self, ops: usize) -> Self {
        self.ops_per_transaction = ops;
        self
    }

    /// Append a follow-on phase
    pub fn then(mut self, operations: Vec<OperationMix>, total_operations: usize) -> Self {
        self.phases.push(WorkloadPhase {
            operations,
            total_operations,
        });
        self
    }

    /// Operations across every phase
    pub fn operation_count(&self) -> usize {
        self.total_operations + self.phases.iter().map(|p| p.total_operations).sum::<usize>()
    }

    pub fn validate(&self) -> Result<(), WorkloadError> {
        if self.concurrency == 0 {
            return Err(WorkloadError::InvalidConcurrency);
        }
        if self.ops_per_transaction == 0 {
            return Err(WorkloadError::InvalidTransactionSize);
        }
        let theta = self.distribution_parameter;
        if self.distribution == KeyDistribution::Zipfian && !(theta.is_finite() && theta >= 0.0) {
            return Err(WorkloadError::InvalidDistributionParameter(theta));
        }
        check_mix(0, &self.operations, self.total_operations)?;
        for (i, phase) in self.phases.iter().enumerate() {
            check_mix(i + 1, &phase.operations, phase.total_operations)?;
        }
        Ok(())
    }
}

fn check_mix(phase: usize, mix: &[OperationMix], total: usize) -> Result<(), WorkloadError> {
    if let Some(bad) = mix
        .iter()
        .find(|m| !(m.weight_percent.is_finite() && m.weight_percent >= 0.0))
    {
        return Err(WorkloadError::InvalidWeight {
            phase,
            weight: bad.weight_percent,
        });
    }
    let sum: f64 = mix.iter().map(|m| m.weight_percent).sum();
    if total > 0 && sum <= 0.0 {
        return Err(WorkloadError::EmptyMix { phase });
    }
    Ok(())
}

/// Workload definition errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorkloadError {
    #[error("Phase {phase} has operations to run but no positive weight")]
    EmptyMix { phase: usize },

    #[error("Phase {phase} has an invalid weight {weight}")]
    InvalidWeight { phase: usize, weight: f64 },

    #[error("Concurrency must be at least 1")]
    InvalidConcurrency,

    #[error("Operations per transaction must be at least 1")]
    InvalidTransactionSize,

    #[error("Zipfian skew must be a non-negative number, got {0}")]
    InvalidDistributionParameter(f64),
}

// ── Generated operation ─────────────────────────────────────────────────────

/// A single generated operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedOperation {
    /// Position in the workload (0-based)
    pub seq: u64,
    pub operation: OperationType,
    pub key: i64,
    pub range_width: Option<u64>,
    pub payload_bytes: usize,
}

// ── Generator ───────────────────────────────────────────────────────────────

/// Phase with its weights turned into a cumulative table
struct PreparedPhase {
    mix: Vec<OperationMix>,
    cumulative: Vec<f64>,
    remaining: usize,
}

/// Seeded, incremental operation source
pub struct WorkloadGenerator {
    rng: StdRng,
    phases: Vec<PreparedPhase>,
    current: usize,
    distribution: KeyDistribution,
    theta: f64,
    next_key: i64,
    /// Cumulative Zipf weights for ranks 1..=len
    zipf_cumulative: Vec<f64>,
    seq: u64,
}

impl WorkloadGenerator {
    pub fn new(workload: &Workload, seed: u64) -> Result<Self, WorkloadError> {
        workload.validate()?;
        let prepare = |mix: &[OperationMix], total: usize| {
            let mut acc = 0.0;
            let cumulative = mix
                .iter()
                .map(|m| {
                    acc += m.weight_percent;
                    acc
                })
                .collect();
            PreparedPhase {
                mix: mix.to_vec(),
                cumulative,
                remaining: total,
            }
        };

        let mut phases = vec![prepare(&workload.operations, workload.total_operations)];
        phases.extend(
            workload
                .phases
                .iter()
                .map(|p| prepare(&p.operations, p.total_operations)),
        );

        Ok(Self {
            rng: StdRng::seed_from_u64(seed),
            phases,
            current: 0,
            distribution: workload.distribution,
            theta: workload.distribution_parameter,
            next_key: 0,
            zipf_cumulative: Vec::new(),
            seq: 0,
        })
    }

    /// Generate a whole workload up front
    pub fn generate(workload: &Workload, seed: u64) -> Result<Vec<GeneratedOperation>, WorkloadError> {
        let mut generator = Self::new(workload, seed)?;
        Ok(std::iter::from_fn(|| generator.next_operation()).collect())
    }

    /// Operations not yet generated
    pub fn remaining(&self) -> usize {
        self.phases[self.current..].iter().map(|p| p.remaining).sum()
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Keys handed out to inserts so far
    pub fn inserted_keys(&self) -> i64 {
        self.next_key
    }

    pub fn next_operation(&mut self) -> Option<GeneratedOperation> {
        while self.phases.get(self.current)?.remaining == 0 {
            self.current += 1;
        }
        let phase = &mut self.phases[self.current];
        phase.remaining -= 1;

        let total = phase.cumulative.last().copied().unwrap_or(0.0);
        let point = self.rng.gen::<f64>() * total;
        let pick = phase
            .cumulative
            .partition_point(|&c| c <= point)
            .min(phase.mix.len() - 1);
        let mix = phase.mix[pick].clone();

        let mut operation = mix.operation_type;
        if operation != OperationType::Insert && self.next_key == 0 {
            operation = OperationType::Insert;
        }

        let key = if operation == OperationType::Insert {
            let k = self.next_key;
            self.next_key += 1;
            k
        } else {
            self.pick_key()
        };

        let seq = self.seq;
        self.seq += 1;
        Some(GeneratedOperation {
            seq,
            operation,
            key,
            range_width: match operation {
                OperationType::Select => mix.template.range_width,
                _ => None,
            },
            payload_bytes: mix.template.payload_bytes,
        })
    }

    /// Draw one of the inserted keys `[0, next_key)`
    fn pick_key(&mut self) -> i64 {
        let n = self.next_key as usize;
        match self.distribution {
            KeyDistribution::Uniform => self.rng.gen_range(0..self.next_key),
            KeyDistribution::Zipfian => {
                self.extend_zipf(n);
                let total = self.zipf_cumulative[n - 1];
                let point = self.rng.gen::<f64>() * total;
                let rank = self.zipf_cumulative[..n]
                    .partition_point(|&c| c <= point)
                    .min(n - 1);
                rank as i64
            }
        }
    }

    fn extend_zipf(&mut self, n: usize) {
        let mut acc = self.zipf_cumulative.last().copied().unwrap_or(0.0);
        for rank in self.zipf_cumulative.len() + 1..=n {
            acc += 1.0 / (rank as f64).powf(self.theta);
            self.zipf_cumulative.push(acc);
        }
    }

    /// Operation counts by type
    pub fn summarize(ops: &[GeneratedOperation]) -> BTreeMap<OperationType, usize> {
        let mut counts = BTreeMap::new();
        for op in ops {
            *counts.entry(op.operation).or_insert(0) += 1;
        }
        counts
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
