//! Simulation configuration
//!
//! Run-level settings and the latency model that converts block activity into
//! simulated time. Every field has a default, so a config can be deserialized
//! from a partial JSON object.

use serde::{Deserialize, Serialize};

/// Modeled cost of each kind of work, in microseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyModel {
    /// Reading one page from simulated disk
    pub page_read_us: f64,
    /// Writing one page to simulated disk
    pub page_write_us: f64,
    /// Forcing the log to stable storage
    pub fsync_us: f64,
    /// Fixed cost of one block handling one request
    pub cpu_op_us: f64,
    /// One key comparison in a join or sort
    pub cpu_compare_us: f64,
    /// Touching one in-memory node or bucket
    pub memory_access_us: f64,
    /// Acquiring or releasing one lock
    pub lock_us: f64,
}

impl Default for LatencyModel {
    fn default() -> Self {
        Self {
            page_read_us: 100.0,
            page_write_us: 200.0,
            fsync_us: 1000.0,
            cpu_op_us: 1.0,
            cpu_compare_us: 0.01,
            memory_access_us: 0.1,
            lock_us: 0.5,
        }
    }
}

impl LatencyModel {
    /// Model where nothing costs time; useful for counting-only runs
    pub fn zero() -> Self {
        Self {
            page_read_us: 0.0,
            page_write_us: 0.0,
            fsync_us: 0.0,
            cpu_op_us: 0.0,
            cpu_compare_us: 0.0,
            memory_access_us: 0.0,
            lock_us: 0.0,
        }
    }
}

/// Settings for one simulation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Seed for workload sampling and randomized block structure
    pub seed: u64,
    /// Keep the ordered event log in the result
    pub capture_event_log: bool,
    /// Cap on failures listed individually in the result
    pub max_failures_recorded: usize,
    /// Scheduler steps without progress before the stall guard fires
    pub stall_limit: usize,
    pub latency: LatencyModel,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            capture_event_log: false,
            max_failures_recorded: 1000,
            stall_limit: 1000,
            latency: LatencyModel::default(),
        }
    }
}

impl SimulationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_event_log(mut self, capture: bool) -> Self {
        self.capture_event_log = capture;
        self
    }

    pub fn with_max_failures_recorded(mut self, max: usize) -> Self {
        self.max_failures_recorded = max;
        self
    }

    pub fn with_stall_limit(mut self, limit: usize) -> Self {
        self.stall_limit = limit.max(1);
        self
    }

    pub fn with_latency(mut self, latency: LatencyModel) -> Self {
        self.latency = latency;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SimulationConfig =
            serde_json::from_str(r#"{"seed": 9, "latency": {"page_read_us": 50.0}}"#).unwrap();
        assert_eq!(config.seed, 9);
        assert_eq!(config.latency.page_read_us, 50.0);
        assert_eq!(config.latency.fsync_us, 1000.0);
        assert!(!config.capture_event_log);
    }

    #[test]
    fn test_builder() {
        let config = SimulationConfig::new()
            .with_seed(1)
            .with_event_log(true)
            .with_stall_limit(0)
            .with_latency(LatencyModel::zero());
        assert_eq!(config.seed, 1);
        assert!(config.capture_event_log);
        assert_eq!(config.stall_limit, 1);
        assert_eq!(config.latency.page_write_us, 0.0);
    }
}
