//! Metrics system for tracking block performance and behavior
//!
//! Every block instance receives a [`MetricsHandle`] at initialization: a
//! narrow write capability scoped to that instance. Handles feed a shared
//! [`MetricsSink`] that keeps counters, histograms, gauges and the ordered
//! trace-event log, and owns the simulated clock. Modeled latencies are
//! charged to the clock; nothing in the simulator reads wall time.
//!
//! All internal maps are ordered so that identical event sequences produce
//! identical snapshots.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::InstanceId;

/// Metric definition describing a metric that a block can collect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDefinition {
    /// Unique identifier for the metric
    pub id: String,
    /// Type of metric (counter, gauge, histogram, event)
    pub metric_type: MetricType,
    /// Unit of measurement (e.g., "us", "pages", "ops")
    pub unit: String,
    /// Description of what this metric measures
    pub description: String,
}

impl MetricDefinition {
    pub fn counter(id: &str, unit: &str, description: &str) -> Self {
        Self::new(id, MetricType::Counter, unit, description)
    }

    pub fn gauge(id: &str, unit: &str, description: &str) -> Self {
        Self::new(id, MetricType::Gauge, unit, description)
    }

    pub fn histogram(id: &str, unit: &str, description: &str) -> Self {
        Self::new(id, MetricType::Histogram, unit, description)
    }

    pub fn event(id: &str, description: &str) -> Self {
        Self::new(id, MetricType::Event, "events", description)
    }

    fn new(id: &str, metric_type: MetricType, unit: &str, description: &str) -> Self {
        Self {
            id: id.into(),
            metric_type,
            unit: unit.into(),
            description: description.into(),
        }
    }
}

/// Type of metric being collected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    /// Monotonically increasing counter (e.g., total operations)
    Counter,
    /// Point-in-time value derived from block state
    Gauge,
    /// Distribution of values (e.g., pages traversed per lookup)
    Histogram,
    /// Trace event type
    Event,
}

/// Type of aggregation to apply to collected metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregationType {
    /// Sum of all values
    Sum,
    /// Average (mean) of all values
    Avg,
    /// Minimum value
    Min,
    /// Maximum value
    Max,
    /// 50th percentile (median)
    P50,
    /// 95th percentile
    P95,
    /// 99th percentile
    P99,
}

/// Aggregate a set of observations.
///
/// Returns `None` for an empty set.
pub fn aggregate(values: &[f64], agg_type: AggregationType) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    match agg_type {
        AggregationType::Sum => Some(values.iter().sum()),
        AggregationType::Avg => Some(values.iter().sum::<f64>() / values.len() as f64),
        AggregationType::Min => values.iter().cloned().reduce(f64::min),
        AggregationType::Max => values.iter().cloned().reduce(f64::max),
        AggregationType::P50 => percentile(values, 0.5),
        AggregationType::P95 => percentile(values, 0.95),
        AggregationType::P99 => percentile(values, 0.99),
    }
}

/// Calculate a percentile from a set of values
///
/// Uses linear interpolation between the two nearest ranks.
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let idx = (sorted.len() as f64 - 1.0) * p;
    let idx_lower = idx.floor() as usize;
    let idx_upper = idx.ceil() as usize;

    if idx_lower == idx_upper {
        sorted.get(idx_lower).cloned()
    } else {
        let lower = sorted[idx_lower];
        let upper = sorted[idx_upper];
        let fraction = idx - idx_lower as f64;
        Some(lower + (upper - lower) * fraction)
    }
}

/// A timestamped trace event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEvent {
    /// Position in the event log
    pub seq: u64,
    /// Simulated time in microseconds
    pub at_us: f64,
    pub instance_id: InstanceId,
    pub event_type: String,
    pub payload: JsonValue,
}

/// Summary of one histogram
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl HistogramSummary {
    pub fn from_values(values: &[f64]) -> Self {
        let get = |agg| aggregate(values, agg).unwrap_or(0.0);
        Self {
            count: values.len() as u64,
            sum: get(AggregationType::Sum),
            min: get(AggregationType::Min),
            max: get(AggregationType::Max),
            mean: get(AggregationType::Avg),
            p50: get(AggregationType::P50),
            p95: get(AggregationType::P95),
            p99: get(AggregationType::P99),
        }
    }
}

/// Per-block metrics as reported in a simulation result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockMetricsReport {
    pub block_type: String,
    pub counters: BTreeMap<String, f64>,
    pub gauges: BTreeMap<String, f64>,
    pub histograms: BTreeMap<String, HistogramSummary>,
    /// Number of trace events per event type
    pub events: BTreeMap<String, u64>,
}

impl BlockMetricsReport {
    pub fn counter(&self, name: &str) -> f64 {
        self.counters.get(name).copied().unwrap_or(0.0)
    }

    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.gauges.get(name).copied()
    }

    pub fn event_count(&self, event_type: &str) -> u64 {
        self.events.get(event_type).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct BlockSeries {
    block_type: String,
    counters: BTreeMap<String, f64>,
    histograms: BTreeMap<String, Vec<f64>>,
    gauges: BTreeMap<String, f64>,
    events: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
struct SinkState {
    clock_us: f64,
    capture_events: bool,
    blocks: BTreeMap<InstanceId, BlockSeries>,
    events: Vec<MetricEvent>,
    next_event_seq: u64,
}

impl SinkState {
    fn series(&mut self, block: &InstanceId) -> &mut BlockSeries {
        self.blocks.entry(block.clone()).or_default()
    }
}

/// Shared collector for one simulation run
///
/// Cloning yields another reference to the same collector.
#[derive(Debug, Clone, Default)]
pub struct MetricsSink {
    inner: Arc<Mutex<SinkState>>,
}

impl MetricsSink {
    /// Create a collector; the full event log is only retained when
    /// `capture_events` is set, per-type event counts always are.
    pub fn new(capture_events: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SinkState {
                capture_events,
                ..SinkState::default()
            })),
        }
    }

    /// Register a block instance and hand out its write capability.
    pub fn handle(&self, instance_id: InstanceId, block_type: &str) -> MetricsHandle {
        self.inner.lock().series(&instance_id).block_type = block_type.to_string();
        MetricsHandle {
            sink: self.clone(),
            instance_id,
        }
    }

    pub fn record_counter(&self, block: &InstanceId, name: &str, delta: f64) {
        let mut state = self.inner.lock();
        *state
            .series(block)
            .counters
            .entry(name.to_string())
            .or_insert(0.0) += delta;
    }

    pub fn record_histogram(&self, block: &InstanceId, name: &str, value: f64) {
        let mut state = self.inner.lock();
        state
            .series(block)
            .histograms
            .entry(name.to_string())
            .or_default()
            .push(value);
    }

    pub fn record_gauge(&self, block: &InstanceId, name: &str, value: f64) {
        let mut state = self.inner.lock();
        state.series(block).gauges.insert(name.to_string(), value);
    }

    pub fn record_event(&self, block: &InstanceId, event_type: &str, payload: JsonValue) {
        let mut state = self.inner.lock();
        *state
            .series(block)
            .events
            .entry(event_type.to_string())
            .or_insert(0) += 1;

        if state.capture_events {
            let seq = state.next_event_seq;
            state.next_event_seq += 1;
            let at_us = state.clock_us;
            state.events.push(MetricEvent {
                seq,
                at_us,
                instance_id: block.clone(),
                event_type: event_type.to_string(),
                payload,
            });
        }
    }

    /// Advance the simulated clock.
    pub fn charge(&self, us: f64) {
        if us > 0.0 {
            self.inner.lock().clock_us += us;
        }
    }

    /// Current simulated time in microseconds
    pub fn now_us(&self) -> f64 {
        self.inner.lock().clock_us
    }

    /// Current value of a counter (0 when never incremented)
    pub fn counter(&self, block: &InstanceId, name: &str) -> f64 {
        let state = self.inner.lock();
        state
            .blocks
            .get(block)
            .and_then(|s| s.counters.get(name))
            .copied()
            .unwrap_or(0.0)
    }

    /// Sum of a counter across every block
    pub fn counter_total(&self, name: &str) -> f64 {
        let state = self.inner.lock();
        state
            .blocks
            .values()
            .filter_map(|s| s.counters.get(name))
            .sum()
    }

    /// Raw observations of a histogram
    pub fn histogram_values(&self, block: &InstanceId, name: &str) -> Vec<f64> {
        let state = self.inner.lock();
        state
            .blocks
            .get(block)
            .and_then(|s| s.histograms.get(name))
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of every block's series
    pub fn snapshot(&self) -> BTreeMap<InstanceId, BlockMetricsReport> {
        let state = self.inner.lock();
        state
            .blocks
            .iter()
            .map(|(id, series)| {
                let report = BlockMetricsReport {
                    block_type: series.block_type.clone(),
                    counters: series.counters.clone(),
                    gauges: series.gauges.clone(),
                    histograms: series
                        .histograms
                        .iter()
                        .map(|(name, values)| (name.clone(), HistogramSummary::from_values(values)))
                        .collect(),
                    events: series.events.clone(),
                };
                (id.clone(), report)
            })
            .collect()
    }

    /// Ordered event log (empty unless capture was enabled)
    pub fn events(&self) -> Vec<MetricEvent> {
        self.inner.lock().events.clone()
    }

    pub fn captures_events(&self) -> bool {
        self.inner.lock().capture_events
    }
}

/// Write capability for a single block instance
#[derive(Debug, Clone)]
pub struct MetricsHandle {
    sink: MetricsSink,
    instance_id: InstanceId,
}

impl MetricsHandle {
    /// Handle attached to a private collector, for blocks used standalone.
    pub fn detached(block_type: &str) -> Self {
        MetricsSink::new(false).handle(InstanceId::from(block_type), block_type)
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn counter(&self, name: &str, delta: f64) {
        self.sink.record_counter(&self.instance_id, name, delta);
    }

    /// Increment a counter by 1
    pub fn increment(&self, name: &str) {
        self.counter(name, 1.0);
    }

    pub fn histogram(&self, name: &str, value: f64) {
        self.sink.record_histogram(&self.instance_id, name, value);
    }

    pub fn gauge(&self, name: &str, value: f64) {
        self.sink.record_gauge(&self.instance_id, name, value);
    }

    pub fn event(&self, event_type: &str, payload: JsonValue) {
        self.sink.record_event(&self.instance_id, event_type, payload);
    }

    /// Charge modeled latency to the simulated clock
    pub fn charge(&self, us: f64) {
        self.sink.charge(us);
    }

    pub fn now_us(&self) -> f64 {
        self.sink.now_us()
    }

    /// Read back one of this block's counters
    pub fn read_counter(&self, name: &str) -> f64 {
        self.sink.counter(&self.instance_id, name)
    }

    pub fn sink(&self) -> &MetricsSink {
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(s: &str) -> InstanceId {
        InstanceId::from(s)
    }

    #[test]
    fn test_counters_accumulate_per_block() {
        let sink = MetricsSink::new(false);
        let a = sink.handle(id("a"), "heap_storage");
        let b = sink.handle(id("b"), "heap_storage");

        a.increment("pages_written");
        a.counter("pages_written", 2.0);
        b.increment("pages_written");

        assert_eq!(sink.counter(&id("a"), "pages_written"), 3.0);
        assert_eq!(sink.counter(&id("b"), "pages_written"), 1.0);
        assert_eq!(sink.counter_total("pages_written"), 4.0);
        assert_eq!(sink.counter(&id("a"), "nonexistent"), 0.0);
    }

    #[test]
    fn test_aggregation() {
        let values = [5.0, 2.0, 8.0, 1.0];
        assert_eq!(aggregate(&values, AggregationType::Sum), Some(16.0));
        assert_eq!(aggregate(&values, AggregationType::Avg), Some(4.0));
        assert_eq!(aggregate(&values, AggregationType::Min), Some(1.0));
        assert_eq!(aggregate(&values, AggregationType::Max), Some(8.0));
        assert_eq!(aggregate(&[], AggregationType::Sum), None);
    }

    #[test]
    fn test_percentiles_interpolate() {
        let values: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        assert!((percentile(&values, 0.5).unwrap() - 50.5).abs() < 1e-9);
        assert!((percentile(&values, 0.95).unwrap() - 95.05).abs() < 1e-9);
        assert!((percentile(&values, 0.99).unwrap() - 99.01).abs() < 1e-9);
        assert_eq!(percentile(&[42.0], 0.99), Some(42.0));
        assert_eq!(percentile(&[10.0, 20.0], 0.5), Some(15.0));
    }

    #[test]
    fn test_clock_advances_only_on_charge() {
        let sink = MetricsSink::new(false);
        let h = sink.handle(id("wal"), "write_ahead_log");
        assert_eq!(h.now_us(), 0.0);
        h.charge(100.0);
        h.charge(0.5);
        h.charge(-3.0);
        assert_eq!(sink.now_us(), 100.5);
    }

    #[test]
    fn test_event_log_capture() {
        let captured = MetricsSink::new(true);
        let h = captured.handle(id("lsm"), "lsm_storage");
        h.charge(10.0);
        h.event("lsm_flush", json!({"entries": 4}));
        h.event("lsm_flush", json!({"entries": 4}));

        let log = captured.events();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].seq, 0);
        assert_eq!(log[1].seq, 1);
        assert_eq!(log[0].at_us, 10.0);

        let quiet = MetricsSink::new(false);
        let h = quiet.handle(id("lsm"), "lsm_storage");
        h.event("lsm_flush", json!({}));
        assert!(quiet.events().is_empty());
        assert_eq!(quiet.snapshot()[&id("lsm")].event_count("lsm_flush"), 1);
    }

    #[test]
    fn test_snapshot_summarizes_histograms() {
        let sink = MetricsSink::new(false);
        let h = sink.handle(id("btree"), "btree_index");
        for depth in [3.0, 3.0, 4.0] {
            h.histogram("pages_traversed", depth);
        }
        h.gauge("tree_height", 4.0);

        let snapshot = sink.snapshot();
        let report = &snapshot[&id("btree")];
        assert_eq!(report.block_type, "btree_index");
        assert_eq!(report.histograms["pages_traversed"].count, 3);
        assert_eq!(report.histograms["pages_traversed"].max, 4.0);
        assert_eq!(report.gauge("tree_height"), Some(4.0));
    }

    #[test]
    fn test_sink_shared_across_threads() {
        use std::thread;

        let sink = MetricsSink::new(false);
        let h = sink.handle(id("concurrent"), "lru_buffer");
        let h2 = h.clone();

        let t = thread::spawn(move || {
            for _ in 0..100 {
                h2.increment("cache_hits");
            }
        });
        for _ in 0..100 {
            h.increment("cache_hits");
        }
        t.join().unwrap();

        assert_eq!(sink.counter(&id("concurrent"), "cache_hits"), 200.0);
    }
}
