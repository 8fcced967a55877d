//! # Metrics Sink
//!
//! Provide the counter/gauge interface the client reports into, plus two
//! ready-made sinks: one that discards everything and one that accumulates
//! values in memory for inspection.
//!
//! ## Design Principles
//! 1. **Injected Collaborator**: The client never owns a metrics backend; it
//!    only calls through `MetricsSink`.
//! 2. **Label Pairs**: Labels are plain `(name, value)` pairs so any backend
//!    can map them onto its own label model.
//! 3. **Snapshot Access**: `MemoryMetrics` exposes point-in-time values
//!    without holding its lock across caller code.
//!
//! ## Notes
//! - `MemoryMetrics` keys a series by name plus labels sorted by label name,
//!   so label order at the call site does not matter.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// A single `(label, value)` pair attached to a series.
pub type Label<'a> = (&'a str, &'a str);

/// Receiver for counters and gauges keyed by name and labels.
pub trait MetricsSink: Send + Sync {
    /// Adds one to a counter.
    fn increment_counter(&self, name: &str, labels: &[Label<'_>]) {
        self.increment_counter_by(name, labels, 1.0);
    }

    /// Adds `amount` to a counter.
    fn increment_counter_by(&self, name: &str, labels: &[Label<'_>], amount: f64);

    /// Overwrites a gauge.
    fn set_gauge(&self, name: &str, labels: &[Label<'_>], value: f64);

    /// Adds one to a gauge.
    fn inc_gauge(&self, name: &str, labels: &[Label<'_>]);

    /// Subtracts one from a gauge.
    fn dec_gauge(&self, name: &str, labels: &[Label<'_>]);
}

/// Sink that drops every observation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_counter_by(&self, _name: &str, _labels: &[Label<'_>], _amount: f64) {}

    fn set_gauge(&self, _name: &str, _labels: &[Label<'_>], _value: f64) {}

    fn inc_gauge(&self, _name: &str, _labels: &[Label<'_>]) {}

    fn dec_gauge(&self, _name: &str, _labels: &[Label<'_>]) {}
}

/// Identity of one series: metric name plus sorted labels.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SeriesKey {
    /// Metric name.
    pub name: String,
    /// Labels sorted by label name.
    pub labels: Vec<(String, String)>,
}

impl SeriesKey {
    fn new(name: &str, labels: &[Label<'_>]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        labels.sort();
        SeriesKey {
            name: name.to_string(),
            labels,
        }
    }
}

/// Point-in-time copy of every series held by a [`MemoryMetrics`].
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    /// Counter values.
    pub counters: BTreeMap<SeriesKey, f64>,
    /// Gauge values.
    pub gauges: BTreeMap<SeriesKey, f64>,
}

#[derive(Default)]
struct Series {
    counters: BTreeMap<SeriesKey, f64>,
    gauges: BTreeMap<SeriesKey, f64>,
}

/// Thread-safe in-memory accumulator.
///
/// Missing series read as `0.0`, which matches how a fresh counter or gauge
/// would report in any metrics backend.
#[derive(Default)]
pub struct MemoryMetrics {
    series: Mutex<Series>,
}

impl MemoryMetrics {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current value of a counter.
    pub fn counter(&self, name: &str, labels: &[Label<'_>]) -> f64 {
        let series = self.series.lock().expect("metrics mutex poisoned");
        series
            .counters
            .get(&SeriesKey::new(name, labels))
            .copied()
            .unwrap_or(0.0)
    }

    /// Returns the current value of a gauge.
    pub fn gauge(&self, name: &str, labels: &[Label<'_>]) -> f64 {
        let series = self.series.lock().expect("metrics mutex poisoned");
        series
            .gauges
            .get(&SeriesKey::new(name, labels))
            .copied()
            .unwrap_or(0.0)
    }

    /// Returns a copy of all series.
    ///
    /// **Input**: none.
    /// **Output**: `MetricsSnapshot` with every counter and gauge seen so far.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let series = self.series.lock().expect("metrics mutex poisoned");
        MetricsSnapshot {
            counters: series.counters.clone(),
            gauges: series.gauges.clone(),
        }
    }

    fn update_gauge(&self, name: &str, labels: &[Label<'_>], apply: impl FnOnce(&mut f64)) {
        let mut series = self.series.lock().expect("metrics mutex poisoned");
        apply(series.gauges.entry(SeriesKey::new(name, labels)).or_insert(0.0));
    }
}

impl MetricsSink for MemoryMetrics {
    fn increment_counter_by(&self, name: &str, labels: &[Label<'_>], amount: f64) {
        let mut series = self.series.lock().expect("metrics mutex poisoned");
        *series
            .counters
            .entry(SeriesKey::new(name, labels))
            .or_insert(0.0) += amount;
    }

    fn set_gauge(&self, name: &str, labels: &[Label<'_>], value: f64) {
        self.update_gauge(name, labels, |gauge| *gauge = value);
    }

    fn inc_gauge(&self, name: &str, labels: &[Label<'_>]) {
        self.update_gauge(name, labels, |gauge| *gauge += 1.0);
    }

    fn dec_gauge(&self, name: &str, labels: &[Label<'_>]) {
        self.update_gauge(name, labels, |gauge| *gauge -= 1.0);
    }
}
