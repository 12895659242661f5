//! Measurement events emitted by the engine.
//!
//! Components receive an `Arc<dyn MetricsSink>` and never reach for global
//! state. [`InMemoryMetrics`] is the process sink; exposition (Prometheus,
//! OTLP, ...) is left to whoever reads its snapshot.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

pub mod names {
    pub const API_CALLS: &str = "api_calls";
    pub const TASK_OPERATIONS: &str = "task_operations";
    pub const ERRORS: &str = "errors";
    pub const WEBHOOKS_RECEIVED: &str = "webhooks_received";
    pub const QUEUE_SIZE: &str = "queue_size";
    pub const DEAD_LETTER_SIZE: &str = "dead_letter_size";
    pub const CIRCUIT_OPEN: &str = "circuit_open";
    pub const AGENTS_ENABLED: &str = "agents_enabled";
    pub const RATE_LIMIT_REMAINING: &str = "rate_limit_remaining";
    pub const HEALTH_SCORE: &str = "health_score";
}

/// Sink for counters and gauges.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &str, labels: &[(&str, &str)]);
    fn gauge(&self, name: &str, labels: &[(&str, &str)], value: f64);
}

pub type SharedMetrics = Arc<dyn MetricsSink>;

/// A sorted label set, so `{a,b}` and `{b,a}` address the same series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    pub name: String,
    pub labels: Vec<(String, String)>,
}

impl MetricKey {
    pub fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }

    fn render(&self) -> String {
        if self.labels.is_empty() {
            return self.name.clone();
        }
        let inner: Vec<String> = self
            .labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v))
            .collect();
        format!("{}{{{}}}", self.name, inner.join(","))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricSample {
    pub series: String,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct MetricsSnapshot {
    pub counters: Vec<MetricSample>,
    pub gauges: Vec<MetricSample>,
}

#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: DashMap<MetricKey, u64>,
    gauges: DashMap<MetricKey, f64>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .get(&MetricKey::new(name, labels))
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Sum of a counter across every label set.
    pub fn counter_total(&self, name: &str) -> u64 {
        self.counters
            .iter()
            .filter(|e| e.key().name == name)
            .map(|e| *e.value())
            .sum()
    }

    pub fn gauge_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.gauges.get(&MetricKey::new(name, labels)).map(|v| *v)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut counters: Vec<(MetricKey, f64)> = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), *e.value() as f64))
            .collect();
        let mut gauges: Vec<(MetricKey, f64)> = self
            .gauges
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        counters.sort_by(|a, b| a.0.cmp(&b.0));
        gauges.sort_by(|a, b| a.0.cmp(&b.0));
        let sample = |(key, value): (MetricKey, f64)| MetricSample {
            series: key.render(),
            value,
        };
        MetricsSnapshot {
            counters: counters.into_iter().map(sample).collect(),
            gauges: gauges.into_iter().map(sample).collect(),
        }
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, name: &str, labels: &[(&str, &str)]) {
        *self.counters.entry(MetricKey::new(name, labels)).or_insert(0) += 1;
    }

    fn gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.gauges.insert(MetricKey::new(name, labels), value);
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &str, _labels: &[(&str, &str)]) {}
    fn gauge(&self, _name: &str, _labels: &[(&str, &str)], _value: f64) {}
}
