//! Metrics collection for worker execution.
//!
//! A small extensible registry: [`Metric`] defines the interface,
//! [`MetricsCollector`] owns registered metrics and can print them or save
//! them as JSON. The worker registers counters for supersteps, messages,
//! requests, and out-of-core activity; jobs may register their own.

use std::any::Any;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::error::Result;

/// Trait for metrics tracked during job execution.
pub trait Metric: Send + Sync + Any {
    /// The metric name (e.g. `messages_sent`).
    fn name(&self) -> &str;

    /// The current value as JSON.
    fn value(&self) -> Value;

    /// Optional description of what this metric measures.
    fn description(&self) -> Option<&str> {
        None
    }
}

/// A monotonically increasing counter.
pub struct CounterMetric {
    name: String,
    count: AtomicU64,
}

impl CounterMetric {
    /// Build a zeroed counter.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { name: name.into(), count: AtomicU64::new(0) })
    }

    /// Add `n` to the counter.
    pub fn add(&self, n: u64) {
        self.count.fetch_add(n, Ordering::Relaxed);
    }

    /// Increment by one.
    pub fn increment(&self) {
        self.add(1);
    }

    /// The current count.
    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Metric for CounterMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Value {
        json!(self.get())
    }
}

/// Thread-safe container for a worker's metrics.
#[derive(Clone, Default)]
pub struct MetricsCollector {
    metrics: Arc<Mutex<BTreeMap<String, Arc<dyn Metric>>>>,
}

impl MetricsCollector {
    /// Build an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a metric, replacing any with the same name.
    pub fn register(&self, metric: Arc<dyn Metric>) {
        self.metrics.lock().insert(metric.name().to_string(), metric);
    }

    /// Register and return a fresh counter.
    pub fn counter(&self, name: &str) -> Arc<CounterMetric> {
        let counter = CounterMetric::new(name);
        self.register(counter.clone());
        counter
    }

    /// All metric values, name-sorted.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.metrics.lock().iter().map(|(k, m)| (k.clone(), m.value())).collect()
    }

    /// Print all metrics to stdout.
    pub fn print(&self) {
        for (name, value) in self.snapshot() {
            println!("{name}: {value}");
        }
    }

    /// Save all metrics as a JSON object.
    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let map: serde_json::Map<String, Value> = self.snapshot().into_iter().collect();
        let mut file = File::create(path)?;
        file.write_all(serde_json::to_string_pretty(&Value::Object(map)).unwrap_or_default().as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_snapshot() {
        let collector = MetricsCollector::new();
        let sent = collector.counter("messages_sent");
        sent.add(3);
        sent.increment();
        assert_eq!(sent.get(), 4);
        assert_eq!(collector.snapshot().get("messages_sent"), Some(&json!(4)));
    }
}
