//! Metric event model.
//!
//! The engine emits timestamped, labeled events with named values; the
//! host owns the wire encoding. `Display` renders a line-oriented form
//! for diagnostics only.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Counter histogram keyed by a numeric code (HTTP or OCSP status).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeMap {
    counts: BTreeMap<i64, u64>,
}

impl CodeMap {
    pub fn inc(&mut self, code: i64) {
        *self.counts.entry(code).or_insert(0) += 1;
    }

    pub fn get(&self, code: i64) -> u64 {
        self.counts.get(&code).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, u64)> + '_ {
        self.counts.iter().map(|(k, v)| (*k, *v))
    }
}

/// Upper bounds (milliseconds) for the default latency buckets; an
/// implicit overflow bucket catches the rest.
const DEFAULT_BUCKET_BOUNDS_MS: [u64; 10] = [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

/// Cumulative latency distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyDist {
    bounds_ms: Vec<u64>,
    /// One count per bound, plus a trailing overflow bucket.
    buckets: Vec<u64>,
    count: u64,
    sum_secs: f64,
}

impl Default for LatencyDist {
    fn default() -> Self {
        Self::with_bounds(&DEFAULT_BUCKET_BOUNDS_MS)
    }
}

impl LatencyDist {
    pub fn with_bounds(bounds_ms: &[u64]) -> Self {
        Self {
            bounds_ms: bounds_ms.to_vec(),
            buckets: vec![0; bounds_ms.len() + 1],
            count: 0,
            sum_secs: 0.0,
        }
    }

    pub fn observe(&mut self, latency: Duration) {
        let ms = latency.as_millis() as u64;
        let idx = self
            .bounds_ms
            .iter()
            .position(|&b| ms <= b)
            .unwrap_or(self.bounds_ms.len());
        self.buckets[idx] += 1;
        self.count += 1;
        self.sum_secs += latency.as_secs_f64();
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum_secs(&self) -> f64 {
        self.sum_secs
    }

    pub fn bucket_counts(&self) -> &[u64] {
        &self.buckets
    }
}

/// A named value carried by a metric event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Map(CodeMap),
    Dist(LatencyDist),
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Int(v) => write!(f, "{v}"),
            MetricValue::Float(v) => write!(f, "{v}"),
            MetricValue::Map(m) => {
                write!(f, "map:")?;
                for (code, count) in m.iter() {
                    write!(f, "{code}={count},")?;
                }
                Ok(())
            }
            MetricValue::Dist(d) => {
                write!(f, "dist:count={},sum={:.6}", d.count(), d.sum_secs())
            }
        }
    }
}

/// One timestamped, labeled export of named values for a single
/// (target, responder) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEvent {
    pub timestamp: SystemTime,
    pub labels: Vec<(String, String)>,
    pub metrics: Vec<(String, MetricValue)>,
}

impl MetricEvent {
    pub fn new(timestamp: SystemTime) -> Self {
        Self {
            timestamp,
            labels: Vec::new(),
            metrics: Vec::new(),
        }
    }

    pub fn add_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }

    pub fn add_metric(mut self, name: impl Into<String>, value: MetricValue) -> Self {
        self.metrics.push((name.into(), value));
        self
    }

    /// Look up a named value, for assertions and host-side routing.
    pub fn metric(&self, name: &str) -> Option<&MetricValue> {
        self.metrics
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for MetricEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let epoch = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        write!(f, "{epoch}")?;
        for (k, v) in &self.labels {
            write!(f, " {k}={v}")?;
        }
        for (name, value) in &self.metrics {
            write!(f, " {name}={value}")?;
        }
        Ok(())
    }
}
