//! Telemetry types shared by every stage of the loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Business area a metric belongs to; drives severity weighting and impact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricCategory {
    Trading,
    Matching,
    Risk,
    Wallet,
    Api,
    Infrastructure,
    Database,
    Queue,
    Business,
}

impl Default for MetricCategory {
    fn default() -> Self {
        MetricCategory::Infrastructure
    }
}

impl MetricCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricCategory::Trading => "trading",
            MetricCategory::Matching => "matching",
            MetricCategory::Risk => "risk",
            MetricCategory::Wallet => "wallet",
            MetricCategory::Api => "api",
            MetricCategory::Infrastructure => "infrastructure",
            MetricCategory::Database => "database",
            MetricCategory::Queue => "queue",
            MetricCategory::Business => "business",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl MetricSample {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// A named, labelled series of samples. Transient: built per query window
/// and dropped after the cycle that consumed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSeries {
    pub name: String,
    #[serde(default)]
    pub category: MetricCategory,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub samples: Vec<MetricSample>,
}

impl MetricSeries {
    pub fn new(name: impl Into<String>, category: MetricCategory) -> Self {
        Self {
            name: name.into(),
            category,
            unit: String::new(),
            labels: BTreeMap::new(),
            samples: Vec::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_samples(mut self, samples: Vec<MetricSample>) -> Self {
        self.samples = samples;
        self
    }

    pub fn latest_value(&self) -> Option<f64> {
        self.samples.last().map(|s| s.value)
    }

    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.value).collect()
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.samples.first().map(|s| s.timestamp)
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.samples.last().map(|s| s.timestamp)
    }

    pub fn metric_key(&self) -> String {
        metric_key(&self.name, &self.labels)
    }
}

/// `name{k=v,...}` with labels in key order, or the bare name when unlabelled.
pub fn metric_key(name: &str, labels: &BTreeMap<String, String>) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let rendered: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{name}{{{}}}", rendered.join(","))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// Structured log line returned by the telemetry source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(default)]
    pub service: String,
    pub message: String,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub fields: serde_json::Value,
}

/// Discrete platform event (e.g. `OOMKilled`, `BackOff`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformEvent {
    pub reason: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub message: String,
    #[serde(default = "default_event_count")]
    pub count: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

fn default_event_count() -> u32 {
    1
}

/// Everything collected for one window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryWindow {
    #[serde(default)]
    pub metrics: Vec<MetricSeries>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub events: Vec<PlatformEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreachDirection {
    Above,
    Below,
}

impl BreachDirection {
    /// Strict comparison: touching the threshold is not a breach.
    pub fn crosses(&self, value: f64, threshold: f64) -> bool {
        match self {
            BreachDirection::Above => value > threshold,
            BreachDirection::Below => value < threshold,
        }
    }
}
