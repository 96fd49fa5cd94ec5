//! Anomaly records produced by the detector, grouped per detection cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::types::{metric_key, MetricCategory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AnomalySeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalySeverity::Low => "low",
            AnomalySeverity::Medium => "medium",
            AnomalySeverity::High => "high",
            AnomalySeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    /// Single out-of-range observation.
    Point,
    /// Monotone drift over the most recent samples.
    Trend,
}

impl AnomalyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyType::Point => "point",
            AnomalyType::Trend => "trend",
        }
    }
}

/// One detector's verdict for a value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyScore {
    pub algorithm: String,
    /// Normalized to [0, 1].
    pub score: f64,
    pub threshold: f64,
    pub is_anomaly: bool,
}

/// Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: String,
    pub detected_at: DateTime<Utc>,
    pub metric_name: String,
    pub category: MetricCategory,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub current_value: f64,
    pub expected_value: f64,
    pub expected_std: f64,
    /// Signed deviation in standard deviations.
    pub deviation_sigma: f64,
    pub deviation_percent: f64,
    pub anomaly_type: AnomalyType,
    pub severity: AnomalySeverity,
    #[serde(default)]
    pub scores: Vec<AnomalyScore>,
    pub ensemble_score: f64,
    pub started_at: DateTime<Utc>,
    pub duration_minutes: i64,
    #[serde(default)]
    pub acknowledged_by: Option<String>,
}

impl Anomaly {
    pub fn metric_key(&self) -> String {
        metric_key(&self.metric_name, &self.labels)
    }

    /// Namespace label, if the metric carries one.
    pub fn namespace(&self) -> Option<&str> {
        self.labels.get("namespace").map(String::as_str)
    }

    pub fn is_above_expected(&self) -> bool {
        self.deviation_sigma > 0.0
    }
}

/// `ANO-` followed by eight hex characters.
pub fn new_anomaly_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("ANO-{}", &raw[..8])
}

/// All anomalies raised in one detection cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyBatch {
    pub detection_time: DateTime<Utc>,
    pub anomalies: Vec<Anomaly>,
    pub total_metrics_checked: usize,
    pub detection_duration_ms: i64,
}

impl AnomalyBatch {
    pub fn empty(detection_time: DateTime<Utc>) -> Self {
        Self {
            detection_time,
            anomalies: Vec::new(),
            total_metrics_checked: 0,
            detection_duration_ms: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.anomalies.len()
    }

    pub fn critical_count(&self) -> usize {
        self.count_severity(AnomalySeverity::Critical)
    }

    pub fn high_count(&self) -> usize {
        self.count_severity(AnomalySeverity::High)
    }

    fn count_severity(&self, severity: AnomalySeverity) -> usize {
        self.anomalies.iter().filter(|a| a.severity == severity).count()
    }
}
