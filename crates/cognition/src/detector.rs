//! Ensemble anomaly detector.
//!
//! Each metric's latest value is scored against its learned baseline by a
//! z-score scorer (hour/weekday expected value) and a MAD scorer (global
//! median). An anomaly is raised when enough scorers vote for it. Metrics
//! with no learned baseline are skipped.

use autoheal_core::anomaly::{new_anomaly_id, Anomaly, AnomalyBatch, AnomalyScore, AnomalySeverity, AnomalyType};
use autoheal_core::config::DetectionConfig;
use autoheal_core::types::{MetricCategory, MetricSeries};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::baseline::{Baseline, BaselineEngine};
use crate::stats;

const TREND_MIN_POINTS: usize = 10;
const TREND_WINDOW: usize = 5;

/// Multiplier on |σ| before the severity cut points are applied.
pub fn category_weight(category: MetricCategory) -> f64 {
    match category {
        MetricCategory::Trading | MetricCategory::Matching => 1.5,
        MetricCategory::Risk | MetricCategory::Wallet => 2.0,
        MetricCategory::Api => 1.2,
        MetricCategory::Infrastructure => 1.0,
        MetricCategory::Database => 1.3,
        MetricCategory::Queue => 1.2,
        MetricCategory::Business => 1.0,
    }
}

pub fn severity_for(deviation_sigma: f64, category: MetricCategory) -> AnomalySeverity {
    let weighted = deviation_sigma.abs() * category_weight(category);
    if weighted >= 5.0 {
        AnomalySeverity::Critical
    } else if weighted >= 4.0 {
        AnomalySeverity::High
    } else if weighted >= 3.0 {
        AnomalySeverity::Medium
    } else {
        AnomalySeverity::Low
    }
}

/// `Trend` when the last few samples move strictly in one direction.
pub fn classify(values: &[f64]) -> AnomalyType {
    if values.len() < TREND_MIN_POINTS {
        return AnomalyType::Point;
    }
    let tail = &values[values.len() - TREND_WINDOW..];
    let rising = tail.windows(2).all(|w| w[1] > w[0]);
    let falling = tail.windows(2).all(|w| w[1] < w[0]);
    if rising || falling {
        AnomalyType::Trend
    } else {
        AnomalyType::Point
    }
}

pub struct AnomalyDetector {
    config: DetectionConfig,
    baselines: Arc<BaselineEngine>,
    /// Open anomalies by metric key.
    active: DashMap<String, Anomaly>,
}

impl AnomalyDetector {
    pub fn new(config: DetectionConfig, baselines: Arc<BaselineEngine>) -> Self {
        Self {
            config,
            baselines,
            active: DashMap::new(),
        }
    }

    pub fn detect(&self, series: &[MetricSeries], at: DateTime<Utc>) -> AnomalyBatch {
        let started = Instant::now();
        let mut batch = AnomalyBatch::empty(at);

        for s in series {
            let Some(latest) = s.samples.last() else {
                continue;
            };
            batch.total_metrics_checked += 1;
            let key = s.metric_key();
            let Some(baseline) = self.baselines.get_by_key(&key) else {
                debug!(metric = %key, "No baseline, skipping");
                continue;
            };
            if let Some(anomaly) = self.score_metric(s, &baseline, latest.value, latest.timestamp, at) {
                batch.anomalies.push(anomaly);
            }
        }

        batch.detection_duration_ms = started.elapsed().as_millis() as i64;
        if !batch.anomalies.is_empty() {
            info!(
                anomalies = batch.count(),
                critical = batch.critical_count(),
                high = batch.high_count(),
                checked = batch.total_metrics_checked,
                "Anomalies detected"
            );
        }
        batch
    }

    fn score_metric(
        &self,
        series: &MetricSeries,
        baseline: &Baseline,
        value: f64,
        sampled_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Option<Anomaly> {
        let key = series.metric_key();
        let (expected, expected_std) = baseline.get_expected_value(sampled_at);
        let z = if expected_std > 0.0 {
            Some((value - expected).abs() / expected_std)
        } else {
            None
        };

        let mut scores = Vec::with_capacity(2);
        if let Some(z) = z {
            scores.push(score("zscore", z, self.config.zscore_threshold));
        }
        if baseline.global.mad > 0.0 {
            let mz = stats::modified_zscore(value, baseline.global.median, baseline.global.mad);
            scores.push(score("mad", mz, self.config.mad_threshold));
        }

        let votes = scores.iter().filter(|s| s.is_anomaly).count();
        if votes < self.config.ensemble_min_votes {
            let calm = z.map_or(true, |z| z < self.config.resolve_ratio * self.config.zscore_threshold);
            if calm && self.active.remove(&key).is_some() {
                info!(metric = %key, "Anomaly resolved");
            }
            return None;
        }

        let deviation_sigma = if expected_std > 0.0 {
            (value - expected) / expected_std
        } else {
            0.0
        };
        let deviation_percent = if expected != 0.0 {
            (value - expected) / expected.abs() * 100.0
        } else {
            0.0
        };
        let severity = severity_for(deviation_sigma, series.category);
        let ensemble_score = stats::mean(&scores.iter().map(|s| s.score).collect::<Vec<_>>());

        let (id, started_at, acknowledged_by) = match self.active.get(&key) {
            Some(open) => (open.id.clone(), open.started_at, open.acknowledged_by.clone()),
            None => (new_anomaly_id(), at, None),
        };

        let anomaly = Anomaly {
            id,
            detected_at: at,
            metric_name: series.name.clone(),
            category: series.category,
            labels: series.labels.clone(),
            current_value: value,
            expected_value: expected,
            expected_std,
            deviation_sigma,
            deviation_percent,
            anomaly_type: classify(&series.values()),
            severity,
            scores,
            ensemble_score,
            started_at,
            duration_minutes: (at - started_at).num_minutes(),
            acknowledged_by,
        };

        metrics::counter!("autoheal.anomalies.detected", "severity" => severity.as_str()).increment(1);
        debug!(
            metric = %key,
            value = value,
            expected = expected,
            sigma = deviation_sigma,
            severity = severity.as_str(),
            "Anomaly scored"
        );
        self.active.insert(key, anomaly.clone());
        Some(anomaly)
    }

    /// Open anomalies, optionally filtered, oldest first.
    pub fn active_anomalies(
        &self,
        category: Option<MetricCategory>,
        min_severity: Option<AnomalySeverity>,
    ) -> Vec<Anomaly> {
        let mut out: Vec<Anomaly> = self
            .active
            .iter()
            .map(|a| a.value().clone())
            .filter(|a| category.map_or(true, |c| a.category == c))
            .filter(|a| min_severity.map_or(true, |s| a.severity >= s))
            .collect();
        out.sort_by_key(|a| a.started_at);
        out
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Marks an open anomaly as seen by `who`. False when no open anomaly has `id`.
    pub fn acknowledge(&self, id: &str, who: &str) -> bool {
        for mut entry in self.active.iter_mut() {
            if entry.id == id {
                entry.acknowledged_by = Some(who.to_string());
                info!(anomaly_id = %id, by = %who, "Anomaly acknowledged");
                return true;
            }
        }
        false
    }
}

fn score(algorithm: &str, z: f64, threshold: f64) -> AnomalyScore {
    AnomalyScore {
        algorithm: algorithm.to_string(),
        score: (z / (2.0 * threshold)).min(1.0),
        threshold,
        is_anomaly: z > threshold,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::baseline::{GlobalStats, HourlyProfile};
    use autoheal_core::types::MetricSample;
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;

    /// Baseline of mean 40 / std 5 at every hour, median 40 / MAD 3.
    pub(crate) fn flat_baseline(series: &MetricSeries) -> Baseline {
        let now = Utc::now();
        let hourly = (0..24)
            .map(|hour| {
                (
                    hour,
                    HourlyProfile {
                        hour,
                        mean: 40.0,
                        std: 5.0,
                        count: 30,
                        weekday_adjustments: BTreeMap::new(),
                    },
                )
            })
            .collect();
        Baseline {
            metric_name: series.name.clone(),
            metric_key: series.metric_key(),
            category: series.category,
            labels: series.labels.clone(),
            global: GlobalStats {
                count: 720,
                mean: 40.0,
                std: 5.0,
                median: 40.0,
                mad: 3.0,
                min: 25.0,
                max: 55.0,
                p5: 32.0,
                p95: 48.0,
                p99: 52.0,
            },
            hourly,
            decomposition: None,
            quality_score: 0.8,
            data_start: now - Duration::days(30),
            data_end: now,
            outliers_excluded: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn engine_with(baselines: Vec<Baseline>) -> Arc<BaselineEngine> {
        let engine = BaselineEngine::default();
        engine
            .import_json(&serde_json::to_string(&baselines).unwrap())
            .unwrap();
        Arc::new(engine)
    }

    fn latency_series(values: &[f64], end: DateTime<Utc>) -> MetricSeries {
        let n = values.len() as i64;
        let samples = values
            .iter()
            .enumerate()
            .map(|(i, v)| MetricSample::new(end - Duration::minutes(n - 1 - i as i64), *v))
            .collect();
        MetricSeries::new("order_latency_ms", MetricCategory::Trading)
            .with_label("namespace", "production")
            .with_samples(samples)
    }

    fn weekday_afternoon() -> DateTime<Utc> {
        // Wednesday
        Utc.with_ymd_and_hms(2024, 3, 6, 14, 0, 0).unwrap()
    }

    #[test]
    fn test_critical_spike_detected() {
        let at = weekday_afternoon();
        let series = latency_series(&[41.0, 39.0, 42.0, 40.0, 95.0], at);
        let detector = AnomalyDetector::new(DetectionConfig::default(), engine_with(vec![flat_baseline(&series)]));

        let batch = detector.detect(&[series], at);
        assert_eq!(batch.count(), 1);
        let anomaly = &batch.anomalies[0];
        assert!((anomaly.deviation_sigma - 11.0).abs() < 1e-9);
        assert_eq!(anomaly.severity, AnomalySeverity::Critical);
        assert_eq!(anomaly.anomaly_type, AnomalyType::Point);
        assert!(anomaly.id.starts_with("ANO-"));
        assert_eq!(anomaly.scores.len(), 2);
        assert_eq!(batch.critical_count(), 1);
    }

    #[test]
    fn test_metric_without_baseline_skipped() {
        let at = weekday_afternoon();
        let series = latency_series(&[40.0, 500.0], at);
        let detector = AnomalyDetector::new(DetectionConfig::default(), engine_with(vec![]));
        let batch = detector.detect(&[series], at);
        assert_eq!(batch.count(), 0);
        assert_eq!(batch.total_metrics_checked, 1);
    }

    #[test]
    fn test_single_vote_is_not_enough() {
        let at = weekday_afternoon();
        // z = 3.2 votes; with MAD 10 the modified z is only 1.08
        let series = latency_series(&[56.0], at);
        let mut baseline = flat_baseline(&series);
        baseline.global.mad = 10.0;
        let detector = AnomalyDetector::new(DetectionConfig::default(), engine_with(vec![baseline]));
        assert_eq!(detector.detect(&[series], at).count(), 0);
    }

    #[test]
    fn test_trend_classification() {
        let at = weekday_afternoon();
        let values = [40.0, 41.0, 39.0, 40.0, 42.0, 60.0, 70.0, 80.0, 90.0, 100.0];
        let series = latency_series(&values, at);
        let detector = AnomalyDetector::new(DetectionConfig::default(), engine_with(vec![flat_baseline(&series)]));
        let batch = detector.detect(&[series], at);
        assert_eq!(batch.anomalies[0].anomaly_type, AnomalyType::Trend);
        assert_eq!(classify(&[1.0, 2.0, 3.0]), AnomalyType::Point);
    }

    #[test]
    fn test_active_state_duration_and_resolution() {
        let t0 = weekday_afternoon();
        let spike = latency_series(&[95.0], t0);
        let detector = AnomalyDetector::new(DetectionConfig::default(), engine_with(vec![flat_baseline(&spike)]));

        let first = detector.detect(&[spike], t0).anomalies[0].clone();
        let t1 = t0 + Duration::minutes(7);
        let again = detector.detect(&[latency_series(&[90.0], t1)], t1).anomalies[0].clone();
        assert_eq!(again.id, first.id);
        assert_eq!(again.started_at, t0);
        assert_eq!(again.duration_minutes, 7);
        assert_eq!(detector.active_count(), 1);

        // z = 2.4 sits inside the hysteresis band: not reported, still open
        let t2 = t1 + Duration::minutes(1);
        assert_eq!(detector.detect(&[latency_series(&[52.0], t2)], t2).count(), 0);
        assert_eq!(detector.active_count(), 1);

        let t3 = t2 + Duration::minutes(1);
        detector.detect(&[latency_series(&[41.0], t3)], t3);
        assert_eq!(detector.active_count(), 0);
    }

    #[test]
    fn test_acknowledge_and_filter() {
        let at = weekday_afternoon();
        let series = latency_series(&[95.0], at);
        let detector = AnomalyDetector::new(DetectionConfig::default(), engine_with(vec![flat_baseline(&series)]));
        let id = detector.detect(&[series], at).anomalies[0].id.clone();

        assert!(detector.acknowledge(&id, "oncall"));
        assert!(!detector.acknowledge("ANO-missing", "oncall"));
        let open = detector.active_anomalies(Some(MetricCategory::Trading), Some(AnomalySeverity::High));
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].acknowledged_by.as_deref(), Some("oncall"));
        assert!(detector.active_anomalies(Some(MetricCategory::Queue), None).is_empty());
    }

    #[test]
    fn test_severity_weights() {
        assert_eq!(severity_for(3.4, MetricCategory::Infrastructure), AnomalySeverity::Medium);
        assert_eq!(severity_for(-3.4, MetricCategory::Trading), AnomalySeverity::Critical);
        assert_eq!(severity_for(2.1, MetricCategory::Wallet), AnomalySeverity::High);
        assert_eq!(severity_for(1.0, MetricCategory::Api), AnomalySeverity::Low);
    }
}
