//! Baseline learner: per-metric expected value and variance profiles by
//! hour of day and day of week, learned from history with outliers excluded.
//!
//! Baselines are only written here and are replaced wholesale on re-learn;
//! every other component reads them through [`BaselineEngine::get_baseline`].

use autoheal_core::config::BaselineConfig;
use autoheal_core::types::{metric_key, MetricCategory, MetricSample, MetricSeries};
use autoheal_core::{AutohealError, AutohealResult};
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::stats;

/// Whole-history statistics computed on the filtered samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalStats {
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    pub median: f64,
    pub mad: f64,
    pub min: f64,
    pub max: f64,
    pub p5: f64,
    pub p95: f64,
    pub p99: f64,
}

impl GlobalStats {
    fn from_values(values: &[f64]) -> Self {
        Self {
            count: values.len(),
            mean: stats::mean(values),
            std: stats::std_dev(values),
            median: stats::median(values),
            mad: stats::mad(values),
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            p5: stats::percentile(values, 5.0),
            p95: stats::percentile(values, 95.0),
            p99: stats::percentile(values, 99.0),
        }
    }
}

/// Profile for one hour of the day (UTC).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyProfile {
    pub hour: u32,
    pub mean: f64,
    pub std: f64,
    pub count: usize,
    /// Weekday (0 = Monday) to multiplier on `mean`.
    #[serde(default)]
    pub weekday_adjustments: BTreeMap<u32, f64>,
}

/// Additive trend/seasonal/residual split. Absent when the history is
/// shorter than two seasonal periods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decomposition {
    pub period: usize,
    /// Trend change per sample.
    pub trend_slope: f64,
    /// One additive offset per position in the period, centred on zero.
    pub seasonal: Vec<f64>,
    pub residual_std: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    pub metric_name: String,
    pub metric_key: String,
    pub category: MetricCategory,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub global: GlobalStats,
    pub hourly: BTreeMap<u32, HourlyProfile>,
    pub decomposition: Option<Decomposition>,
    pub quality_score: f64,
    pub data_start: DateTime<Utc>,
    pub data_end: DateTime<Utc>,
    pub outliers_excluded: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Baseline {
    /// Expected (value, std) at `at`: the hour's profile scaled by its
    /// weekday multiplier when present, else the global statistics.
    pub fn get_expected_value(&self, at: DateTime<Utc>) -> (f64, f64) {
        match self.hourly.get(&at.hour()) {
            Some(profile) => {
                let weekday = at.weekday().num_days_from_monday();
                let multiplier = profile
                    .weekday_adjustments
                    .get(&weekday)
                    .copied()
                    .unwrap_or(1.0);
                (profile.mean * multiplier, profile.std)
            }
            None => (self.global.mean, self.global.std),
        }
    }

    pub fn is_stale(&self, max_age_hours: i64) -> bool {
        Utc::now() - self.updated_at > Duration::hours(max_age_hours)
    }

    pub fn coverage_days(&self) -> f64 {
        (self.data_end - self.data_start).num_seconds() as f64 / 86_400.0
    }
}

/// Learns and stores baselines. Concurrent readers, single writer per key.
pub struct BaselineEngine {
    config: BaselineConfig,
    baselines: DashMap<String, Baseline>,
}

impl Default for BaselineEngine {
    fn default() -> Self {
        Self::new(BaselineConfig::default())
    }
}

impl BaselineEngine {
    pub fn new(config: BaselineConfig) -> Self {
        Self {
            config,
            baselines: DashMap::new(),
        }
    }

    pub fn config(&self) -> &BaselineConfig {
        &self.config
    }

    /// Learn a baseline from `series` and replace any stored one.
    /// Returns `InsufficientData` without touching the store when the
    /// history is too short or too few samples survive outlier filtering.
    pub fn learn(&self, series: &MetricSeries) -> AutohealResult<Baseline> {
        let key = series.metric_key();
        let (start, end) = match (series.first_timestamp(), series.last_timestamp()) {
            (Some(s), Some(e)) => (s, e),
            _ => {
                return Err(AutohealError::InsufficientData(format!("{key}: no samples")));
            }
        };

        let span = end - start;
        if span < Duration::days(self.config.min_history_days as i64) {
            debug!(metric = %key, span_hours = span.num_hours(), "History too short for baseline");
            return Err(AutohealError::InsufficientData(format!(
                "{key}: {:.1} days of history, need {}",
                span.num_seconds() as f64 / 86_400.0,
                self.config.min_history_days
            )));
        }

        let filtered = self.filter_outliers(&series.samples);
        if filtered.len() < self.config.min_samples {
            return Err(AutohealError::InsufficientData(format!(
                "{key}: {} usable samples, need {}",
                filtered.len(),
                self.config.min_samples
            )));
        }

        let values: Vec<f64> = filtered.iter().map(|s| s.value).collect();
        let global = GlobalStats::from_values(&values);
        let hourly = self.hourly_profiles(&filtered);
        let decomposition = self.decompose(&values);
        let quality_score = self.quality_score(values.len(), span, &global);
        let now = Utc::now();

        let baseline = Baseline {
            metric_name: series.name.clone(),
            metric_key: key.clone(),
            category: series.category,
            labels: series.labels.clone(),
            global,
            hourly,
            decomposition,
            quality_score,
            data_start: start,
            data_end: end,
            outliers_excluded: series.samples.len() - filtered.len(),
            created_at: now,
            updated_at: now,
        };

        info!(
            metric = %key,
            samples = values.len(),
            outliers = baseline.outliers_excluded,
            hours = baseline.hourly.len(),
            quality = baseline.quality_score,
            "Baseline learned"
        );
        metrics::counter!("autoheal.baselines.learned").increment(1);

        self.baselines.insert(key, baseline.clone());
        Ok(baseline)
    }

    pub fn get_baseline(&self, name: &str, labels: &BTreeMap<String, String>) -> Option<Baseline> {
        self.get_by_key(&metric_key(name, labels))
    }

    pub fn get_by_key(&self, key: &str) -> Option<Baseline> {
        self.baselines.get(key).map(|b| b.value().clone())
    }

    /// Keys whose baseline has not been refreshed within `max_age_hours`.
    pub fn stale_baselines(&self, max_age_hours: i64) -> Vec<String> {
        let mut keys: Vec<String> = self
            .baselines
            .iter()
            .filter(|b| b.value().is_stale(max_age_hours))
            .map(|b| b.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.baselines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.baselines.is_empty()
    }

    pub fn export_json(&self) -> AutohealResult<String> {
        let mut all: Vec<Baseline> = self.baselines.iter().map(|b| b.value().clone()).collect();
        all.sort_by(|a, b| a.metric_key.cmp(&b.metric_key));
        Ok(serde_json::to_string(&all)?)
    }

    /// Load previously exported baselines, replacing same-key entries.
    pub fn import_json(&self, raw: &str) -> AutohealResult<usize> {
        let all: Vec<Baseline> = serde_json::from_str(raw)?;
        let count = all.len();
        for baseline in all {
            self.baselines.insert(baseline.metric_key.clone(), baseline);
        }
        info!(count = count, "Baselines imported");
        Ok(count)
    }

    /// Drops points whose modified z-score exceeds the configured sigma.
    /// Skipped for short series and for series with zero MAD.
    fn filter_outliers(&self, samples: &[MetricSample]) -> Vec<MetricSample> {
        let finite: Vec<MetricSample> = samples.iter().filter(|s| s.value.is_finite()).copied().collect();
        if finite.len() < 10 {
            return finite;
        }
        let values: Vec<f64> = finite.iter().map(|s| s.value).collect();
        let median = stats::median(&values);
        let mad = stats::mad(&values);
        if mad == 0.0 {
            return finite;
        }
        finite
            .into_iter()
            .filter(|s| stats::modified_zscore(s.value, median, mad) <= self.config.outlier_sigma)
            .collect()
    }

    fn hourly_profiles(&self, samples: &[MetricSample]) -> BTreeMap<u32, HourlyProfile> {
        let mut by_hour: BTreeMap<u32, Vec<&MetricSample>> = BTreeMap::new();
        for sample in samples {
            by_hour.entry(sample.timestamp.hour()).or_default().push(sample);
        }

        let mut profiles = BTreeMap::new();
        for (hour, bucket) in by_hour {
            if bucket.len() < self.config.min_hourly_samples {
                continue;
            }
            let values: Vec<f64> = bucket.iter().map(|s| s.value).collect();
            let hour_mean = stats::mean(&values);

            let mut by_weekday: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
            for sample in &bucket {
                by_weekday
                    .entry(sample.timestamp.weekday().num_days_from_monday())
                    .or_default()
                    .push(sample.value);
            }
            let weekday_adjustments = if hour_mean != 0.0 {
                by_weekday
                    .into_iter()
                    .filter(|(_, v)| v.len() >= self.config.min_weekday_samples)
                    .map(|(day, v)| (day, stats::mean(&v) / hour_mean))
                    .collect()
            } else {
                BTreeMap::new()
            };

            profiles.insert(
                hour,
                HourlyProfile {
                    hour,
                    mean: hour_mean,
                    std: stats::std_dev(&values),
                    count: values.len(),
                    weekday_adjustments,
                },
            );
        }
        profiles
    }

    /// Classical additive decomposition with a centred moving-average trend.
    fn decompose(&self, values: &[f64]) -> Option<Decomposition> {
        let period = self.config.seasonal_period;
        if period < 2 || values.len() < 2 * period {
            return None;
        }

        let half = period / 2;
        let mut trend = vec![f64::NAN; values.len()];
        let mut window: f64 = values[..period].iter().sum();
        for start in 0..=(values.len() - period) {
            if start > 0 {
                window += values[start + period - 1] - values[start - 1];
            }
            trend[start + half] = window / period as f64;
        }

        let mut sums = vec![0.0; period];
        let mut counts = vec![0usize; period];
        for (i, (v, t)) in values.iter().zip(&trend).enumerate() {
            if t.is_finite() {
                sums[i % period] += v - t;
                counts[i % period] += 1;
            }
        }
        if counts.iter().any(|c| *c == 0) {
            return None;
        }
        let mut seasonal: Vec<f64> = sums.iter().zip(&counts).map(|(s, c)| s / *c as f64).collect();
        let offset = stats::mean(&seasonal);
        seasonal.iter_mut().for_each(|s| *s -= offset);

        let trend_points: Vec<f64> = trend.iter().copied().filter(|t| t.is_finite()).collect();
        let (trend_slope, _) = stats::linear_regression(&trend_points);
        let residuals: Vec<f64> = values
            .iter()
            .zip(&trend)
            .enumerate()
            .filter(|(_, (_, t))| t.is_finite())
            .map(|(i, (v, t))| v - t - seasonal[i % period])
            .collect();

        Some(Decomposition {
            period,
            trend_slope,
            seasonal,
            residual_std: stats::std_dev(&residuals),
        })
    }

    fn quality_score(&self, sample_count: usize, span: Duration, global: &GlobalStats) -> f64 {
        let optimal_days = self.config.optimal_history_days as f64;
        let expected_volume = optimal_days * 24.0 * 60.0;
        let volume = (sample_count as f64 / expected_volume).min(1.0);
        let coverage_days = span.num_seconds() as f64 / 86_400.0;
        let coverage = (coverage_days / optimal_days).min(1.0);
        let stability = if global.mean == 0.0 {
            0.5
        } else {
            (1.0 - global.std / global.mean.abs()).max(0.0)
        };
        (0.3 * volume + 0.4 * coverage + 0.3 * stability).clamp(0.0, 1.0)
    }
}
