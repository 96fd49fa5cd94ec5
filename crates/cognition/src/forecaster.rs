//! Trend forecaster: additive Holt-Winters with an optional damped trend,
//! parameters picked by grid search on one-step-ahead error.
//!
//! Predictions are cached per (metric key, horizon) for a short TTL so the
//! proactive breach check does not refit every cycle.

use autoheal_core::config::ForecastConfig;
use autoheal_core::types::{BreachDirection, MetricSeries};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::stats;

const ALPHA_GRID: [f64; 9] = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9];
const BETA_GRID: [f64; 4] = [0.01, 0.05, 0.1, 0.2];
const GAMMA_GRID: [f64; 3] = [0.05, 0.1, 0.3];

pub const ALGORITHM: &str = "holt_winters";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictedPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendPrediction {
    pub metric_name: String,
    pub metric_key: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub horizon_hours: u32,
    /// Timestamp of the last observed sample; the forecast origin.
    pub last_observed_at: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub points: Vec<PredictedPoint>,
    pub algorithm: String,
    pub residual_std: f64,
    pub cache_ttl_secs: u64,
}

impl TrendPrediction {
    /// First predicted point, in time order, that crosses `threshold`.
    pub fn will_breach_threshold(
        &self,
        threshold: f64,
        direction: BreachDirection,
    ) -> Option<&PredictedPoint> {
        self.points
            .iter()
            .find(|p| direction.crosses(p.value, threshold))
    }

    /// Time from the last observed sample (the forecast origin) to the
    /// first crossing. Independent of when the forecast was computed.
    pub fn time_to_breach(&self, threshold: f64, direction: BreachDirection) -> Option<Duration> {
        self.will_breach_threshold(threshold, direction)
            .map(|p| p.timestamp - self.last_observed_at)
    }

    pub fn peak(&self) -> Option<&PredictedPoint> {
        self.points
            .iter()
            .max_by(|a, b| a.value.total_cmp(&b.value))
    }
}

/// Fitted smoothing state after consuming the whole series.
#[derive(Debug, Clone)]
struct Fit {
    level: f64,
    trend: f64,
    seasonal: Vec<f64>,
    phi: f64,
    sse: f64,
    residual_std: f64,
}

impl Fit {
    /// Forecast `h` steps past the last observation at index `n - 1`.
    fn forecast(&self, n: usize, h: usize) -> f64 {
        let mut damped = 0.0;
        let mut factor = 1.0;
        for _ in 0..h {
            factor *= self.phi;
            damped += factor;
        }
        let season = if self.seasonal.is_empty() {
            0.0
        } else {
            self.seasonal[(n + h - 1) % self.seasonal.len()]
        };
        self.level + damped * self.trend + season
    }
}

struct CachedPrediction {
    stored_at: DateTime<Utc>,
    prediction: TrendPrediction,
}

pub struct TrendForecaster {
    config: ForecastConfig,
    cache: DashMap<String, CachedPrediction>,
}

impl Default for TrendForecaster {
    fn default() -> Self {
        Self::new(ForecastConfig::default())
    }
}

impl TrendForecaster {
    pub fn new(config: ForecastConfig) -> Self {
        Self {
            config,
            cache: DashMap::new(),
        }
    }

    /// Forecast `horizon_hours` ahead, one point per sample interval.
    /// `None` when the series is too short or the fit diverges.
    pub fn predict(&self, series: &MetricSeries, horizon_hours: u32) -> Option<TrendPrediction> {
        let key = format!("{}:{}h", series.metric_key(), horizon_hours);
        if let Some(hit) = self.cached(&key) {
            return Some(hit);
        }

        let values = series.values();
        let n = values.len();
        if n < self.config.min_points {
            debug!(metric = %series.metric_key(), points = n, "Too few points to forecast");
            return None;
        }
        let last_ts = series.last_timestamp()?;
        let interval = median_interval(series)?;

        let fit = self.fit_best(&values)?;
        let steps = ((horizon_hours as f64 * 3600.0) / interval.num_seconds() as f64).ceil() as usize;
        let band = self.config.confidence_z * fit.residual_std;
        let points: Vec<PredictedPoint> = (1..=steps)
            .map(|h| {
                let value = fit.forecast(n, h);
                PredictedPoint {
                    timestamp: last_ts + interval * h as i32,
                    value,
                    lower: Some(value - band),
                    upper: Some(value + band),
                }
            })
            .collect();
        if points.iter().any(|p| !p.value.is_finite()) {
            return None;
        }

        let prediction = TrendPrediction {
            metric_name: series.name.clone(),
            metric_key: series.metric_key(),
            labels: series.labels.clone(),
            horizon_hours,
            last_observed_at: last_ts,
            generated_at: Utc::now(),
            points,
            algorithm: ALGORITHM.to_string(),
            residual_std: fit.residual_std,
            cache_ttl_secs: self.config.cache_ttl_secs,
        };
        debug!(
            metric = %prediction.metric_key,
            horizon_hours = horizon_hours,
            points = prediction.points.len(),
            sse = fit.sse,
            "Forecast computed"
        );
        self.cache.insert(
            key,
            CachedPrediction {
                stored_at: prediction.generated_at,
                prediction: prediction.clone(),
            },
        );
        Some(prediction)
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    fn cached(&self, key: &str) -> Option<TrendPrediction> {
        let ttl = Duration::seconds(self.config.cache_ttl_secs as i64);
        let expired = match self.cache.get(key) {
            Some(entry) if Utc::now() - entry.stored_at < ttl => {
                return Some(entry.prediction.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.cache.remove(key);
        }
        None
    }

    fn fit_best(&self, values: &[f64]) -> Option<Fit> {
        let n = values.len();
        let period = self.config.max_seasonal_period.min(n / 3);
        let seasonal = period >= 2;
        let phi = if n > self.config.damping_min_points {
            self.config.damping_phi
        } else {
            1.0
        };
        let gammas: &[f64] = if seasonal { &GAMMA_GRID } else { &[0.0] };

        let mut best: Option<Fit> = None;
        for &alpha in &ALPHA_GRID {
            for &beta in &BETA_GRID {
                for &gamma in gammas {
                    let period = if seasonal { period } else { 0 };
                    let Some(fit) = fit_holt_winters(values, alpha, beta, gamma, phi, period) else {
                        continue;
                    };
                    if best.as_ref().map_or(true, |b| fit.sse < b.sse) {
                        best = Some(fit);
                    }
                }
            }
        }
        best
    }
}

/// Runs the additive recursion once. `period == 0` disables seasonality.
fn fit_holt_winters(
    values: &[f64],
    alpha: f64,
    beta: f64,
    gamma: f64,
    phi: f64,
    period: usize,
) -> Option<Fit> {
    let (mut level, mut trend, mut seasonal) = if period >= 2 {
        initial_seasonal_state(values, period)
    } else {
        let trend = values[1] - values[0];
        (values[0] - trend, trend, Vec::new())
    };

    let mut errors = Vec::with_capacity(values.len());
    for (t, &x) in values.iter().enumerate() {
        let season = if seasonal.is_empty() { 0.0 } else { seasonal[t % period] };
        let forecast = level + phi * trend + season;
        errors.push(x - forecast);

        let prev_level = level;
        level = alpha * (x - season) + (1.0 - alpha) * (prev_level + phi * trend);
        trend = beta * (level - prev_level) + (1.0 - beta) * phi * trend;
        if !seasonal.is_empty() {
            seasonal[t % period] = gamma * (x - level) + (1.0 - gamma) * season;
        }
    }

    let sse: f64 = errors.iter().map(|e| e * e).sum();
    if !sse.is_finite() {
        return None;
    }
    Some(Fit {
        level,
        trend,
        seasonal,
        phi,
        sse,
        residual_std: stats::std_dev(&errors),
    })
}

/// Level/trend from the first two seasons, seasonal offsets detrended and
/// centred on zero. The returned level sits one step before the first sample.
fn initial_seasonal_state(values: &[f64], period: usize) -> (f64, f64, Vec<f64>) {
    let first = stats::mean(&values[..period]);
    let second = stats::mean(&values[period..2 * period]);
    let trend = (second - first) / period as f64;
    let centre = (period as f64 - 1.0) / 2.0;

    let mut seasonal: Vec<f64> = (0..period)
        .map(|i| values[i] - (first + trend * (i as f64 - centre)))
        .collect();
    let offset = stats::mean(&seasonal);
    seasonal.iter_mut().for_each(|s| *s -= offset);

    let level = first - trend * (centre + 1.0);
    (level, trend, seasonal)
}

fn median_interval(series: &MetricSeries) -> Option<Duration> {
    let diffs: Vec<f64> = series
        .samples
        .windows(2)
        .map(|w| (w[1].timestamp - w[0].timestamp).num_seconds() as f64)
        .collect();
    let secs = stats::median(&diffs).round() as i64;
    if secs <= 0 {
        return None;
    }
    Some(Duration::seconds(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoheal_core::types::{MetricCategory, MetricSample};
    use chrono::TimeZone;

    fn minute_series(values: impl IntoIterator<Item = f64>) -> MetricSeries {
        let start = Utc.with_ymd_and_hms(2024, 5, 6, 12, 0, 0).unwrap();
        let samples = values
            .into_iter()
            .enumerate()
            .map(|(i, v)| MetricSample::new(start + Duration::minutes(i as i64), v))
            .collect();
        MetricSeries::new("disk_usage_percent", MetricCategory::Infrastructure)
            .with_label("node", "worker-1")
            .with_samples(samples)
    }

    #[test]
    fn test_too_few_points_yields_nothing() {
        let forecaster = TrendForecaster::default();
        let series = minute_series((0..23).map(|i| i as f64));
        assert!(forecaster.predict(&series, 1).is_none());
    }

    #[test]
    fn test_linear_series_keeps_rising() {
        let forecaster = TrendForecaster::default();
        let series = minute_series((0..48).map(|i| 10.0 + 0.5 * i as f64));
        let prediction = forecaster.predict(&series, 1).unwrap();

        assert_eq!(prediction.points.len(), 60);
        assert_eq!(prediction.algorithm, "holt_winters");
        assert!(prediction.points.windows(2).all(|w| w[1].value > w[0].value));
        assert!((prediction.points[0].value - 34.0).abs() < 1e-6);
        assert_eq!(
            prediction.points[0].timestamp,
            series.last_timestamp().unwrap() + Duration::minutes(1)
        );
    }

    #[test]
    fn test_breach_matches_linear_extrapolation() {
        let forecaster = TrendForecaster::default();
        let series = minute_series((0..48).map(|i| 10.0 + 0.5 * i as f64));
        let prediction = forecaster.predict(&series, 1).unwrap();

        // last value 33.5, slope 0.5/min: 50.5 is reached 34 minutes out
        let breach = prediction
            .will_breach_threshold(50.2, BreachDirection::Above)
            .unwrap();
        assert!((breach.value - 50.5).abs() < 1e-6);
        assert_eq!(
            prediction.time_to_breach(50.2, BreachDirection::Above),
            Some(Duration::minutes(34))
        );
        // a stale forecast still measures from its origin sample
        let mut stale = prediction.clone();
        stale.generated_at = stale.generated_at + Duration::hours(2);
        assert_eq!(
            stale.time_to_breach(50.2, BreachDirection::Above),
            Some(Duration::minutes(34))
        );
        assert!(prediction
            .will_breach_threshold(5.0, BreachDirection::Below)
            .is_none());
    }

    #[test]
    fn test_seasonal_series_tracks_pattern() {
        let forecaster = TrendForecaster::default();
        let pattern = [10.0, 20.0, 30.0, 20.0];
        let series = minute_series((0..120).map(|i| pattern[i % 4]));
        let prediction = forecaster.predict(&series, 1).unwrap();
        let peak = prediction.peak().unwrap();
        assert!(peak.value > 25.0);
        assert!(prediction.points.iter().all(|p| p.value > 0.0 && p.value < 40.0));
    }

    #[test]
    fn test_cache_hit_and_clear() {
        let forecaster = TrendForecaster::default();
        let series = minute_series((0..30).map(|i| 100.0 - i as f64));
        let first = forecaster.predict(&series, 2).unwrap();
        assert_eq!(forecaster.cache_len(), 1);

        let second = forecaster.predict(&series, 2).unwrap();
        assert_eq!(first.generated_at, second.generated_at);

        forecaster.predict(&series, 1).unwrap();
        assert_eq!(forecaster.cache_len(), 2);
        forecaster.clear_cache();
        assert_eq!(forecaster.cache_len(), 0);
    }

    #[test]
    fn test_expired_cache_entry_is_recomputed() {
        let forecaster = TrendForecaster::new(ForecastConfig {
            cache_ttl_secs: 0,
            ..ForecastConfig::default()
        });
        let series = minute_series((0..30).map(|i| i as f64));
        forecaster.predict(&series, 1).unwrap();
        // a zero TTL means the stored entry is stale on the next access
        forecaster.predict(&series, 1).unwrap();
        assert_eq!(forecaster.cache_len(), 1);
    }
}
