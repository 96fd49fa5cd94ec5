//! Telemetry normalization: ordering, timestamp alignment, deduplication
//! and label hygiene, applied before anything downstream reads a window.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, HashSet};

use crate::types::{LogEntry, MetricSample, MetricSeries, PlatformEvent, TelemetryWindow};

/// Only this much of a message participates in log deduplication.
const LOG_DEDUP_PREFIX: usize = 200;

#[derive(Debug, Clone)]
pub struct DataNormalizer {
    resolution_secs: i64,
}

impl Default for DataNormalizer {
    fn default() -> Self {
        Self::new(60)
    }
}

impl DataNormalizer {
    pub fn new(resolution_secs: i64) -> Self {
        Self {
            resolution_secs: resolution_secs.max(1),
        }
    }

    pub fn normalize_window(&self, window: TelemetryWindow) -> TelemetryWindow {
        TelemetryWindow {
            metrics: window
                .metrics
                .into_iter()
                .map(|s| self.normalize_series(s))
                .collect(),
            logs: self.normalize_logs(window.logs),
            events: self.normalize_events(window.events),
        }
    }

    /// Sorts, aligns to the resolution and keeps the last value per aligned
    /// timestamp, so the result is strictly increasing in time.
    pub fn normalize_series(&self, mut series: MetricSeries) -> MetricSeries {
        series.samples.sort_by_key(|s| s.timestamp);
        let mut aligned: BTreeMap<DateTime<Utc>, f64> = BTreeMap::new();
        for sample in &series.samples {
            if !sample.value.is_finite() {
                continue;
            }
            aligned.insert(self.align(sample.timestamp), sample.value);
        }
        series.samples = aligned
            .into_iter()
            .map(|(timestamp, value)| MetricSample { timestamp, value })
            .collect();
        series.labels = normalize_labels(&series.labels);
        series
    }

    /// Newest first, duplicates (same timestamp and message prefix) dropped.
    pub fn normalize_logs(&self, mut logs: Vec<LogEntry>) -> Vec<LogEntry> {
        logs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let mut seen: HashSet<(DateTime<Utc>, String)> = HashSet::new();
        logs.into_iter()
            .filter_map(|mut log| {
                let prefix: String = log.message.chars().take(LOG_DEDUP_PREFIX).collect();
                if !seen.insert((log.timestamp, prefix)) {
                    return None;
                }
                log.labels = normalize_labels(&log.labels);
                Some(log)
            })
            .collect()
    }

    /// Merges repeats of the same (kind, name, namespace, reason), summing
    /// counts and widening the seen window. Output is ordered by last_seen.
    pub fn normalize_events(&self, events: Vec<PlatformEvent>) -> Vec<PlatformEvent> {
        let mut merged: BTreeMap<(String, String, String, String), PlatformEvent> = BTreeMap::new();
        for event in events {
            let key = (
                event.kind.clone(),
                event.name.clone(),
                event.namespace.clone(),
                event.reason.clone(),
            );
            match merged.get_mut(&key) {
                Some(existing) => {
                    existing.count += event.count;
                    existing.first_seen = existing.first_seen.min(event.first_seen);
                    if event.last_seen > existing.last_seen {
                        existing.last_seen = event.last_seen;
                        existing.message = event.message;
                    }
                }
                None => {
                    merged.insert(key, event);
                }
            }
        }
        let mut out: Vec<PlatformEvent> = merged.into_values().collect();
        out.sort_by_key(|e| e.last_seen);
        out
    }

    fn align(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = ts.timestamp();
        let aligned = secs - secs.rem_euclid(self.resolution_secs);
        Utc.timestamp_opt(aligned, 0).single().unwrap_or(ts)
    }
}

/// Lowercases keys, maps `-` and `.` to `_`, trims values and drops empty ones.
pub fn normalize_labels(labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    labels
        .iter()
        .filter_map(|(k, v)| {
            let value = v.trim();
            if value.is_empty() {
                return None;
            }
            let key = k.to_lowercase().replace(['-', '.'], "_");
            Some((key, value.to_string()))
        })
        .collect()
}
