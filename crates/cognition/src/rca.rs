//! Rule-based root-cause analysis.
//!
//! [`RcaRuleSet`] holds declarative rules loaded once from YAML and scores
//! them against the signals around an anomaly with weighted partial credit.
//! [`RcaEngine`] gathers those signals (related metric values, error
//! patterns in logs, platform event reasons), adds correlation evidence and
//! turns matched rules into ranked remediation suggestions.

use autoheal_core::anomaly::{Anomaly, AnomalySeverity};
use autoheal_core::types::{LogEntry, MetricSeries, PlatformEvent};
use autoheal_core::AutohealResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::stats;

const PRIMARY_WEIGHT: f64 = 0.4;
const CORRELATED_WEIGHT: f64 = 0.3;
const LOG_WEIGHT: f64 = 0.15;
const EVENT_WEIGHT: f64 = 0.15;
/// Credit per unit of value/threshold for a primary metric below threshold.
const PRIMARY_PARTIAL_WEIGHT: f64 = 0.2;

/// Error vocabulary searched for in log messages.
pub const ERROR_PATTERNS: [&str; 16] = [
    "timeout",
    "deadline exceeded",
    "connection refused",
    "out of memory",
    "oom",
    "disk full",
    "no space left",
    "permission denied",
    "authentication failed",
    "rate limit",
    "throttled",
    "circuit breaker",
    "panic",
    "fatal",
    "crash",
    "killed",
];

const BUILTIN_RULES: &str = r#"
rules:
  - id: rca-latency-db-pool
    name: Latency from database connection pool exhaustion
    condition:
      primary_metric: order_latency_ms
      primary_threshold: 200
      correlated_metrics:
        - metric: db_connection_pool_usage
          threshold: 0.9
      log_patterns: [timeout, connection refused]
    root_cause: Database connection pool exhausted
    remediation:
      - action: hpa_scale
        target: trading-api
        priority: 1
      - action: pod_restart
        target: trading-api
        priority: 2
    severity: high

  - id: rca-memory-leak
    name: Memory growth ending in OOM kills
    condition:
      primary_metric: memory_usage_percent
      primary_threshold: 90
      log_patterns: [out of memory, oom]
      event_type: OOMKilled
    root_cause: Memory leak or undersized memory limit
    remediation:
      - action: pod_restart
        target: trading-api
        priority: 1
    severity: high

  - id: rca-error-rate-deploy
    name: Error rate spike after a rollout
    condition:
      primary_metric: http_error_rate
      primary_threshold: 0.05
      log_patterns: [panic, fatal]
      event_types: [ScalingReplicaSet, Pulled]
    root_cause: Faulty deployment
    remediation:
      - action: deployment_rollback
        target: api-gateway
        priority: 1
    severity: critical

  - id: rca-queue-backlog
    name: Consumer backlog
    condition:
      primary_metric: queue_depth
      primary_threshold: 10000
      correlated_metrics:
        - metric: consumer_lag_seconds
          threshold: 60
    root_cause: Consumers cannot keep up with producers
    remediation:
      - action: hpa_scale
        target: order-consumer
        priority: 1
    severity: medium

  - id: rca-cache-miss
    name: Cache hit ratio collapse
    condition:
      primary_metric: cache_miss_rate
      primary_threshold: 0.5
      correlated_metrics:
        - metric: db_query_latency_ms
          threshold: 100
    root_cause: Cache poisoned or evicted
    remediation:
      - action: cache_flush
        target: redis-cache
        priority: 1
    severity: medium

  - id: rca-disk-full
    name: Disk exhaustion
    condition:
      primary_metric: disk_usage_percent
      primary_threshold: 90
      log_patterns: [no space left, disk full]
    root_cause: Disk filling up from logs or data growth
    remediation:
      - action: custom_webhook
        target: disk-cleanup
        priority: 1
    severity: high

correlations:
  - name: latency-vs-pool
    metrics: [order_latency_ms, db_connection_pool_usage]
    expected_correlation: positive
  - name: backlog-vs-lag
    metrics: [queue_depth, consumer_lag_seconds]
    expected_correlation: positive
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelatedMetric {
    pub metric: String,
    pub threshold: f64,
    #[serde(default = "default_correlation")]
    pub correlation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationTemplate {
    pub action: String,
    pub target: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleCondition {
    #[serde(default)]
    pub primary_metric: String,
    #[serde(default)]
    pub primary_threshold: f64,
    #[serde(default)]
    pub correlated_metrics: Vec<CorrelatedMetric>,
    #[serde(default)]
    pub log_patterns: Vec<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub event_types: Vec<String>,
}

impl RuleCondition {
    /// `event_type` and `event_types` merged.
    pub fn all_event_types(&self) -> Vec<&str> {
        self.event_type
            .iter()
            .chain(self.event_types.iter())
            .map(String::as_str)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RcaRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub condition: RuleCondition,
    pub root_cause: String,
    #[serde(default)]
    pub remediation: Vec<RemediationTemplate>,
    #[serde(default = "default_severity")]
    pub severity: AnomalySeverity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationPattern {
    pub name: String,
    pub metrics: Vec<String>,
    #[serde(default = "default_correlation")]
    pub expected_correlation: String,
    #[serde(default)]
    pub lag_minutes: u32,
}

fn default_correlation() -> String {
    "positive".to_string()
}
fn default_priority() -> u32 {
    1
}
fn default_severity() -> AnomalySeverity {
    AnomalySeverity::Medium
}

#[derive(Debug, Default, Deserialize)]
struct RawRuleFile {
    #[serde(default)]
    rules: Vec<serde_yaml::Value>,
    #[serde(default)]
    correlations: Vec<serde_yaml::Value>,
}

/// A rule and how well the current signals matched it.
#[derive(Debug, Clone, Copy)]
pub struct RuleMatch<'a> {
    pub rule: &'a RcaRule,
    pub score: f64,
}

/// Static, read-only after load.
#[derive(Debug, Clone, Default)]
pub struct RcaRuleSet {
    rules: Vec<RcaRule>,
    correlations: Vec<CorrelationPattern>,
}

impl RcaRuleSet {
    pub fn builtin() -> Self {
        Self::from_yaml_str(BUILTIN_RULES).unwrap_or_default()
    }

    /// Rules from `path`, or the built-in set when no path is configured.
    pub fn load(path: Option<&str>) -> AutohealResult<Self> {
        match path {
            Some(path) => Self::load_file(Path::new(path)),
            None => Ok(Self::builtin()),
        }
    }

    pub fn load_file(path: &Path) -> AutohealResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let set = Self::from_yaml_str(&raw)?;
        info!(
            path = %path.display(),
            rules = set.rules.len(),
            correlations = set.correlations.len(),
            "RCA rules loaded"
        );
        Ok(set)
    }

    /// Parses a rule document. Individual rules or correlation patterns that
    /// fail to parse are logged and skipped.
    pub fn from_yaml_str(raw: &str) -> AutohealResult<Self> {
        let file: RawRuleFile = serde_yaml::from_str(raw)?;
        let mut set = Self::default();
        for value in file.rules {
            match serde_yaml::from_value::<RcaRule>(value.clone()) {
                Ok(rule) => set.rules.push(rule),
                Err(e) => {
                    let id = value.get("id").and_then(|v| v.as_str()).unwrap_or("?");
                    warn!(rule_id = %id, error = %e, "Skipping unparseable RCA rule");
                }
            }
        }
        for value in file.correlations {
            match serde_yaml::from_value::<CorrelationPattern>(value) {
                Ok(pattern) => set.correlations.push(pattern),
                Err(e) => warn!(error = %e, "Skipping unparseable correlation pattern"),
            }
        }
        Ok(set)
    }

    pub fn rules(&self) -> &[RcaRule] {
        &self.rules
    }

    pub fn correlations(&self) -> &[CorrelationPattern] {
        &self.correlations
    }

    pub fn get_rule(&self, id: &str) -> Option<&RcaRule> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn rules_for_metric(&self, metric_name: &str) -> Vec<&RcaRule> {
        self.rules
            .iter()
            .filter(|r| r.condition.primary_metric == metric_name)
            .collect()
    }

    /// Rules with a non-zero score, best first. Ties keep file order.
    pub fn find_matching_rules(
        &self,
        metric_name: &str,
        value: f64,
        correlated_values: &HashMap<String, f64>,
        log_patterns_found: &[String],
        recent_events: &[String],
    ) -> Vec<RuleMatch<'_>> {
        let mut matches: Vec<RuleMatch<'_>> = self
            .rules
            .iter()
            .map(|rule| RuleMatch {
                rule,
                score: match_score(
                    rule,
                    metric_name,
                    value,
                    correlated_values,
                    log_patterns_found,
                    recent_events,
                ),
            })
            .filter(|m| m.score > 0.0)
            .collect();
        matches.sort_by(|a, b| b.score.total_cmp(&a.score));
        matches
    }
}

/// Weighted partial-credit score of one rule, in [0, 1].
pub fn match_score(
    rule: &RcaRule,
    metric_name: &str,
    value: f64,
    correlated_values: &HashMap<String, f64>,
    log_patterns_found: &[String],
    recent_events: &[String],
) -> f64 {
    let cond = &rule.condition;
    let mut score = 0.0;

    if !cond.primary_metric.is_empty() && cond.primary_metric == metric_name {
        if value >= cond.primary_threshold {
            score += PRIMARY_WEIGHT;
        } else if cond.primary_threshold > 0.0 {
            let ratio = value / cond.primary_threshold;
            if ratio > 0.5 {
                score += PRIMARY_PARTIAL_WEIGHT * ratio;
            }
        }
    }

    if !cond.correlated_metrics.is_empty() {
        let hits = cond
            .correlated_metrics
            .iter()
            .filter(|c| correlated_values.get(&c.metric).is_some_and(|v| *v >= c.threshold))
            .count();
        score += CORRELATED_WEIGHT * hits as f64 / cond.correlated_metrics.len() as f64;
    }

    if !cond.log_patterns.is_empty() {
        let found: Vec<String> = log_patterns_found.iter().map(|p| p.to_lowercase()).collect();
        let hits = cond
            .log_patterns
            .iter()
            .filter(|p| {
                let needle = p.to_lowercase();
                found.iter().any(|f| f.contains(&needle))
            })
            .count();
        score += LOG_WEIGHT * hits as f64 / cond.log_patterns.len() as f64;
    }

    let event_types = cond.all_event_types();
    if !event_types.is_empty() {
        let hits = event_types
            .iter()
            .filter(|e| recent_events.iter().any(|r| r.eq_ignore_ascii_case(e)))
            .count();
        score += EVENT_WEIGHT * hits as f64 / event_types.len() as f64;
    }

    score
}

/// Error vocabulary hits and explicit error codes, in first-seen order.
pub fn extract_log_patterns(logs: &[LogEntry]) -> Vec<String> {
    let mut patterns: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for log in logs {
        let message = log.message.to_lowercase();
        for pattern in ERROR_PATTERNS {
            if message.contains(pattern) && seen.insert(pattern.to_string()) {
                patterns.push(pattern.to_string());
            }
        }
        if let Some(code) = &log.error_code {
            if seen.insert(code.clone()) {
                patterns.push(code.clone());
            }
        }
    }
    patterns
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestedAction {
    pub action: String,
    pub target: String,
    pub priority: u32,
    pub from_rule: String,
    pub severity: AnomalySeverity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RcaResult {
    pub anomaly_id: String,
    pub root_causes: Vec<String>,
    pub matched_rule_ids: Vec<String>,
    pub correlated_anomalies: Vec<String>,
    pub log_patterns: Vec<String>,
    pub confidence: f64,
    pub suggested_actions: Vec<SuggestedAction>,
    pub created_at: DateTime<Utc>,
}

impl RcaResult {
    /// No evidence; used when analysis is disabled.
    pub fn empty(anomaly_id: &str) -> Self {
        Self {
            anomaly_id: anomaly_id.to_string(),
            root_causes: Vec::new(),
            matched_rule_ids: Vec::new(),
            correlated_anomalies: Vec::new(),
            log_patterns: Vec::new(),
            confidence: 0.0,
            suggested_actions: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn primary_root_cause(&self) -> Option<&str> {
        self.root_causes.first().map(String::as_str)
    }
}

pub struct RcaEngine {
    rules: Arc<RcaRuleSet>,
}

impl RcaEngine {
    pub fn new(rules: Arc<RcaRuleSet>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &RcaRuleSet {
        &self.rules
    }

    pub fn analyze(
        &self,
        anomaly: &Anomaly,
        related_metrics: &[MetricSeries],
        logs: &[LogEntry],
        events: &[PlatformEvent],
    ) -> RcaResult {
        let correlated_values: HashMap<String, f64> = related_metrics
            .iter()
            .filter_map(|s| s.latest_value().map(|v| (s.name.clone(), v)))
            .collect();
        let log_patterns = extract_log_patterns(logs);
        let event_types: Vec<String> = events
            .iter()
            .filter(|e| !e.reason.is_empty())
            .map(|e| e.reason.clone())
            .collect();

        let matched = self.rules.find_matching_rules(
            &anomaly.metric_name,
            anomaly.current_value,
            &correlated_values,
            &log_patterns,
            &event_types,
        );

        let mut root_causes: Vec<String> = Vec::new();
        for m in &matched {
            if !root_causes.contains(&m.rule.root_cause) {
                root_causes.push(m.rule.root_cause.clone());
            }
        }
        let correlation_causes = self.correlation_causes(anomaly, related_metrics);
        for cause in &correlation_causes {
            if !root_causes.contains(cause) {
                root_causes.push(cause.clone());
            }
        }

        let confidence = confidence(
            matched.len(),
            correlation_causes.len(),
            log_patterns.len(),
            event_types.len(),
        );
        let result = RcaResult {
            anomaly_id: anomaly.id.clone(),
            root_causes,
            matched_rule_ids: matched.iter().map(|m| m.rule.id.clone()).collect(),
            correlated_anomalies: correlated_anomalies(anomaly, related_metrics),
            log_patterns,
            confidence,
            suggested_actions: suggested_actions(&matched),
            created_at: Utc::now(),
        };

        info!(
            anomaly_id = %anomaly.id,
            metric = %anomaly.metric_name,
            rules = result.matched_rule_ids.len(),
            causes = result.root_causes.len(),
            confidence = result.confidence,
            "RCA completed"
        );
        metrics::counter!("autoheal.rca.analyses").increment(1);
        result
    }

    fn correlation_causes(&self, anomaly: &Anomaly, related: &[MetricSeries]) -> Vec<String> {
        if anomaly.deviation_sigma.abs() <= 2.0 {
            return Vec::new();
        }
        let mut causes = Vec::new();
        for pattern in self.rules.correlations() {
            if !pattern.metrics.contains(&anomaly.metric_name) {
                continue;
            }
            for other in pattern.metrics.iter().filter(|m| **m != anomaly.metric_name) {
                let Some(series) = related.iter().find(|s| &s.name == other) else {
                    continue;
                };
                let values = series.values();
                let recent = &values[values.len().saturating_sub(10)..];
                if latest_zscore(recent).is_some_and(|z| z > 2.0) {
                    causes.push(format!(
                        "Correlated anomaly in {other} ({} correlation)",
                        pattern.expected_correlation
                    ));
                }
            }
        }
        causes
    }
}

/// |last − mean| / std over `values`; `None` when flat or empty.
fn latest_zscore(values: &[f64]) -> Option<f64> {
    let last = *values.last()?;
    let std = stats::std_dev(values);
    if std == 0.0 {
        return None;
    }
    Some((last - stats::mean(values)).abs() / std)
}

fn correlated_anomalies(anomaly: &Anomaly, related: &[MetricSeries]) -> Vec<String> {
    related
        .iter()
        .filter(|s| s.name != anomaly.metric_name && s.samples.len() >= 10)
        .filter(|s| latest_zscore(&s.values()).is_some_and(|z| z > 2.5))
        .map(|s| s.name.clone())
        .collect()
}

fn confidence(rules: usize, correlation_causes: usize, log_patterns: usize, events: usize) -> f64 {
    let total = (0.15 * rules as f64).min(0.4)
        + (0.1 * correlation_causes as f64).min(0.25)
        + (0.05 * log_patterns as f64).min(0.2)
        + (0.05 * events as f64).min(0.15);
    total.min(1.0)
}

fn suggested_actions(matched: &[RuleMatch<'_>]) -> Vec<SuggestedAction> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut actions: Vec<SuggestedAction> = Vec::new();
    for m in matched {
        for template in &m.rule.remediation {
            if seen.insert(format!("{}:{}", template.action, template.target)) {
                actions.push(SuggestedAction {
                    action: template.action.clone(),
                    target: template.target.clone(),
                    priority: template.priority,
                    from_rule: m.rule.id.clone(),
                    severity: m.rule.severity,
                });
            }
        }
    }
    actions.sort_by_key(|a| a.priority);
    actions
}
