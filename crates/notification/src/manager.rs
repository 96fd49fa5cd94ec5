//! Notification manager: builds payloads for engine events and suppresses
//! repeats of the same key inside the cooldown window.

use autoheal_cognition::forecaster::TrendPrediction;
use autoheal_core::anomaly::{Anomaly, AnomalyBatch};
use autoheal_core::config::NotificationConfig;
use autoheal_core::plan::ActionPlan;
use autoheal_core::ports::{noop_notifier, NotificationKind, NotificationPayload, Notifier};
use autoheal_core::types::BreachDirection;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::webhook::WebhookNotifier;

pub struct NotificationManager {
    notifier: Arc<dyn Notifier>,
    cooldown: Duration,
    last_sent: DashMap<String, DateTime<Utc>>,
}

impl NotificationManager {
    pub fn new(notifier: Arc<dyn Notifier>, cooldown_seconds: i64) -> Self {
        Self {
            notifier,
            cooldown: Duration::seconds(cooldown_seconds),
            last_sent: DashMap::new(),
        }
    }

    /// Webhook delivery when a URL is configured, otherwise a sink that
    /// drops everything.
    pub fn from_config(config: &NotificationConfig) -> Self {
        let notifier: Arc<dyn Notifier> = if config.webhook_url.is_empty() {
            noop_notifier()
        } else {
            Arc::new(WebhookNotifier::from_config(config))
        };
        info!(webhook_configured = !config.webhook_url.is_empty(), "Notification manager ready");
        Self::new(notifier, config.dedup_cooldown_seconds)
    }

    pub async fn notify_anomaly(&self, anomaly: &Anomaly) -> bool {
        let key = format!("anomaly:{}", anomaly.metric_key());
        let direction = if anomaly.is_above_expected() { "above" } else { "below" };
        let payload = NotificationPayload {
            kind: NotificationKind::Anomaly,
            title: format!(
                "[{}] Anomaly detected: {}",
                anomaly.severity.as_str().to_uppercase(),
                anomaly.metric_name
            ),
            body: [
                format!("Metric: {}", anomaly.metric_name),
                format!("Category: {}", anomaly.category.as_str()),
                format!("Current value: {:.4}", anomaly.current_value),
                format!("Expected value: {:.4}", anomaly.expected_value),
                format!(
                    "Deviation: {:.2} sigma {direction} ({:+.1}%)",
                    anomaly.deviation_sigma.abs(),
                    anomaly.deviation_percent
                ),
                format!("Duration: {} minutes", anomaly.duration_minutes),
                format!("Type: {}", anomaly.anomaly_type.as_str()),
            ]
            .join("\n"),
            metadata: json!({
                "anomaly_id": anomaly.id,
                "metric_key": anomaly.metric_key(),
                "severity": anomaly.severity.as_str(),
                "labels": anomaly.labels,
                "deviation_sigma": anomaly.deviation_sigma,
                "deviation_percent": anomaly.deviation_percent,
                "ensemble_score": anomaly.ensemble_score,
            }),
            timestamp: anomaly.detected_at,
        };
        self.deliver(&key, payload).await
    }

    /// Number of anomalies actually delivered.
    pub async fn notify_anomaly_batch(&self, batch: &AnomalyBatch) -> usize {
        let mut sent = 0;
        for anomaly in &batch.anomalies {
            if self.notify_anomaly(anomaly).await {
                sent += 1;
            }
        }
        sent
    }

    /// Predicted threshold crossing. Returns false without a crossing.
    pub async fn notify_prediction(
        &self,
        prediction: &TrendPrediction,
        current_value: f64,
        threshold: f64,
        direction: BreachDirection,
    ) -> bool {
        let Some(point) = prediction.will_breach_threshold(threshold, direction) else {
            return false;
        };
        let eta_hours = prediction
            .time_to_breach(threshold, direction)
            .map(|d| d.num_seconds() as f64 / 3600.0)
            .unwrap_or_default();

        let key = format!("prediction:{}:{}", prediction.metric_key, threshold);
        let payload = NotificationPayload {
            kind: NotificationKind::Prediction,
            title: format!("Trend alert: {}", prediction.metric_name),
            body: [
                format!("Metric: {}", prediction.metric_name),
                format!("Current value: {current_value:.4}"),
                format!("Predicted value: {:.4}", point.value),
                format!("Threshold: {threshold:.4}"),
                format!("ETA: {eta_hours:.1} hours"),
            ]
            .join("\n"),
            metadata: json!({
                "metric_key": prediction.metric_key,
                "labels": prediction.labels,
                "current_value": current_value,
                "predicted_value": point.value,
                "threshold": threshold,
                "direction": direction,
                "eta_hours": eta_hours,
                "breach_at": point.timestamp,
            }),
            timestamp: Utc::now(),
        };
        self.deliver(&key, payload).await
    }

    pub async fn notify_remediation(&self, plan: &ActionPlan) -> bool {
        let key = format!("remediation:{}:{}", plan.id, plan.status.as_str());
        let mut body = vec![
            format!("Plan: {}", plan.id),
            format!("Anomaly: {} ({})", plan.anomaly_id, plan.anomaly_metric),
            format!("Status: {}", plan.status.as_str()),
        ];
        if !plan.summary.is_empty() {
            body.push(plan.summary.clone());
        }
        if let Some(error) = &plan.error_message {
            body.push(format!("Error: {error}"));
        }
        let payload = NotificationPayload {
            kind: NotificationKind::Remediation,
            title: format!("Remediation {}: {}", plan.status.as_str(), plan.anomaly_metric),
            body: body.join("\n"),
            metadata: json!({
                "plan_id": plan.id,
                "anomaly_id": plan.anomaly_id,
                "status": plan.status,
                "steps": plan.steps.iter().map(|s| json!({
                    "action": s.action_type,
                    "target": s.target,
                    "namespace": s.namespace,
                    "status": s.status,
                })).collect::<Vec<_>>(),
            }),
            timestamp: Utc::now(),
        };
        self.deliver(&key, payload).await
    }

    pub async fn notify_approval_request(&self, plan: &ActionPlan) -> bool {
        let key = format!("approval:{}", plan.id);
        let payload = NotificationPayload {
            kind: NotificationKind::ApprovalRequest,
            title: format!("Approval required: {}", plan.id),
            body: [
                format!("Root cause: {}", plan.root_cause),
                format!(
                    "Risk: {} (score {:.2})",
                    plan.risk_level.as_str(),
                    plan.risk_score
                ),
                format!(
                    "Approvals: {}/{}",
                    plan.approvals_received.len(),
                    plan.approvals_required
                ),
                plan.report(),
            ]
            .join("\n"),
            metadata: json!({
                "plan_id": plan.id,
                "anomaly_id": plan.anomaly_id,
                "risk_level": plan.risk_level,
                "risk_score": plan.risk_score,
                "approvals_required": plan.approvals_required,
                "approval_deadline": plan.approval_deadline,
            }),
            timestamp: Utc::now(),
        };
        self.deliver(&key, payload).await
    }

    /// Claims `key` for this window. A key is claimed even if delivery
    /// later fails, so a flapping webhook is not hammered every cycle.
    fn should_notify(&self, key: &str, now: DateTime<Utc>) -> bool {
        match self.last_sent.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                if now - *e.get() < self.cooldown {
                    return false;
                }
                e.insert(now);
                true
            }
            Entry::Vacant(e) => {
                e.insert(now);
                true
            }
        }
    }

    async fn deliver(&self, key: &str, payload: NotificationPayload) -> bool {
        let kind = payload.kind.as_str();
        if !self.should_notify(key, Utc::now()) {
            debug!(key = %key, "Skipping duplicate notification");
            metrics::counter!("autoheal.notifications.suppressed", "kind" => kind).increment(1);
            return false;
        }
        let delivered = self.notifier.send(&payload).await;
        if delivered {
            info!(key = %key, kind = kind, "Notification sent");
            metrics::counter!("autoheal.notifications.sent", "kind" => kind).increment(1);
        } else {
            warn!(key = %key, kind = kind, "Notification not delivered");
            metrics::counter!("autoheal.notifications.failed", "kind" => kind).increment(1);
        }
        delivered
    }

    /// Forgets dedup entries older than the cooldown.
    pub fn prune(&self, now: DateTime<Utc>) {
        self.last_sent.retain(|_, sent| now - *sent < self.cooldown);
    }

    pub fn tracked_keys(&self) -> usize {
        self.last_sent.len()
    }
}
