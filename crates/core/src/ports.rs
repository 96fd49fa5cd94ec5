//! Collaborator traits: the narrow seams through which the engine talks to
//! telemetry backends, the platform it mutates, and notification delivery.
//!
//! Engine components hold `Arc<dyn Trait>` values. In-memory implementations
//! live here for tests and for replaying a captured telemetry snapshot.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{AutohealError, AutohealResult};
use crate::normalize::DataNormalizer;
use crate::plan::Parameters;
use crate::types::{LogEntry, LogLevel, MetricSeries, PlatformEvent, TelemetryWindow};

// ─── Telemetry ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub service: Option<String>,
    pub min_level: Option<LogLevel>,
    pub contains: Option<String>,
}

impl LogFilter {
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(service) = &self.service {
            if &entry.service != service {
                return false;
            }
        }
        if let Some(level) = self.min_level {
            if entry.level < level {
                return false;
            }
        }
        if let Some(needle) = &self.contains {
            if !entry.message.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn query_metrics(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AutohealResult<Vec<MetricSeries>>;

    async fn query_logs(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        filter: &LogFilter,
    ) -> AutohealResult<Vec<LogEntry>>;

    async fn query_events(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AutohealResult<Vec<PlatformEvent>>;
}

/// Serves a fixed telemetry snapshot regardless of the requested window.
/// Can be switched into an unavailable state to exercise outage handling.
#[derive(Default)]
pub struct SnapshotTelemetry {
    window: Mutex<TelemetryWindow>,
    unavailable: AtomicBool,
}

impl SnapshotTelemetry {
    pub fn new(window: TelemetryWindow) -> Self {
        Self {
            window: Mutex::new(window),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn from_json_file(path: &str) -> AutohealResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let window: TelemetryWindow = serde_json::from_str(&raw)?;
        Ok(Self::new(DataNormalizer::default().normalize_window(window)))
    }

    pub fn replace(&self, window: TelemetryWindow) {
        *self.window.lock().expect("telemetry snapshot mutex poisoned") = window;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> AutohealResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AutohealError::Unavailable("telemetry snapshot offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TelemetrySource for SnapshotTelemetry {
    async fn query_metrics(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> AutohealResult<Vec<MetricSeries>> {
        self.check_available()?;
        Ok(self
            .window
            .lock()
            .expect("telemetry snapshot mutex poisoned")
            .metrics
            .clone())
    }

    async fn query_logs(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        filter: &LogFilter,
    ) -> AutohealResult<Vec<LogEntry>> {
        self.check_available()?;
        Ok(self
            .window
            .lock()
            .expect("telemetry snapshot mutex poisoned")
            .logs
            .iter()
            .filter(|l| filter.matches(l))
            .cloned()
            .collect())
    }

    async fn query_events(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> AutohealResult<Vec<PlatformEvent>> {
        self.check_available()?;
        Ok(self
            .window
            .lock()
            .expect("telemetry snapshot mutex poisoned")
            .events
            .clone())
    }
}

// ─── Remediation actions ────────────────────────────────────────────────

/// Result of one platform mutation. `state_before`/`rollback_data` are
/// captured before the mutation is applied.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub error: Option<String>,
    #[serde(default)]
    pub state_before: Parameters,
    #[serde(default)]
    pub rollback_data: Parameters,
}

impl ActionOutcome {
    pub fn succeeded(state_before: Parameters, rollback_data: Parameters) -> Self {
        Self {
            success: true,
            error: None,
            state_before,
            rollback_data,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl RollbackOutcome {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// One action type's binding to the platform.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(
        &self,
        target: &str,
        namespace: &str,
        parameters: &Parameters,
    ) -> AutohealResult<ActionOutcome>;

    /// Whether `rollback` performs a real compensation.
    fn supports_rollback(&self) -> bool {
        false
    }

    async fn rollback(
        &self,
        _target: &str,
        _namespace: &str,
        _rollback_data: &Parameters,
    ) -> AutohealResult<RollbackOutcome> {
        Ok(RollbackOutcome::succeeded())
    }
}

// ─── Notifications ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Anomaly,
    Prediction,
    Remediation,
    ApprovalRequest,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Anomaly => "anomaly",
            NotificationKind::Prediction => "prediction",
            NotificationKind::Remediation => "remediation",
            NotificationKind::ApprovalRequest => "approval_request",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Delivery transport. Returns whether the payload was accepted.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, payload: &NotificationPayload) -> bool;
}

/// Drops everything; used when no delivery channel is configured.
pub struct NoOpNotifier;

#[async_trait]
impl Notifier for NoOpNotifier {
    async fn send(&self, _payload: &NotificationPayload) -> bool {
        false
    }
}

/// In-memory notifier that captures payloads for testing.
#[derive(Default)]
pub struct CaptureNotifier {
    payloads: Mutex<Vec<NotificationPayload>>,
}

impl CaptureNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn payloads(&self) -> Vec<NotificationPayload> {
        self.payloads.lock().expect("notifier mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.payloads.lock().expect("notifier mutex poisoned").len()
    }

    pub fn count_kind(&self, kind: NotificationKind) -> usize {
        self.payloads
            .lock()
            .expect("notifier mutex poisoned")
            .iter()
            .filter(|p| p.kind == kind)
            .count()
    }
}

#[async_trait]
impl Notifier for CaptureNotifier {
    async fn send(&self, payload: &NotificationPayload) -> bool {
        self.payloads
            .lock()
            .expect("notifier mutex poisoned")
            .push(payload.clone());
        true
    }
}

/// Convenience: a notifier that discards payloads.
pub fn noop_notifier() -> Arc<dyn Notifier> {
    Arc::new(NoOpNotifier)
}

/// Convenience: a capture notifier for tests.
pub fn capture_notifier() -> Arc<CaptureNotifier> {
    Arc::new(CaptureNotifier::new())
}
