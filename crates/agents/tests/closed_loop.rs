//! End-to-end runs of the orchestrator against snapshot telemetry, with
//! recording action handlers and a capturing notifier.

use async_trait::async_trait;
use autoheal_agents::Orchestrator;
use autoheal_core::config::{AppConfig, BreachThresholdConfig};
use autoheal_core::plan::{ActionType, Parameters, PlanStatus};
use autoheal_core::ports::{
    capture_notifier, ActionHandler, ActionOutcome, CaptureNotifier, LogFilter, NotificationKind,
    SnapshotTelemetry, TelemetrySource,
};
use autoheal_core::types::{
    BreachDirection, LogEntry, MetricCategory, MetricSample, MetricSeries, PlatformEvent,
    TelemetryWindow,
};
use autoheal_core::{AutohealError, AutohealResult};
use autoheal_remediation::HandlerRegistry;
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::watch;

#[derive(Default)]
struct RecordingHandler {
    calls: Mutex<Vec<String>>,
    delay: Option<std::time::Duration>,
}

impl RecordingHandler {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionHandler for RecordingHandler {
    async fn execute(
        &self,
        target: &str,
        _namespace: &str,
        _parameters: &Parameters,
    ) -> AutohealResult<ActionOutcome> {
        self.calls.lock().unwrap().push(target.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(ActionOutcome::succeeded(Parameters::new(), Parameters::new()))
    }
}

/// Metrics come from a snapshot; logs and events always fail.
struct FlakyTelemetry {
    inner: SnapshotTelemetry,
}

#[async_trait]
impl TelemetrySource for FlakyTelemetry {
    async fn query_metrics(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AutohealResult<Vec<MetricSeries>> {
        self.inner.query_metrics(start, end).await
    }

    async fn query_logs(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _filter: &LogFilter,
    ) -> AutohealResult<Vec<LogEntry>> {
        Err(AutohealError::Unavailable("log store offline".into()))
    }

    async fn query_events(
        &self,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> AutohealResult<Vec<PlatformEvent>> {
        Err(AutohealError::Unavailable("event api offline".into()))
    }
}

fn latency_series(values: &[(DateTime<Utc>, f64)]) -> MetricSeries {
    MetricSeries::new("order_latency_ms", MetricCategory::Trading)
        .with_label("namespace", "production")
        .with_label("service", "trading-api")
        .with_samples(values.iter().map(|&(t, v)| MetricSample::new(t, v)).collect())
}

/// Two days of hourly samples oscillating around 40.
fn learning_history() -> MetricSeries {
    let end = Utc::now() - Duration::hours(1);
    let offsets = [-3.0, -1.0, 1.0, 3.0];
    let points: Vec<(DateTime<Utc>, f64)> = (0..48)
        .map(|i| (end - Duration::hours(47 - i), 40.0 + offsets[i as usize % 4]))
        .collect();
    latency_series(&points)
}

fn spike_window() -> TelemetryWindow {
    TelemetryWindow {
        metrics: vec![latency_series(&[(Utc::now(), 95.0)])],
        ..Default::default()
    }
}

fn write_playbook(dir: &TempDir, risk_override: f64) {
    let yaml = format!(
        r#"
id: latency-scale-out
name: Scale out trading api
trigger_conditions:
  - "order_latency_ms above baseline"
risk_override: {risk_override}
steps:
  - name: scale out
    action: hpa_scale
    target: trading-api
    parameters:
      replicas: 6
"#
    );
    std::fs::write(dir.path().join("latency.yaml"), yaml).unwrap();
}

fn test_config(dir: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.playbooks_dir = Some(dir.path().to_string_lossy().into_owned());
    config.baseline.min_history_days = 1;
    config
}

fn recording_registry() -> (HandlerRegistry, Arc<RecordingHandler>) {
    let handler = Arc::new(RecordingHandler::default());
    let mut registry = HandlerRegistry::new();
    registry.register(ActionType::HpaScale, handler.clone());
    (registry, handler)
}

fn build(
    config: AppConfig,
    telemetry: Arc<dyn TelemetrySource>,
) -> (Orchestrator, Arc<CaptureNotifier>, Arc<RecordingHandler>) {
    let notifier = capture_notifier();
    let (registry, handler) = recording_registry();
    let orchestrator = Orchestrator::new(config, telemetry, notifier.clone(), registry).unwrap();
    orchestrator.baselines().learn(&learning_history()).unwrap();
    (orchestrator, notifier, handler)
}

#[tokio::test]
async fn test_auto_plan_runs_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    write_playbook(&dir, 0.1);
    let telemetry = Arc::new(SnapshotTelemetry::new(spike_window()));
    let (orchestrator, notifier, handler) = build(test_config(&dir), telemetry);

    let report = orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.anomalies, 1);
    assert_eq!(report.plans_created, 1);
    assert_eq!(report.plans_executed, 1);
    assert_eq!(handler.calls(), vec!["trading-api"]);

    let plans = orchestrator.planner().recent_plans(10);
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].status, PlanStatus::Success);
    assert_eq!(plans[0].playbook_id.as_deref(), Some("latency-scale-out"));
    assert_eq!(notifier.count_kind(NotificationKind::Anomaly), 1);
    assert_eq!(notifier.count_kind(NotificationKind::Remediation), 1);
    assert!(orchestrator.executor().audit().verify_chain().chain_intact);

    // the anomaly stays open but its plan is terminal, so the next cycle
    // plans again and the target's cooldown refuses the step
    let second = orchestrator.run_cycle().await.unwrap();
    assert_eq!(second.plans_created, 1);
    assert_eq!(handler.calls().len(), 1);
    assert_eq!(orchestrator.status().cycles_run, 2);
}

#[tokio::test]
async fn test_manual_plan_waits_for_two_approvers() {
    let dir = tempfile::tempdir().unwrap();
    write_playbook(&dir, 0.7);
    let telemetry = Arc::new(SnapshotTelemetry::new(spike_window()));
    let (orchestrator, notifier, handler) = build(test_config(&dir), telemetry);

    let report = orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.plans_created, 1);
    assert_eq!(report.plans_executed, 0);
    assert!(handler.calls().is_empty());
    assert_eq!(notifier.count_kind(NotificationKind::ApprovalRequest), 1);

    let pending = orchestrator.planner().pending_approvals();
    assert_eq!(pending.len(), 1);
    let plan_id = pending[0].id.clone();

    // an open plan suppresses re-planning for the same anomaly
    let again = orchestrator.run_cycle().await.unwrap();
    assert_eq!(again.plans_created, 0);

    let first = orchestrator.approve_and_execute(&plan_id, "alice").await.unwrap();
    assert_eq!(first.status, PlanStatus::WaitingApproval);
    assert!(handler.calls().is_empty());

    let second = orchestrator.approve_and_execute(&plan_id, "bob").await.unwrap();
    assert_eq!(second.status, PlanStatus::Success);
    assert_eq!(handler.calls(), vec!["trading-api"]);
    assert_eq!(orchestrator.status().pending_approvals, 0);
}

#[tokio::test]
async fn test_concurrent_approvals_execute_once() {
    let dir = tempfile::tempdir().unwrap();
    write_playbook(&dir, 0.5);
    let telemetry = Arc::new(SnapshotTelemetry::new(spike_window()));
    let handler = Arc::new(RecordingHandler {
        delay: Some(std::time::Duration::from_millis(200)),
        ..Default::default()
    });
    let mut registry = HandlerRegistry::new();
    registry.register(ActionType::HpaScale, handler.clone());
    let orchestrator =
        Orchestrator::new(test_config(&dir), telemetry, capture_notifier(), registry).unwrap();
    orchestrator.baselines().learn(&learning_history()).unwrap();

    orchestrator.run_cycle().await.unwrap();
    let pending = orchestrator.planner().pending_approvals();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].approvals_required, 1);
    let plan_id = pending[0].id.clone();

    let (a, b) = tokio::join!(
        orchestrator.approve_and_execute(&plan_id, "alice"),
        orchestrator.approve_and_execute(&plan_id, "bob"),
    );
    assert_eq!(a.unwrap().status, PlanStatus::Success);
    assert_eq!(b.unwrap().status, PlanStatus::Executing);
    assert_eq!(handler.calls(), vec!["trading-api"]);
    assert_eq!(
        orchestrator.planner().get_plan(&plan_id).unwrap().status,
        PlanStatus::Success
    );

    // a finished plan is never picked up again
    let late = orchestrator.approve_and_execute(&plan_id, "carol").await.unwrap();
    assert_eq!(late.status, PlanStatus::Success);
    assert_eq!(handler.calls().len(), 1);
}

#[tokio::test]
async fn test_log_outage_does_not_block_planning() {
    let dir = tempfile::tempdir().unwrap();
    write_playbook(&dir, 0.1);
    let telemetry = Arc::new(FlakyTelemetry {
        inner: SnapshotTelemetry::new(spike_window()),
    });
    let (orchestrator, _notifier, handler) = build(test_config(&dir), telemetry);

    let report = orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.plans_executed, 1);
    assert_eq!(handler.calls().len(), 1);
}

#[tokio::test]
async fn test_metrics_outage_fails_the_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let telemetry = Arc::new(SnapshotTelemetry::new(spike_window()));
    telemetry.set_unavailable(true);
    let (orchestrator, _notifier, _handler) = build(test_config(&dir), telemetry.clone());

    let err = orchestrator.run_cycle().await.unwrap_err();
    assert!(matches!(err, AutohealError::Unavailable(_)));
    assert_eq!(orchestrator.status().cycles_run, 0);

    telemetry.set_unavailable(false);
    assert!(orchestrator.run_cycle().await.is_ok());
}

#[tokio::test]
async fn test_rising_metric_raises_breach_prediction() {
    let dir = tempfile::tempdir().unwrap();
    let end = Utc::now();
    let queue = MetricSeries::new("queue_depth", MetricCategory::Queue).with_samples(
        (0..60)
            .map(|i| MetricSample::new(end - Duration::minutes(59 - i), 10.0 + i as f64))
            .collect(),
    );
    let telemetry = Arc::new(SnapshotTelemetry::new(TelemetryWindow {
        metrics: vec![queue],
        ..Default::default()
    }));

    let mut config = test_config(&dir);
    config.orchestrator.breach_thresholds = vec![BreachThresholdConfig {
        metric: "queue_depth".into(),
        threshold: 100.0,
        direction: BreachDirection::Above,
    }];
    let (orchestrator, notifier, _handler) = build(config, telemetry);

    let report = orchestrator.run_cycle().await.unwrap();
    assert_eq!(report.anomalies, 0);
    assert_eq!(report.predicted_breaches, 1);
    assert_eq!(notifier.count_kind(NotificationKind::Prediction), 1);
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let telemetry = Arc::new(SnapshotTelemetry::new(spike_window()));
    let (orchestrator, _notifier, _handler) = build(test_config(&dir), telemetry);
    let orchestrator = Arc::new(orchestrator);

    let (tx, rx) = watch::channel(false);
    let runner = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run(rx).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    tx.send(true).unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(5), runner)
        .await
        .expect("orchestrator did not stop")
        .unwrap();
    let status = orchestrator.status();
    assert!(status.cycles_run >= 1);
    assert!(status.last_baseline_update.is_some());
}
