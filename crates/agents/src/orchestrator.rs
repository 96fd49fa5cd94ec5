//! Closed-loop orchestrator: detect → analyze → plan → (approve) → execute
//! → notify, once per cycle, with proactive breach forecasting and a
//! periodic background baseline re-learn.
//!
//! Work is isolated per anomaly: a failing log query, plan or notification
//! for one anomaly never stops the others in the same cycle. Only a failed
//! metrics query fails the cycle, which the run loop logs and retries after
//! the error backoff.

use autoheal_cognition::baseline::BaselineEngine;
use autoheal_cognition::detector::AnomalyDetector;
use autoheal_cognition::forecaster::TrendForecaster;
use autoheal_cognition::rca::{RcaEngine, RcaRuleSet};
use autoheal_core::anomaly::Anomaly;
use autoheal_core::config::AppConfig;
use autoheal_core::normalize::DataNormalizer;
use autoheal_core::plan::{ActionPlan, PlanStatus};
use autoheal_core::ports::{LogFilter, Notifier, TelemetrySource};
use autoheal_core::types::{LogLevel, MetricSeries};
use autoheal_core::AutohealResult;
use autoheal_decision::planner::ActionPlanner;
use autoheal_decision::playbook::PlaybookLibrary;
use autoheal_decision::risk::RiskAssessor;
use autoheal_notify::NotificationManager;
use autoheal_remediation::{HandlerRegistry, RemediationExecutor};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Outcome of one detection cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub metrics_checked: usize,
    pub anomalies: usize,
    pub plans_created: usize,
    pub plans_executed: usize,
    pub notifications_sent: usize,
    pub predicted_breaches: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub cycles_run: u64,
    pub cycles_failed: u64,
    pub active_anomalies: usize,
    pub baselines_loaded: usize,
    pub last_baseline_update: Option<DateTime<Utc>>,
    pub in_flight_plans: Vec<String>,
    pub pending_approvals: usize,
    pub relearning: bool,
    pub dry_run: bool,
}

pub struct Orchestrator {
    config: AppConfig,
    telemetry: Arc<dyn TelemetrySource>,
    normalizer: DataNormalizer,
    baselines: Arc<BaselineEngine>,
    detector: AnomalyDetector,
    forecaster: TrendForecaster,
    rca: RcaEngine,
    planner: ActionPlanner,
    executor: RemediationExecutor,
    notifications: NotificationManager,
    cycles_run: AtomicU64,
    cycles_failed: AtomicU64,
    last_baseline_update: Arc<Mutex<Option<DateTime<Utc>>>>,
    relearn_running: Arc<AtomicBool>,
}

impl Orchestrator {
    /// Wires the engine around explicit collaborators. RCA rules and
    /// playbooks are read from the paths in `config`.
    pub fn new(
        config: AppConfig,
        telemetry: Arc<dyn TelemetrySource>,
        notifier: Arc<dyn Notifier>,
        handlers: HandlerRegistry,
    ) -> AutohealResult<Self> {
        let notifications =
            NotificationManager::new(notifier, config.notification.dedup_cooldown_seconds);
        Self::assemble(config, telemetry, notifications, handlers)
    }

    /// Built-in action handlers and the configured webhook notifier.
    pub fn from_config(config: AppConfig, telemetry: Arc<dyn TelemetrySource>) -> AutohealResult<Self> {
        let handlers = HandlerRegistry::with_builtin(std::time::Duration::from_secs(
            config.notification.timeout_seconds,
        ));
        let notifications = NotificationManager::from_config(&config.notification);
        Self::assemble(config, telemetry, notifications, handlers)
    }

    fn assemble(
        config: AppConfig,
        telemetry: Arc<dyn TelemetrySource>,
        notifications: NotificationManager,
        handlers: HandlerRegistry,
    ) -> AutohealResult<Self> {
        let rules = Arc::new(RcaRuleSet::load(config.rules_file.as_deref())?);
        let playbooks = Arc::new(match &config.playbooks_dir {
            Some(dir) => PlaybookLibrary::load_dir(dir)?,
            None => PlaybookLibrary::new(),
        });

        let baselines = Arc::new(BaselineEngine::new(config.baseline.clone()));
        let planner = ActionPlanner::new(
            &config.remediation,
            config.approval.clone(),
            RiskAssessor::new(config.risk.clone(), config.approval.clone()),
            playbooks,
        );

        info!(
            rules = rules.rules().len(),
            playbooks = planner.playbooks().len(),
            remediation_enabled = config.remediation.enabled,
            dry_run = config.remediation.dry_run,
            "Orchestrator initialized"
        );

        Ok(Self {
            telemetry,
            normalizer: DataNormalizer::default(),
            detector: AnomalyDetector::new(config.detection.clone(), baselines.clone()),
            forecaster: TrendForecaster::new(config.forecast.clone()),
            rca: RcaEngine::new(rules),
            planner,
            executor: RemediationExecutor::from_config(&config.remediation, handlers),
            notifications,
            baselines,
            cycles_run: AtomicU64::new(0),
            cycles_failed: AtomicU64::new(0),
            last_baseline_update: Arc::new(Mutex::new(None)),
            relearn_running: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    pub fn baselines(&self) -> &Arc<BaselineEngine> {
        &self.baselines
    }

    pub fn planner(&self) -> &ActionPlanner {
        &self.planner
    }

    pub fn executor(&self) -> &RemediationExecutor {
        &self.executor
    }

    pub fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }

    /// Runs cycles until `shutdown` flips to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.orchestrator.check_interval_seconds,
            "Orchestrator loop starting"
        );
        match self.relearn_now().await {
            Ok(count) => info!(count = count, "Initial baselines learned"),
            Err(e) => warn!(error = %e, "Initial baseline learning failed"),
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            let wait = match self.cycle(Some(&shutdown)).await {
                Ok(_) => {
                    self.maybe_relearn();
                    std::time::Duration::from_secs(self.config.orchestrator.check_interval_seconds)
                }
                Err(e) => {
                    self.cycles_failed.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("autoheal.cycles.failed").increment(1);
                    error!(error = %e, "Detection cycle failed");
                    std::time::Duration::from_secs(self.config.orchestrator.error_backoff_seconds)
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!(cycles = self.cycles_run.load(Ordering::Relaxed), "Orchestrator stopped");
    }

    /// One detection cycle, without a cancellation signal.
    pub async fn run_cycle(&self) -> AutohealResult<CycleReport> {
        self.cycle(None).await
    }

    async fn cycle(&self, cancel: Option<&watch::Receiver<bool>>) -> AutohealResult<CycleReport> {
        let now = Utc::now();
        let start = now - Duration::minutes(self.config.orchestrator.detection_window_minutes);
        let metrics: Vec<MetricSeries> = self
            .telemetry
            .query_metrics(start, now)
            .await?
            .into_iter()
            .map(|s| self.normalizer.normalize_series(s))
            .collect();

        self.cycles_run.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("autoheal.cycles.run").increment(1);

        let batch = self.detector.detect(&metrics, now);
        let mut report = CycleReport {
            metrics_checked: batch.total_metrics_checked,
            anomalies: batch.count(),
            ..Default::default()
        };
        if !batch.anomalies.is_empty() {
            report.notifications_sent += self.notifications.notify_anomaly_batch(&batch).await;
        }

        for anomaly in &batch.anomalies {
            if let Some(plan) = self.handle_anomaly(anomaly, &metrics, now, cancel).await {
                report.plans_created += 1;
                if plan.started_at.is_some() {
                    report.plans_executed += 1;
                }
            }
        }

        report.predicted_breaches = self.check_breaches(now).await;
        self.notifications.prune(now);

        info!(
            metrics_checked = report.metrics_checked,
            anomalies = report.anomalies,
            plans_created = report.plans_created,
            plans_executed = report.plans_executed,
            predicted_breaches = report.predicted_breaches,
            "Detection cycle complete"
        );
        Ok(report)
    }

    /// RCA, planning and, for auto-approved plans, execution for one
    /// anomaly. Returns the plan created this cycle, if any.
    async fn handle_anomaly(
        &self,
        anomaly: &Anomaly,
        metrics: &[MetricSeries],
        now: DateTime<Utc>,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> Option<ActionPlan> {
        if let Some(open) = self.planner.history().open_plan_for(&anomaly.id) {
            debug!(anomaly_id = %anomaly.id, plan_id = %open.id, "Anomaly already has an open plan");
            return None;
        }

        let rca = if self.config.rca.enabled {
            let lookback = now - Duration::minutes(self.config.rca.lookback_minutes);
            let filter = LogFilter {
                service: anomaly.labels.get("service").cloned(),
                min_level: Some(LogLevel::Warning),
                contains: None,
            };
            let logs = match self.telemetry.query_logs(lookback, now, &filter).await {
                Ok(logs) => self.normalizer.normalize_logs(logs),
                Err(e) => {
                    warn!(anomaly_id = %anomaly.id, error = %e, "Log query failed, analyzing without logs");
                    Vec::new()
                }
            };
            let events = match self.telemetry.query_events(lookback, now).await {
                Ok(events) => self.normalizer.normalize_events(events),
                Err(e) => {
                    warn!(anomaly_id = %anomaly.id, error = %e, "Event query failed, analyzing without events");
                    Vec::new()
                }
            };
            let related: Vec<MetricSeries> = metrics
                .iter()
                .filter(|s| s.metric_key() != anomaly.metric_key())
                .cloned()
                .collect();
            Some(self.rca.analyze(anomaly, &related, &logs, &events))
        } else {
            None
        };

        let plan = self.planner.create_plan(anomaly, rca.as_ref(), None)?;
        match plan.status {
            PlanStatus::WaitingApproval => {
                self.notifications.notify_approval_request(&plan).await;
                Some(plan)
            }
            PlanStatus::Approved => match self.execute(&plan.id, cancel).await {
                Ok(executed) => Some(executed),
                Err(e) => {
                    warn!(plan_id = %plan.id, error = %e, "Auto-approved plan not executed");
                    Some(plan)
                }
            },
            _ => {
                info!(plan_id = %plan.id, status = plan.status.as_str(), "Plan requires escalation");
                Some(plan)
            }
        }
    }

    /// Claims the approved plan, runs it and records the result. A plan
    /// another caller already claimed is refused before any dispatch.
    async fn execute(
        &self,
        plan_id: &str,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> AutohealResult<ActionPlan> {
        let plan = self.planner.claim_for_execution(plan_id)?;
        let executed = self.executor.execute_plan(plan, cancel).await;
        self.planner.record_result(&executed);
        if executed.started_at.is_some() {
            self.notifications.notify_remediation(&executed).await;
        }
        Ok(executed)
    }

    /// Records `approver`'s approval and executes the plan once it is
    /// fully approved. Approving a plan that is already executing returns
    /// it as stored.
    pub async fn approve_and_execute(&self, plan_id: &str, approver: &str) -> AutohealResult<ActionPlan> {
        let plan = self.planner.approve_plan(plan_id, approver)?;
        if plan.status != PlanStatus::Approved {
            return Ok(plan);
        }
        self.execute(plan_id, None).await
    }

    /// Forecasts each watched metric and notifies predicted crossings.
    async fn check_breaches(&self, now: DateTime<Utc>) -> usize {
        let watched = &self.config.orchestrator.breach_thresholds;
        if watched.is_empty() {
            return 0;
        }
        let start = now - Duration::hours(self.config.orchestrator.forecast_lookback_hours);
        let history = match self.telemetry.query_metrics(start, now).await {
            Ok(series) => series,
            Err(e) => {
                warn!(error = %e, "Forecast history query failed");
                return 0;
            }
        };

        let mut notified = 0;
        for series in history.into_iter().map(|s| self.normalizer.normalize_series(s)) {
            let Some(current) = series.latest_value() else {
                continue;
            };
            for rule in watched.iter().filter(|w| w.metric == series.name) {
                for &horizon in &self.config.orchestrator.prediction_horizons_hours {
                    let Some(prediction) = self.forecaster.predict(&series, horizon) else {
                        continue;
                    };
                    if prediction.will_breach_threshold(rule.threshold, rule.direction).is_none() {
                        continue;
                    }
                    if self
                        .notifications
                        .notify_prediction(&prediction, current, rule.threshold, rule.direction)
                        .await
                    {
                        notified += 1;
                    }
                    // nearest horizon is enough
                    break;
                }
            }
        }
        notified
    }

    /// Spawns a background re-learn when the learning interval has elapsed
    /// and none is running.
    pub fn maybe_relearn(&self) {
        let due = match *self.last_baseline_update.lock() {
            Some(last) => Utc::now() - last >= Duration::hours(self.config.baseline.learning_interval_hours as i64),
            None => true,
        };
        if !due || self.relearn_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let telemetry = self.telemetry.clone();
        let baselines = self.baselines.clone();
        let last_update = self.last_baseline_update.clone();
        let running = self.relearn_running.clone();
        let normalizer = self.normalizer.clone();
        let history_days = self.config.baseline.optimal_history_days;
        tokio::spawn(async move {
            match learn_baselines(telemetry.as_ref(), &baselines, &normalizer, history_days).await {
                Ok(count) => {
                    *last_update.lock() = Some(Utc::now());
                    info!(count = count, "Baselines re-learned");
                }
                Err(e) => warn!(error = %e, "Baseline re-learn failed"),
            }
            running.store(false, Ordering::SeqCst);
        });
    }

    /// Learns baselines in the foreground.
    pub async fn relearn_now(&self) -> AutohealResult<usize> {
        let count = learn_baselines(
            self.telemetry.as_ref(),
            &self.baselines,
            &self.normalizer,
            self.config.baseline.optimal_history_days,
        )
        .await?;
        *self.last_baseline_update.lock() = Some(Utc::now());
        Ok(count)
    }

    pub fn is_relearning(&self) -> bool {
        self.relearn_running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            cycles_run: self.cycles_run.load(Ordering::Relaxed),
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed),
            active_anomalies: self.detector.active_count(),
            baselines_loaded: self.baselines.len(),
            last_baseline_update: *self.last_baseline_update.lock(),
            in_flight_plans: self.executor.active_executions(),
            pending_approvals: self.planner.pending_approvals().len(),
            relearning: self.is_relearning(),
            dry_run: self.executor.is_dry_run(),
        }
    }
}

/// Queries `history_days` of metrics and learns every series that has
/// enough history. Series that are too short are skipped.
async fn learn_baselines(
    telemetry: &dyn TelemetrySource,
    baselines: &BaselineEngine,
    normalizer: &DataNormalizer,
    history_days: u32,
) -> AutohealResult<usize> {
    let end = Utc::now();
    let start = end - Duration::days(history_days as i64);
    let series = telemetry.query_metrics(start, end).await?;

    let mut learned = 0;
    for s in series.into_iter().map(|s| normalizer.normalize_series(s)) {
        match baselines.learn(&s) {
            Ok(_) => learned += 1,
            Err(e) if e.is_side_effect_free() => {
                debug!(metric = %s.metric_key(), reason = %e, "Baseline not learned")
            }
            Err(e) => warn!(metric = %s.metric_key(), error = %e, "Baseline learning failed"),
        }
    }
    Ok(learned)
}
