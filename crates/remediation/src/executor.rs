//! Remediation executor.
//!
//! Runs an approved plan step by step through the handler registry:
//! blacklist and cooldown gates, audited dispatch under a per-step timeout,
//! and on the first failure a reverse-order compensation of the steps that
//! already succeeded. A step refused by a guard is recorded as rejected and
//! the plan moves on without compensating anything. The plan's final
//! status is tallied from what each step actually ended as.

use crate::audit::{AuditEntry, AuditStatus, AuditTrail};
use crate::guards::{GuardRefusal, SafetyGuards};
use crate::handlers::HandlerRegistry;
use autoheal_core::config::RemediationConfig;
use autoheal_core::plan::{ActionPlan, ActionStep, PlanStatus, StepStatus};
use autoheal_core::ports::ActionOutcome;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const CANCELLED_MESSAGE: &str = "Execution cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepResult {
    Succeeded,
    Rejected,
    Failed,
}

pub struct RemediationExecutor {
    config: RemediationConfig,
    guards: SafetyGuards,
    handlers: HandlerRegistry,
    audit: Arc<AuditTrail>,
}

impl RemediationExecutor {
    pub fn new(config: RemediationConfig, handlers: HandlerRegistry, audit: Arc<AuditTrail>) -> Self {
        Self {
            guards: SafetyGuards::new(&config),
            config,
            handlers,
            audit,
        }
    }

    /// Audit trail mirrored to `audit_log_file` when one is configured.
    pub fn from_config(config: &RemediationConfig, handlers: HandlerRegistry) -> Self {
        let audit = match &config.audit_log_file {
            Some(path) => AuditTrail::with_log_file(path),
            None => AuditTrail::new(),
        };
        Self::new(config.clone(), handlers, Arc::new(audit))
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_dry_run(&self) -> bool {
        self.config.dry_run
    }

    pub fn audit(&self) -> &Arc<AuditTrail> {
        &self.audit
    }

    pub fn guards(&self) -> &SafetyGuards {
        &self.guards
    }

    /// Ids of plans currently executing.
    pub fn active_executions(&self) -> Vec<String> {
        self.guards.in_flight()
    }

    /// Executes `plan` and returns it with step and plan outcomes filled in.
    ///
    /// Refusals (disabled, not approved, already running, concurrency cap)
    /// return the plan untouched apart from `error_message`. `cancel` is
    /// polled between steps; a raised flag stops the plan and compensates
    /// what ran.
    pub async fn execute_plan(
        &self,
        mut plan: ActionPlan,
        cancel: Option<&watch::Receiver<bool>>,
    ) -> ActionPlan {
        if !self.config.enabled {
            plan.error_message = Some("Remediation is disabled".to_string());
            return plan;
        }
        if plan.status != PlanStatus::Approved {
            warn!(plan_id = %plan.id, status = plan.status.as_str(), "Refusing to execute unapproved plan");
            metrics::counter!("autoheal.guard.refusals", "reason" => "not_approved").increment(1);
            plan.error_message = Some(format!(
                "Plan is not approved (status: {})",
                plan.status.as_str()
            ));
            return plan;
        }
        let _permit = match self.guards.try_admit(&plan.id) {
            Ok(permit) => permit,
            Err(refusal) => {
                warn!(plan_id = %plan.id, reason = %refusal, "Plan execution refused");
                metrics::counter!("autoheal.guard.refusals", "reason" => refusal.reason()).increment(1);
                plan.error_message = Some(refusal.to_string());
                return plan;
            }
        };

        plan.mark_started();
        info!(
            plan_id = %plan.id,
            steps = plan.steps.len(),
            dry_run = self.config.dry_run,
            "Starting plan execution"
        );

        if self.config.dry_run {
            for step in plan.steps.iter_mut() {
                info!(step_id = %step.id, action = %step.action_type, target = %step.target, "Dry run: would execute step");
                step.mark_started();
                step.mark_succeeded(Default::default(), Default::default());
            }
            let summary = plan.execution_summary();
            plan.mark_completed(PlanStatus::Success, summary);
            return plan;
        }

        let mut acted_on = HashSet::new();
        let mut halted = false;
        let mut rejected = false;
        let mut cancelled = false;
        for idx in 0..plan.steps.len() {
            if cancel.is_some_and(|rx| *rx.borrow()) {
                cancelled = true;
                break;
            }
            let step = &mut plan.steps[idx];
            match self.run_step(&plan.id, &plan.anomaly_id, step, &mut acted_on).await {
                StepResult::Succeeded => {}
                StepResult::Rejected => rejected = true,
                StepResult::Failed => {
                    halted = true;
                    break;
                }
            }
        }

        if halted || cancelled {
            self.rollback_plan(&mut plan).await;
        }

        let status = if cancelled {
            PlanStatus::Failed
        } else if halted && plan.count_steps(StepStatus::RolledBack) > 0 {
            PlanStatus::RolledBack
        } else if halted || rejected {
            PlanStatus::Failed
        } else {
            PlanStatus::Success
        };
        let summary = plan.execution_summary();
        plan.mark_completed(status, summary);
        if cancelled {
            plan.error_message = Some(CANCELLED_MESSAGE.to_string());
        } else if halted || rejected {
            plan.error_message = plan
                .steps
                .iter()
                .find(|s| matches!(s.status, StepStatus::Failed | StepStatus::Rejected))
                .and_then(|s| s.error_message.clone());
        }

        metrics::counter!("autoheal.plans.executed", "status" => status.as_str()).increment(1);
        info!(
            plan_id = %plan.id,
            status = status.as_str(),
            summary = %plan.summary,
            "Plan execution finished"
        );
        plan
    }

    /// Targets in `acted_on` were already touched by this plan and skip the
    /// cooldown. Any other target is claimed before dispatch and handed back
    /// if the step fails.
    async fn run_step(
        &self,
        plan_id: &str,
        anomaly_id: &str,
        step: &mut ActionStep,
        acted_on: &mut HashSet<String>,
    ) -> StepResult {
        if let Err(refusal) = self.guards.check_blacklist(&step.target, &step.namespace) {
            self.reject_step(plan_id, anomaly_id, step, refusal);
            return StepResult::Rejected;
        }
        let claim = if acted_on.contains(&step.target) {
            None
        } else {
            match self.guards.claim_target(&step.target, Utc::now()) {
                Ok(previous) => Some(previous),
                Err(refusal) => {
                    self.reject_step(plan_id, anomaly_id, step, refusal);
                    return StepResult::Rejected;
                }
            }
        };

        self.audit
            .record(AuditEntry::for_step(plan_id, anomaly_id, step, AuditStatus::Started));
        step.mark_started();

        let error = match self.dispatch(step).await {
            Ok(outcome) if outcome.success => {
                let state_before = outcome.state_before.clone();
                step.mark_succeeded(outcome.state_before, outcome.rollback_data);
                self.guards.record_action(&step.target, Utc::now());
                acted_on.insert(step.target.clone());
                self.audit.record(
                    AuditEntry::for_step(plan_id, anomaly_id, step, AuditStatus::Success)
                        .with_duration(step.duration_seconds())
                        .with_state_before(state_before),
                );
                metrics::counter!("autoheal.steps.executed", "action" => step.action_type.as_str()).increment(1);
                debug!(step_id = %step.id, target = %step.target, "Step succeeded");
                return StepResult::Succeeded;
            }
            Ok(outcome) => outcome.error.unwrap_or_else(|| "Unknown error".to_string()),
            Err(message) => message,
        };

        if let Some(previous) = claim {
            self.guards.release_target(&step.target, previous);
        }
        self.fail_step(plan_id, anomaly_id, step, error);
        StepResult::Failed
    }

    async fn dispatch(&self, step: &ActionStep) -> Result<ActionOutcome, String> {
        let Some(handler) = self.handlers.get(step.action_type) else {
            return Err(format!("No handler for action type: {}", step.action_type));
        };
        let secs = step
            .timeout_seconds
            .or_else(|| step.parameters.get("timeout_seconds").and_then(Value::as_u64))
            .unwrap_or(self.config.step_timeout_seconds);

        let call = handler.execute(&step.target, &step.namespace, &step.parameters);
        match tokio::time::timeout(Duration::from_secs(secs), call).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("Step timed out after {secs}s")),
        }
    }

    fn reject_step(&self, plan_id: &str, anomaly_id: &str, step: &mut ActionStep, refusal: GuardRefusal) {
        warn!(step_id = %step.id, target = %step.target, reason = %refusal, "Step rejected by safety guard");
        metrics::counter!("autoheal.guard.refusals", "reason" => refusal.reason()).increment(1);
        let message = refusal.to_string();
        step.mark_rejected(message.clone());
        self.audit.record(
            AuditEntry::for_step(plan_id, anomaly_id, step, AuditStatus::Rejected).with_error(message),
        );
    }

    fn fail_step(&self, plan_id: &str, anomaly_id: &str, step: &mut ActionStep, message: String) {
        error!(step_id = %step.id, target = %step.target, error = %message, "Step failed");
        metrics::counter!("autoheal.steps.failed", "action" => step.action_type.as_str()).increment(1);
        step.mark_failed(message.clone());
        self.audit.record(
            AuditEntry::for_step(plan_id, anomaly_id, step, AuditStatus::Failed)
                .with_duration(step.duration_seconds())
                .with_error(message),
        );
    }

    /// Compensates succeeded steps, newest first. Failures are logged and
    /// audited but never raised.
    async fn rollback_plan(&self, plan: &mut ActionPlan) {
        info!(plan_id = %plan.id, "Rolling back plan");
        for step in plan.steps.iter_mut().rev() {
            if step.status != StepStatus::Success || !step.can_rollback {
                continue;
            }
            let Some(handler) = self.handlers.get(step.action_type) else {
                continue;
            };
            if !handler.supports_rollback() {
                debug!(step_id = %step.id, action = %step.action_type, "No compensation for action");
                continue;
            }

            self.audit.record(
                AuditEntry::for_step(&plan.id, &plan.anomaly_id, step, AuditStatus::Started).rollback(),
            );
            let secs = step.timeout_seconds.unwrap_or(self.config.step_timeout_seconds);
            let call = handler.rollback(&step.target, &step.namespace, &step.rollback_data);
            let error = match tokio::time::timeout(Duration::from_secs(secs), call).await {
                Ok(Ok(outcome)) if outcome.success => None,
                Ok(Ok(outcome)) => Some(outcome.error.unwrap_or_else(|| "Unknown error".to_string())),
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!("Rollback timed out after {secs}s")),
            };

            match error {
                None => {
                    step.mark_rolled_back();
                    metrics::counter!("autoheal.steps.rolled_back").increment(1);
                    self.audit.record(
                        AuditEntry::for_step(&plan.id, &plan.anomaly_id, step, AuditStatus::Success)
                            .rollback(),
                    );
                }
                Some(message) => {
                    error!(step_id = %step.id, error = %message, "Rollback failed");
                    self.audit.record(
                        AuditEntry::for_step(&plan.id, &plan.anomaly_id, step, AuditStatus::Failed)
                            .rollback()
                            .with_error(message),
                    );
                }
            }
        }
    }
}
