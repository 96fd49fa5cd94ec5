//! Action plans and their steps.
//!
//! A plan owns its ordered steps by value. The lifecycle is
//! `pending -> {waiting_approval | approved | rejected} -> executing ->
//! {success | failed} -> [rolled_back]`; the planner drives the approval
//! half and the executor the execution half.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::AutohealError;

pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// Closed set of remediation actions the engine knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    PodRestart,
    HpaScale,
    DeploymentRollback,
    ConfigRollback,
    CacheFlush,
    CircuitBreaker,
    TrafficShift,
    DatabaseFailover,
    CustomWebhook,
}

impl ActionType {
    pub const ALL: [ActionType; 9] = [
        ActionType::PodRestart,
        ActionType::HpaScale,
        ActionType::DeploymentRollback,
        ActionType::ConfigRollback,
        ActionType::CacheFlush,
        ActionType::CircuitBreaker,
        ActionType::TrafficShift,
        ActionType::DatabaseFailover,
        ActionType::CustomWebhook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::PodRestart => "pod_restart",
            ActionType::HpaScale => "hpa_scale",
            ActionType::DeploymentRollback => "deployment_rollback",
            ActionType::ConfigRollback => "config_rollback",
            ActionType::CacheFlush => "cache_flush",
            ActionType::CircuitBreaker => "circuit_breaker",
            ActionType::TrafficShift => "traffic_shift",
            ActionType::DatabaseFailover => "database_failover",
            ActionType::CustomWebhook => "custom_webhook",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = AutohealError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionType::ALL
            .iter()
            .find(|a| a.as_str() == s)
            .copied()
            .ok_or_else(|| AutohealError::Validation(format!("unknown action type: {s}")))
    }
}

/// Discrete automation tier derived from the aggregate risk score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Auto,
    SemiAuto,
    Manual,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Auto => "auto",
            RiskLevel::SemiAuto => "semi_auto",
            RiskLevel::Manual => "manual",
            RiskLevel::Critical => "critical",
        }
    }

    /// Levels that go through the approval flow. Critical escalates instead.
    pub fn requires_approval(&self) -> bool {
        matches!(self, RiskLevel::SemiAuto | RiskLevel::Manual)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    WaitingApproval,
    Approved,
    Rejected,
    Executing,
    Success,
    Failed,
    RolledBack,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Pending => "pending",
            PlanStatus::WaitingApproval => "waiting_approval",
            PlanStatus::Approved => "approved",
            PlanStatus::Rejected => "rejected",
            PlanStatus::Executing => "executing",
            PlanStatus::Success => "success",
            PlanStatus::Failed => "failed",
            PlanStatus::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanStatus::Rejected | PlanStatus::Success | PlanStatus::Failed | PlanStatus::RolledBack
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Executing,
    Success,
    Failed,
    /// Refused by a safety guard; no side effect was issued.
    Rejected,
    RolledBack,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Executing => "executing",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Rejected => "rejected",
            StepStatus::RolledBack => "rolled_back",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionStep {
    pub id: String,
    pub name: String,
    pub action_type: ActionType,
    pub target: String,
    pub namespace: String,
    #[serde(default)]
    pub parameters: Parameters,
    pub status: StepStatus,
    pub can_rollback: bool,
    /// Overrides the executor's default per-call timeout.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Opaque pre-mutation snapshot used to compensate this step.
    #[serde(default)]
    pub rollback_data: Parameters,
    #[serde(default)]
    pub state_before: Parameters,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl ActionStep {
    pub fn new(action_type: ActionType, target: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            id: new_step_id(),
            name: action_type.as_str().to_string(),
            action_type,
            target: target.into(),
            namespace: namespace.into(),
            parameters: Parameters::new(),
            status: StepStatus::Pending,
            can_rollback: true,
            timeout_seconds: None,
            rollback_data: Parameters::new(),
            state_before: Parameters::new(),
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn mark_started(&mut self) {
        self.status = StepStatus::Executing;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_succeeded(&mut self, state_before: Parameters, rollback_data: Parameters) {
        self.status = StepStatus::Success;
        self.state_before = state_before;
        self.rollback_data = rollback_data;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.error_message = Some(error.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_rejected(&mut self, reason: impl Into<String>) {
        self.status = StepStatus::Rejected;
        self.error_message = Some(reason.into());
    }

    pub fn mark_rolled_back(&mut self) {
        self.status = StepStatus::RolledBack;
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionPlan {
    pub id: String,
    pub anomaly_id: String,
    pub anomaly_metric: String,
    pub root_cause: String,
    #[serde(default)]
    pub playbook_id: Option<String>,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub steps: Vec<ActionStep>,
    pub requires_approval: bool,
    pub approvals_required: u32,
    #[serde(default)]
    pub approvals_received: Vec<String>,
    pub approval_deadline: Option<DateTime<Utc>>,
    pub status: PlanStatus,
    pub error_message: Option<String>,
    #[serde(default)]
    pub summary: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ActionPlan {
    pub fn new(anomaly_id: impl Into<String>, anomaly_metric: impl Into<String>) -> Self {
        Self {
            id: new_plan_id(),
            anomaly_id: anomaly_id.into(),
            anomaly_metric: anomaly_metric.into(),
            root_cause: String::new(),
            playbook_id: None,
            risk_score: 0.0,
            risk_level: RiskLevel::Auto,
            steps: Vec::new(),
            requires_approval: false,
            approvals_required: 0,
            approvals_received: Vec::new(),
            approval_deadline: None,
            status: PlanStatus::Pending,
            error_message: None,
            summary: String::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.approval_deadline.map(|d| now > d).unwrap_or(false)
    }

    pub fn has_required_approvals(&self) -> bool {
        self.approvals_received.len() as u32 >= self.approvals_required
    }

    /// Records an approver once. Returns whether the requirement is now met.
    pub fn add_approval(&mut self, approver: &str) -> bool {
        if !self.approvals_received.iter().any(|a| a == approver) {
            self.approvals_received.push(approver.to_string());
        }
        self.has_required_approvals()
    }

    pub fn open_approval_window(&mut self, approvals_required: u32, timeout: Duration) {
        self.requires_approval = true;
        self.approvals_required = approvals_required;
        self.approval_deadline = Some(Utc::now() + timeout);
        self.status = PlanStatus::WaitingApproval;
    }

    pub fn reject(&mut self, rejector: &str, reason: &str) {
        self.status = PlanStatus::Rejected;
        self.error_message = Some(format!("Rejected by {rejector}: {reason}"));
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_started(&mut self) {
        self.status = PlanStatus::Executing;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, status: PlanStatus, summary: String) {
        self.status = status;
        self.summary = summary;
        self.completed_at = Some(Utc::now());
    }

    pub fn primary_action(&self) -> Option<ActionType> {
        self.steps.first().map(|s| s.action_type)
    }

    pub fn count_steps(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    pub fn execution_summary(&self) -> String {
        format!(
            "Executed {}/{} steps successfully. Failed: {}. Rolled back: {}.",
            self.count_steps(StepStatus::Success),
            self.steps.len(),
            self.count_steps(StepStatus::Failed),
            self.count_steps(StepStatus::RolledBack),
        )
    }

    /// Multi-line human-readable report of the plan and each step.
    pub fn report(&self) -> String {
        let mut lines = vec![
            format!("Plan ID: {}", self.id),
            format!(
                "Risk Level: {} (score: {:.2})",
                self.risk_level.as_str(),
                self.risk_score
            ),
            format!("Status: {}", self.status.as_str()),
            format!("Steps: {}", self.steps.len()),
        ];
        for (i, step) in self.steps.iter().enumerate() {
            lines.push(format!(
                "  {}. [{}] {} on {}/{}",
                i + 1,
                step.status.as_str(),
                step.action_type,
                step.namespace,
                step.target
            ));
            if let Some(err) = &step.error_message {
                lines.push(format!("      Error: {err}"));
            }
        }
        lines.join("\n")
    }
}

pub fn new_plan_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("PLAN-{}", &raw[..8])
}

pub fn new_step_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("STEP-{}", &raw[..6])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_type_parse() {
        assert_eq!("hpa_scale".parse::<ActionType>().unwrap(), ActionType::HpaScale);
        assert!("reboot_datacenter".parse::<ActionType>().is_err());
        for action in ActionType::ALL {
            assert_eq!(action.as_str().parse::<ActionType>().unwrap(), action);
        }
    }

    #[test]
    fn test_add_approval_is_idempotent() {
        let mut plan = ActionPlan::new("ANO-1", "cpu");
        plan.open_approval_window(2, Duration::minutes(30));
        assert!(!plan.add_approval("alice"));
        assert!(!plan.add_approval("alice"));
        assert_eq!(plan.approvals_received.len(), 1);
        assert!(plan.add_approval("bob"));
    }

    #[test]
    fn test_expiry() {
        let mut plan = ActionPlan::new("ANO-1", "cpu");
        assert!(!plan.is_expired_at(Utc::now()));
        plan.open_approval_window(1, Duration::minutes(-1));
        assert!(plan.is_expired_at(Utc::now()));
    }

    #[test]
    fn test_execution_summary() {
        let mut plan = ActionPlan::new("ANO-1", "cpu");
        let mut ok = ActionStep::new(ActionType::PodRestart, "api", "prod");
        ok.mark_succeeded(Parameters::new(), Parameters::new());
        let mut bad = ActionStep::new(ActionType::HpaScale, "api", "prod");
        bad.mark_failed("boom");
        plan.steps = vec![ok, bad];
        assert_eq!(
            plan.execution_summary(),
            "Executed 1/2 steps successfully. Failed: 1. Rolled back: 0."
        );
        assert!(plan.report().contains("Error: boom"));
    }

    #[test]
    fn test_ids() {
        assert!(new_plan_id().starts_with("PLAN-"));
        assert_eq!(new_step_id().len(), 11);
    }
}
