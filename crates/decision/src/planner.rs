//! Action planner and the plan approval state machine.
//!
//! ```text
//! pending ──escalate──▶ waiting_approval ──approve×N──▶ approved ──▶ executing ──▶ success | failed | rolled_back
//!                              └──reject / expired──▶ rejected
//! ```
//!
//! Auto-level plans start `approved`; semi_auto/manual plans start in
//! `waiting_approval`; critical plans stay `pending` until a human escalates
//! them. Approval expiry is detected lazily on the next `approve_plan` call.

use autoheal_cognition::rca::RcaResult;
use autoheal_core::anomaly::Anomaly;
use autoheal_core::config::{ApprovalConfig, RemediationConfig};
use autoheal_core::plan::{ActionPlan, ActionStep, ActionType, PlanStatus, RiskLevel};
use autoheal_core::{AutohealError, AutohealResult};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::playbook::{Playbook, PlaybookLibrary};
use crate::risk::RiskAssessor;

pub const EXPIRED_MESSAGE: &str = "Approval timeout expired";

/// Every plan the planner created, updated in place as it moves through
/// approval and execution.
#[derive(Default)]
pub struct PlanHistory {
    plans: DashMap<String, ActionPlan>,
}

impl PlanHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, plan: ActionPlan) {
        self.plans.insert(plan.id.clone(), plan);
    }

    pub fn get(&self, plan_id: &str) -> Option<ActionPlan> {
        self.plans.get(plan_id).map(|p| p.value().clone())
    }

    pub fn by_status(&self, status: PlanStatus) -> Vec<ActionPlan> {
        let mut plans: Vec<ActionPlan> = self
            .plans
            .iter()
            .filter(|p| p.status == status)
            .map(|p| p.value().clone())
            .collect();
        plans.sort_by_key(|p| p.created_at);
        plans
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<ActionPlan> {
        let mut plans: Vec<ActionPlan> = self.plans.iter().map(|p| p.value().clone()).collect();
        plans.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        plans.truncate(limit);
        plans
    }

    /// Share of executed plans created since `since` that ended in success.
    pub fn success_rate(&self, since: DateTime<Utc>) -> f64 {
        let (mut executed, mut succeeded) = (0usize, 0usize);
        for plan in self.plans.iter().filter(|p| p.created_at >= since) {
            match plan.status {
                PlanStatus::Success => {
                    executed += 1;
                    succeeded += 1;
                }
                PlanStatus::Failed | PlanStatus::RolledBack => executed += 1,
                _ => {}
            }
        }
        if executed == 0 {
            return 0.0;
        }
        succeeded as f64 / executed as f64
    }

    /// A plan for `anomaly_id` that has not reached a terminal state.
    pub fn open_plan_for(&self, anomaly_id: &str) -> Option<ActionPlan> {
        self.plans
            .iter()
            .find(|p| p.anomaly_id == anomaly_id && !p.status.is_terminal())
            .map(|p| p.value().clone())
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

pub struct ActionPlanner {
    remediation_enabled: bool,
    approval: ApprovalConfig,
    assessor: RiskAssessor,
    playbooks: Arc<PlaybookLibrary>,
    history: PlanHistory,
}

impl ActionPlanner {
    pub fn new(
        remediation: &RemediationConfig,
        approval: ApprovalConfig,
        assessor: RiskAssessor,
        playbooks: Arc<PlaybookLibrary>,
    ) -> Self {
        Self {
            remediation_enabled: remediation.enabled,
            approval,
            assessor,
            playbooks,
            history: PlanHistory::new(),
        }
    }

    pub fn history(&self) -> &PlanHistory {
        &self.history
    }

    pub fn playbooks(&self) -> &PlaybookLibrary {
        &self.playbooks
    }

    /// Builds a plan for `anomaly`. An explicit playbook wins, then the
    /// first matching playbook, then RCA suggestions. `None` when
    /// remediation is disabled or nothing yields a runnable step.
    pub fn create_plan(
        &self,
        anomaly: &Anomaly,
        rca: Option<&RcaResult>,
        playbook_id: Option<&str>,
    ) -> Option<ActionPlan> {
        if !self.remediation_enabled {
            debug!(anomaly_id = %anomaly.id, "Remediation disabled, no plan");
            return None;
        }

        let playbook = match playbook_id {
            Some(id) => {
                let found = self.playbooks.get(id);
                if found.is_none() {
                    warn!(playbook = %id, "Requested playbook not found");
                }
                found
            }
            None => self
                .playbooks
                .find_matching(&anomaly.metric_name, Some(anomaly.anomaly_type.as_str()), &[])
                .into_iter()
                .next(),
        };

        let plan = match playbook {
            Some(playbook) => self.plan_from_playbook(anomaly, &playbook, rca),
            None => match rca {
                Some(rca) if !rca.suggested_actions.is_empty() => self.plan_from_rca(anomaly, rca),
                _ => None,
            },
        };

        let Some(plan) = plan else {
            info!(anomaly_id = %anomaly.id, metric = %anomaly.metric_name, "No applicable remediation");
            return None;
        };

        metrics::counter!("autoheal.plans.created", "risk_level" => plan.risk_level.as_str()).increment(1);
        info!(
            plan_id = %plan.id,
            anomaly_id = %anomaly.id,
            playbook = plan.playbook_id.as_deref().unwrap_or("-"),
            risk_score = plan.risk_score,
            risk_level = plan.risk_level.as_str(),
            status = plan.status.as_str(),
            steps = plan.steps.len(),
            "Action plan created"
        );
        self.history.insert(plan.clone());
        Some(plan)
    }

    fn plan_from_playbook(
        &self,
        anomaly: &Anomaly,
        playbook: &Playbook,
        rca: Option<&RcaResult>,
    ) -> Option<ActionPlan> {
        let default_ns = anomaly.namespace().unwrap_or("default");
        let steps: Vec<ActionStep> = playbook
            .steps
            .iter()
            .map(|s| {
                let mut step = ActionStep::new(
                    s.action,
                    s.target.clone(),
                    s.namespace.clone().unwrap_or_else(|| default_ns.to_string()),
                )
                .with_parameters(s.parameters.clone());
                step.name = s.name.clone();
                step.can_rollback = s.rollback_on_failure;
                step.timeout_seconds = Some(s.timeout_seconds);
                step
            })
            .collect();

        let mut plan = self.assemble(anomaly, steps, rca, playbook.risk_override)?;
        plan.playbook_id = Some(playbook.id.clone());
        Some(plan)
    }

    fn plan_from_rca(&self, anomaly: &Anomaly, rca: &RcaResult) -> Option<ActionPlan> {
        let ns = anomaly.namespace().unwrap_or("default");
        let steps: Vec<ActionStep> = rca
            .suggested_actions
            .iter()
            .filter_map(|s| match s.action.parse::<ActionType>() {
                Ok(action) => Some(ActionStep::new(action, s.target.clone(), ns)),
                Err(_) => {
                    debug!(action = %s.action, rule = %s.from_rule, "Skipping unknown suggested action");
                    None
                }
            })
            .collect();
        self.assemble(anomaly, steps, Some(rca), None)
    }

    /// Scores the primary step and sets the initial lifecycle state.
    fn assemble(
        &self,
        anomaly: &Anomaly,
        steps: Vec<ActionStep>,
        rca: Option<&RcaResult>,
        risk_override: Option<f64>,
    ) -> Option<ActionPlan> {
        let primary = steps.first()?;
        let assessment = self.assessor.assess(anomaly, primary.action_type, &primary.namespace);
        let (risk_score, risk_level) = match risk_override {
            Some(score) => (score, self.assessor.level_for_score(score)),
            None => (assessment.risk_score, assessment.risk_level),
        };
        debug!(anomaly_id = %anomaly.id, reasoning = ?assessment.reasoning, "Risk assessed");

        let mut plan = ActionPlan::new(anomaly.id.clone(), anomaly.metric_name.clone());
        plan.root_cause = rca
            .and_then(|r| r.primary_root_cause())
            .unwrap_or_default()
            .to_string();
        plan.risk_score = risk_score;
        plan.risk_level = risk_level;
        plan.steps = steps;
        plan.approvals_required = self.assessor.required_approvals(risk_level);

        match risk_level {
            RiskLevel::Auto => plan.status = PlanStatus::Approved,
            RiskLevel::SemiAuto | RiskLevel::Manual => {
                plan.open_approval_window(plan.approvals_required, self.approval_timeout())
            }
            RiskLevel::Critical => plan.status = PlanStatus::Pending,
        }
        Some(plan)
    }

    fn approval_timeout(&self) -> Duration {
        Duration::minutes(self.approval.timeout_minutes)
    }

    /// Adds `approver`'s approval. A plan not waiting for approval is
    /// returned unchanged; a plan past its deadline is rejected instead.
    pub fn approve_plan(&self, plan_id: &str, approver: &str) -> AutohealResult<ActionPlan> {
        let mut plan = self
            .history
            .plans
            .get_mut(plan_id)
            .ok_or_else(|| AutohealError::NotFound(format!("plan {plan_id}")))?;

        if plan.status != PlanStatus::WaitingApproval {
            warn!(plan_id = %plan_id, status = plan.status.as_str(), "Plan is not waiting for approval");
            return Ok(plan.clone());
        }

        if plan.is_expired_at(Utc::now()) {
            plan.status = PlanStatus::Rejected;
            plan.error_message = Some(EXPIRED_MESSAGE.to_string());
            plan.completed_at = Some(Utc::now());
            metrics::counter!("autoheal.plans.rejected", "reason" => "expired").increment(1);
            warn!(plan_id = %plan_id, approver = %approver, "Approval window expired");
            return Ok(plan.clone());
        }

        let complete = plan.add_approval(approver);
        if complete {
            plan.status = PlanStatus::Approved;
            metrics::counter!("autoheal.plans.approved").increment(1);
        }
        info!(
            plan_id = %plan_id,
            approver = %approver,
            approvals = plan.approvals_received.len(),
            required = plan.approvals_required,
            approved = complete,
            "Plan approval added"
        );
        Ok(plan.clone())
    }

    /// Moves an approved plan to `executing` in the history and returns it
    /// still marked approved, ready for the executor. Only one caller can
    /// claim a given plan; every later claim fails until the execution
    /// result is recorded.
    pub fn claim_for_execution(&self, plan_id: &str) -> AutohealResult<ActionPlan> {
        let mut plan = self
            .history
            .plans
            .get_mut(plan_id)
            .ok_or_else(|| AutohealError::NotFound(format!("plan {plan_id}")))?;
        if plan.status != PlanStatus::Approved {
            return Err(AutohealError::Validation(format!(
                "plan {plan_id} is {}, only approved plans can be executed",
                plan.status.as_str()
            )));
        }
        let claimed = plan.clone();
        plan.status = PlanStatus::Executing;
        debug!(plan_id = %plan_id, "Plan claimed for execution");
        Ok(claimed)
    }

    /// Rejects a plan that is waiting for approval. Terminal.
    pub fn reject_plan(&self, plan_id: &str, rejector: &str, reason: &str) -> AutohealResult<ActionPlan> {
        let mut plan = self
            .history
            .plans
            .get_mut(plan_id)
            .ok_or_else(|| AutohealError::NotFound(format!("plan {plan_id}")))?;
        if plan.status != PlanStatus::WaitingApproval {
            return Err(AutohealError::Validation(format!(
                "plan {plan_id} is {}, only plans waiting for approval can be rejected",
                plan.status.as_str()
            )));
        }
        plan.reject(rejector, reason);
        metrics::counter!("autoheal.plans.rejected", "reason" => "operator").increment(1);
        info!(plan_id = %plan_id, rejector = %rejector, reason = %reason, "Plan rejected");
        Ok(plan.clone())
    }

    /// Moves a critical plan out of `pending` into the manual approval flow.
    pub fn escalate_plan(&self, plan_id: &str, escalated_by: &str) -> AutohealResult<ActionPlan> {
        let mut plan = self
            .history
            .plans
            .get_mut(plan_id)
            .ok_or_else(|| AutohealError::NotFound(format!("plan {plan_id}")))?;
        if plan.status != PlanStatus::Pending {
            return Err(AutohealError::Validation(format!(
                "plan {plan_id} is {}, only pending plans can be escalated",
                plan.status.as_str()
            )));
        }
        let required = self.assessor.required_approvals(RiskLevel::Manual);
        plan.open_approval_window(required, self.approval_timeout());
        info!(plan_id = %plan_id, by = %escalated_by, required = required, "Plan escalated for approval");
        Ok(plan.clone())
    }

    /// Stores the executor's final view of a plan.
    pub fn record_result(&self, plan: &ActionPlan) {
        metrics::counter!("autoheal.plans.completed", "status" => plan.status.as_str()).increment(1);
        self.history.insert(plan.clone());
    }

    pub fn get_plan(&self, plan_id: &str) -> Option<ActionPlan> {
        self.history.get(plan_id)
    }

    pub fn pending_approvals(&self) -> Vec<ActionPlan> {
        self.history.by_status(PlanStatus::WaitingApproval)
    }

    pub fn approved_plans(&self) -> Vec<ActionPlan> {
        self.history.by_status(PlanStatus::Approved)
    }

    pub fn plans_by_status(&self, status: PlanStatus) -> Vec<ActionPlan> {
        self.history.by_status(status)
    }

    pub fn recent_plans(&self, limit: usize) -> Vec<ActionPlan> {
        self.history.recent(limit)
    }

    pub fn success_rate(&self, since: DateTime<Utc>) -> f64 {
        self.history.success_rate(since)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::PlaybookStep;
    use autoheal_cognition::rca::SuggestedAction;
    use autoheal_core::anomaly::{AnomalySeverity, AnomalyType};
    use autoheal_core::config::RiskConfig;
    use autoheal_core::plan::Parameters;
    use autoheal_core::types::MetricCategory;

    fn anomaly(severity: AnomalySeverity, sigma: f64, namespace: &str) -> Anomaly {
        let now = Utc::now();
        Anomaly {
            id: "ANO-abcdef01".into(),
            detected_at: now,
            metric_name: "order_latency_ms".into(),
            category: MetricCategory::Trading,
            labels: [("namespace".to_string(), namespace.to_string())].into(),
            current_value: 95.0,
            expected_value: 40.0,
            expected_std: 5.0,
            deviation_sigma: sigma,
            deviation_percent: 137.5,
            anomaly_type: AnomalyType::Point,
            severity,
            scores: vec![],
            ensemble_score: 1.0,
            started_at: now,
            duration_minutes: 0,
            acknowledged_by: None,
        }
    }

    fn restart_playbook(risk_override: Option<f64>) -> Playbook {
        Playbook {
            id: "pb-restart".into(),
            name: "Restart".into(),
            description: String::new(),
            trigger_conditions: vec!["order_latency_ms".into()],
            steps: vec![PlaybookStep {
                name: "Restart pods".into(),
                action: ActionType::PodRestart,
                target: "trading-api".into(),
                namespace: None,
                parameters: Parameters::new(),
                timeout_seconds: 120,
                rollback_on_failure: false,
            }],
            tags: vec![],
            risk_override,
            enabled: true,
        }
    }

    fn planner_with(playbooks: Vec<Playbook>, approval: ApprovalConfig) -> ActionPlanner {
        ActionPlanner::new(
            &RemediationConfig::default(),
            approval.clone(),
            RiskAssessor::new(RiskConfig::default(), approval),
            Arc::new(PlaybookLibrary::from_playbooks(playbooks)),
        )
    }

    fn rca_with(actions: &[&str]) -> RcaResult {
        let mut rca = RcaResult::empty("ANO-abcdef01");
        rca.root_causes = vec!["Pool exhausted".into()];
        rca.suggested_actions = actions
            .iter()
            .enumerate()
            .map(|(i, a)| SuggestedAction {
                action: a.to_string(),
                target: "trading-api".into(),
                priority: i as u32 + 1,
                from_rule: "r1".into(),
                severity: AnomalySeverity::High,
            })
            .collect();
        rca
    }

    #[test]
    fn test_playbook_plan_requires_approval() {
        let planner = planner_with(vec![restart_playbook(None)], ApprovalConfig::default());
        let plan = planner
            .create_plan(&anomaly(AnomalySeverity::Critical, 11.0, "production"), None, None)
            .unwrap();

        assert_eq!(plan.playbook_id.as_deref(), Some("pb-restart"));
        assert_eq!(plan.risk_level, RiskLevel::Manual);
        assert!(plan.requires_approval);
        assert_eq!(plan.approvals_required, 2);
        assert_eq!(plan.status, PlanStatus::WaitingApproval);
        assert!(plan.approval_deadline.is_some());
        let step = &plan.steps[0];
        assert_eq!(step.namespace, "production");
        assert_eq!(step.name, "Restart pods");
        assert!(!step.can_rollback);
        assert_eq!(step.timeout_seconds, Some(120));
        assert!(plan.id.starts_with("PLAN-"));
        assert_eq!(planner.pending_approvals().len(), 1);
    }

    #[test]
    fn test_risk_override_levels() {
        let planner = planner_with(vec![restart_playbook(Some(0.1))], ApprovalConfig::default());
        let plan = planner
            .create_plan(&anomaly(AnomalySeverity::Critical, 11.0, "production"), None, None)
            .unwrap();
        assert_eq!(plan.risk_level, RiskLevel::Auto);
        assert_eq!(plan.status, PlanStatus::Approved);
        assert!(!plan.requires_approval);

        let planner = planner_with(vec![restart_playbook(Some(0.9))], ApprovalConfig::default());
        let plan = planner
            .create_plan(&anomaly(AnomalySeverity::Low, 0.5, "dev"), None, None)
            .unwrap();
        assert_eq!(plan.risk_level, RiskLevel::Critical);
        assert_eq!(plan.status, PlanStatus::Pending);

        let escalated = planner.escalate_plan(&plan.id, "sre-lead").unwrap();
        assert_eq!(escalated.status, PlanStatus::WaitingApproval);
        assert_eq!(escalated.approvals_required, 2);
        assert!(planner.escalate_plan(&plan.id, "sre-lead").is_err());
    }

    #[test]
    fn test_rca_synthesis_skips_unknown_actions() {
        let planner = planner_with(vec![], ApprovalConfig::default());
        let rca = rca_with(&["warp_drive", "hpa_scale", "cache_flush"]);
        let plan = planner
            .create_plan(&anomaly(AnomalySeverity::Medium, 3.0, "staging"), Some(&rca), None)
            .unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.primary_action(), Some(ActionType::HpaScale));
        assert_eq!(plan.root_cause, "Pool exhausted");
        assert_eq!(plan.steps[0].namespace, "staging");
        assert!(plan.playbook_id.is_none());

        let only_unknown = rca_with(&["warp_drive"]);
        assert!(planner
            .create_plan(&anomaly(AnomalySeverity::Medium, 3.0, "staging"), Some(&only_unknown), None)
            .is_none());
    }

    #[test]
    fn test_disabled_remediation_creates_nothing() {
        let mut remediation = RemediationConfig::default();
        remediation.enabled = false;
        let planner = ActionPlanner::new(
            &remediation,
            ApprovalConfig::default(),
            RiskAssessor::default(),
            Arc::new(PlaybookLibrary::from_playbooks(vec![restart_playbook(None)])),
        );
        assert!(planner
            .create_plan(&anomaly(AnomalySeverity::High, 4.0, "production"), None, None)
            .is_none());
        assert!(planner.history().is_empty());
    }

    #[test]
    fn test_approvals_accumulate_to_required_count() {
        let planner = planner_with(vec![restart_playbook(None)], ApprovalConfig::default());
        let plan = planner
            .create_plan(&anomaly(AnomalySeverity::Critical, 11.0, "production"), None, None)
            .unwrap();

        let after_one = planner.approve_plan(&plan.id, "alice").unwrap();
        assert_eq!(after_one.status, PlanStatus::WaitingApproval);
        // same approver twice does not count twice
        let again = planner.approve_plan(&plan.id, "alice").unwrap();
        assert_eq!(again.status, PlanStatus::WaitingApproval);
        assert_eq!(again.approvals_received.len(), 1);

        let approved = planner.approve_plan(&plan.id, "bob").unwrap();
        assert_eq!(approved.status, PlanStatus::Approved);
        assert_eq!(planner.approved_plans().len(), 1);

        // no-op once out of waiting_approval
        let unchanged = planner.approve_plan(&plan.id, "carol").unwrap();
        assert_eq!(unchanged.approvals_received, vec!["alice", "bob"]);
    }

    #[test]
    fn test_expired_approval_is_rejected_lazily() {
        let approval = ApprovalConfig {
            timeout_minutes: -1,
            ..ApprovalConfig::default()
        };
        let planner = planner_with(vec![restart_playbook(None)], approval);
        let plan = planner
            .create_plan(&anomaly(AnomalySeverity::Critical, 11.0, "production"), None, None)
            .unwrap();
        // still waiting until someone acts on it
        assert_eq!(planner.get_plan(&plan.id).unwrap().status, PlanStatus::WaitingApproval);

        let expired = planner.approve_plan(&plan.id, "alice").unwrap();
        assert_eq!(expired.status, PlanStatus::Rejected);
        assert_eq!(expired.error_message.as_deref(), Some(EXPIRED_MESSAGE));
    }

    #[test]
    fn test_reject_is_terminal() {
        let planner = planner_with(vec![restart_playbook(None)], ApprovalConfig::default());
        let plan = planner
            .create_plan(&anomaly(AnomalySeverity::Critical, 11.0, "production"), None, None)
            .unwrap();
        let rejected = planner.reject_plan(&plan.id, "bob", "too risky").unwrap();
        assert_eq!(rejected.status, PlanStatus::Rejected);
        assert_eq!(rejected.error_message.as_deref(), Some("Rejected by bob: too risky"));

        assert!(planner.reject_plan(&plan.id, "bob", "again").is_err());
        assert_eq!(planner.approve_plan(&plan.id, "alice").unwrap().status, PlanStatus::Rejected);
        assert!(matches!(
            planner.approve_plan("PLAN-missing", "alice"),
            Err(AutohealError::NotFound(_))
        ));
    }

    #[test]
    fn test_history_queries() {
        let planner = planner_with(vec![restart_playbook(Some(0.1))], ApprovalConfig::default());
        let a = anomaly(AnomalySeverity::High, 4.0, "production");
        let since = Utc::now() - Duration::minutes(1);

        let mut ok = planner.create_plan(&a, None, None).unwrap();
        ok.status = PlanStatus::Success;
        planner.record_result(&ok);
        let mut bad = planner.create_plan(&a, None, None).unwrap();
        bad.status = PlanStatus::RolledBack;
        planner.record_result(&bad);
        planner.create_plan(&a, None, None).unwrap();

        assert_eq!(planner.history().len(), 3);
        assert_eq!(planner.recent_plans(2).len(), 2);
        assert_eq!(planner.plans_by_status(PlanStatus::Success).len(), 1);
        assert!((planner.success_rate(since) - 0.5).abs() < 1e-9);
        assert_eq!(planner.success_rate(Utc::now() + Duration::minutes(1)), 0.0);
    }

    #[test]
    fn test_approved_plan_is_claimed_once() {
        let planner = planner_with(vec![restart_playbook(Some(0.1))], ApprovalConfig::default());
        let plan = planner
            .create_plan(&anomaly(AnomalySeverity::High, 4.0, "production"), None, None)
            .unwrap();
        assert_eq!(plan.status, PlanStatus::Approved);

        let claimed = planner.claim_for_execution(&plan.id).unwrap();
        assert_eq!(claimed.status, PlanStatus::Approved);
        assert_eq!(planner.get_plan(&plan.id).unwrap().status, PlanStatus::Executing);
        assert!(matches!(
            planner.claim_for_execution(&plan.id),
            Err(AutohealError::Validation(_))
        ));
        // still open, so the anomaly is not re-planned mid-execution
        assert!(planner.history().open_plan_for(&plan.anomaly_id).is_some());

        let mut done = claimed;
        done.status = PlanStatus::Success;
        planner.record_result(&done);
        assert!(planner.claim_for_execution(&plan.id).is_err());
        assert!(matches!(
            planner.claim_for_execution("PLAN-missing"),
            Err(AutohealError::NotFound(_))
        ));
    }
}
