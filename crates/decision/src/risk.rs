//! Multi-factor risk scoring for a proposed remediation.
//!
//! Four factors in [0, 1] (severity, urgency, impact, complexity) are
//! combined with configurable weights; the aggregate is cut into a
//! [`RiskLevel`] that decides how many human approvals a plan needs.
//! Pure: the same inputs always produce the same assessment.

use autoheal_core::anomaly::{Anomaly, AnomalySeverity};
use autoheal_core::config::{ApprovalConfig, RiskConfig};
use autoheal_core::plan::{ActionType, RiskLevel};
use autoheal_core::types::MetricCategory;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub severity: f64,
    pub urgency: f64,
    pub impact: f64,
    pub complexity: f64,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub reasoning: Vec<String>,
}

/// Likelihood that the action itself fails or misbehaves.
pub fn action_complexity(action: ActionType) -> f64 {
    match action {
        ActionType::PodRestart => 0.2,
        ActionType::HpaScale => 0.3,
        ActionType::CacheFlush => 0.3,
        ActionType::CircuitBreaker => 0.4,
        ActionType::DeploymentRollback => 0.6,
        ActionType::ConfigRollback => 0.5,
        ActionType::TrafficShift => 0.6,
        ActionType::DatabaseFailover => 0.9,
        ActionType::CustomWebhook => 0.5,
    }
}

/// Blast radius of the action.
pub fn action_scope(action: ActionType) -> f64 {
    match action {
        ActionType::PodRestart => 0.3,
        ActionType::HpaScale => 0.4,
        ActionType::CacheFlush => 0.5,
        ActionType::CircuitBreaker => 0.6,
        ActionType::DeploymentRollback => 0.8,
        ActionType::ConfigRollback => 0.7,
        ActionType::TrafficShift => 0.7,
        ActionType::DatabaseFailover => 0.95,
        ActionType::CustomWebhook => 0.5,
    }
}

pub fn category_impact(category: MetricCategory) -> f64 {
    match category {
        MetricCategory::Trading | MetricCategory::Matching => 0.9,
        MetricCategory::Risk | MetricCategory::Wallet => 1.0,
        MetricCategory::Api => 0.7,
        MetricCategory::Infrastructure => 0.6,
        MetricCategory::Database => 0.8,
        MetricCategory::Queue => 0.7,
        MetricCategory::Business => 0.5,
    }
}

pub fn namespace_impact(namespace: &str) -> f64 {
    match namespace.to_lowercase().as_str() {
        "production" | "prod" => 1.0,
        "staging" => 0.6,
        "development" | "dev" => 0.3,
        _ => 0.7,
    }
}

fn severity_base(severity: AnomalySeverity) -> f64 {
    match severity {
        AnomalySeverity::Low => 0.2,
        AnomalySeverity::Medium => 0.4,
        AnomalySeverity::High => 0.7,
        AnomalySeverity::Critical => 0.95,
    }
}

/// Short-lived anomalies may heal themselves; long ones need action now.
pub fn urgency_for_duration(minutes: i64) -> f64 {
    match minutes {
        m if m < 2 => 0.3,
        m if m < 5 => 0.5,
        m if m < 15 => 0.7,
        m if m < 30 => 0.85,
        _ => 0.95,
    }
}

#[derive(Debug, Clone, Default)]
pub struct RiskAssessor {
    risk: RiskConfig,
    approval: ApprovalConfig,
}

impl RiskAssessor {
    pub fn new(risk: RiskConfig, approval: ApprovalConfig) -> Self {
        Self { risk, approval }
    }

    pub fn assess(&self, anomaly: &Anomaly, action: ActionType, namespace: &str) -> RiskAssessment {
        let sigma = anomaly.deviation_sigma.abs();
        let severity =
            0.7 * severity_base(anomaly.severity) + 0.3 * (sigma / 5.0).min(1.0);
        let urgency = urgency_for_duration(anomaly.duration_minutes);
        let impact = 0.4 * category_impact(anomaly.category)
            + 0.3 * namespace_impact(namespace)
            + 0.3 * action_scope(action);
        let complexity = action_complexity(action);

        let w = &self.risk.weights;
        let risk_score = (w.severity * severity
            + w.urgency * urgency
            + w.impact * impact
            + w.complexity * complexity)
            .clamp(0.0, 1.0);
        let risk_level = self.level_for_score(risk_score);

        let reasoning = vec![
            format!(
                "Severity: {severity:.2} (anomaly: {}, deviation: {sigma:.1}σ)",
                anomaly.severity.as_str()
            ),
            format!(
                "Urgency: {urgency:.2} (duration: {}min)",
                anomaly.duration_minutes
            ),
            format!(
                "Impact: {impact:.2} (action: {action}, category: {}, namespace: {namespace})",
                anomaly.category.as_str()
            ),
            format!("Complexity: {complexity:.2} (action: {action})"),
            format!("Risk: {risk_score:.2} -> {}", risk_level.as_str()),
        ];

        RiskAssessment {
            severity,
            urgency,
            impact,
            complexity,
            risk_score,
            risk_level,
            reasoning,
        }
    }

    pub fn level_for_score(&self, score: f64) -> RiskLevel {
        let t = &self.risk.thresholds;
        if score >= t.manual {
            RiskLevel::Critical
        } else if score >= t.semi_auto {
            RiskLevel::Manual
        } else if score >= t.auto {
            RiskLevel::SemiAuto
        } else {
            RiskLevel::Auto
        }
    }

    /// Approvals a plan at `level` needs. Critical plans are escalated into
    /// the manual tier, so they share its count.
    pub fn required_approvals(&self, level: RiskLevel) -> u32 {
        match level {
            RiskLevel::Auto => 0,
            RiskLevel::SemiAuto => self.approval.required_semi_auto,
            RiskLevel::Manual | RiskLevel::Critical => self.approval.required_manual,
        }
    }
}
