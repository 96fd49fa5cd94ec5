//! Remediation decisions: risk scoring, the playbook library and the
//! action-plan approval state machine.

pub mod planner;
pub mod playbook;
pub mod risk;

pub use planner::{ActionPlanner, PlanHistory};
pub use playbook::{Playbook, PlaybookLibrary, PlaybookStep};
pub use risk::{RiskAssessment, RiskAssessor};
