//! Shared model for the autoheal engine: configuration, error taxonomy,
//! telemetry and plan types, and the collaborator traits the engine is
//! wired through.

pub mod anomaly;
pub mod config;
pub mod error;
pub mod normalize;
pub mod plan;
pub mod ports;
pub mod types;

pub use anomaly::{Anomaly, AnomalyBatch, AnomalySeverity, AnomalyType};
pub use config::AppConfig;
pub use error::{AutohealError, AutohealResult};
pub use plan::{ActionPlan, ActionStep, ActionType, Parameters, PlanStatus, RiskLevel, StepStatus};
pub use types::{MetricCategory, MetricSample, MetricSeries};
