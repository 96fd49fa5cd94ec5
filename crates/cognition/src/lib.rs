//! Statistical cognition for the autoheal loop: baselines, forecasts,
//! anomaly detection and rule-based root-cause analysis.

pub mod baseline;
pub mod detector;
pub mod forecaster;
pub mod rca;
pub mod stats;

pub use baseline::{Baseline, BaselineEngine};
pub use detector::AnomalyDetector;
pub use forecaster::{PredictedPoint, TrendForecaster, TrendPrediction};
pub use rca::{RcaEngine, RcaResult, RcaRuleSet, SuggestedAction};
