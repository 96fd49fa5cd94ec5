//! The autoheal control loop.

pub mod orchestrator;

pub use orchestrator::{CycleReport, Orchestrator, OrchestratorStatus};
