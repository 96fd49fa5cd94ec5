//! Guarded execution of approved remediation plans.
//!
//! - [`guards`]: blacklist, per-target cooldown and in-flight plan cap
//! - [`audit`]: hash-chained record of every attempted side effect
//! - [`handlers`]: action-type handler registry and built-in bindings
//! - [`executor`]: step sequencing, timeouts, cancellation and rollback

pub mod audit;
pub mod executor;
pub mod guards;
pub mod handlers;

pub use audit::{AuditEntry, AuditRecord, AuditStatus, AuditTrail, ChainVerification};
pub use executor::RemediationExecutor;
pub use guards::{GuardRefusal, SafetyGuards};
pub use handlers::{HandlerRegistry, SimulatedHandler, WebhookHandler};
