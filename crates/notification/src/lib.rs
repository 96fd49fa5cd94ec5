//! Operator notifications for anomalies, predicted breaches, remediation
//! outcomes and approval requests.

pub mod manager;
pub mod retry;
pub mod webhook;

pub use manager::NotificationManager;
pub use retry::RetryPolicy;
pub use webhook::WebhookNotifier;
