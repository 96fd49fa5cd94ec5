//! Exponential backoff schedule for webhook delivery.

use autoheal_core::config::NotificationConfig;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total delivery attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &NotificationConfig) -> Self {
        Self {
            max_attempts: config.retry_attempts.max(1),
            initial_backoff_ms: config.retry_initial_backoff_ms,
            max_backoff_ms: config.retry_max_backoff_ms,
            ..Self::default()
        }
    }

    /// Wait before retry number `attempt` (0-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(base_ms.min(self.max_backoff_ms as f64) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        let waits: Vec<u128> = (0..5).map(|a| policy.backoff_for_attempt(a).as_millis()).collect();
        assert_eq!(waits, vec![1000, 2000, 4000, 8000, 10_000]);
    }

    #[test]
    fn test_from_config_keeps_one_attempt() {
        let policy = RetryPolicy::from_config(&NotificationConfig {
            retry_attempts: 0,
            ..Default::default()
        });
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.initial_backoff_ms, 1000);
    }

    #[test]
    fn test_configured_schedule_is_exact() {
        let policy = RetryPolicy::from_config(&NotificationConfig {
            retry_attempts: 4,
            retry_initial_backoff_ms: 200,
            retry_max_backoff_ms: 500,
            ..Default::default()
        });
        let waits: Vec<u128> = (0..4).map(|a| policy.backoff_for_attempt(a).as_millis()).collect();
        assert_eq!(waits, vec![200, 400, 500, 500]);
        // the same attempt always waits the same time
        assert_eq!(policy.backoff_for_attempt(1), policy.backoff_for_attempt(1));
    }
}
