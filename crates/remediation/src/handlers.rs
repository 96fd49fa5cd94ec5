//! Action handlers: the registry the executor dispatches through and the
//! built-in bindings.

use async_trait::async_trait;
use autoheal_core::plan::{ActionType, Parameters};
use autoheal_core::ports::{ActionHandler, ActionOutcome, RollbackOutcome};
use autoheal_core::AutohealResult;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// `ActionType` → handler. Action types with no entry fail at dispatch.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<ActionType, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated handlers for every platform action plus the webhook caller.
    pub fn with_builtin(webhook_timeout: Duration) -> Self {
        let mut registry = Self::new();
        for action in ActionType::ALL {
            if action != ActionType::CustomWebhook {
                registry.register(action, Arc::new(SimulatedHandler::new(action)));
            }
        }
        registry.register(
            ActionType::CustomWebhook,
            Arc::new(WebhookHandler::new(webhook_timeout)),
        );
        registry
    }

    pub fn register(&mut self, action: ActionType, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(action, handler);
    }

    pub fn get(&self, action: ActionType) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(&action).cloned()
    }

    pub fn registered(&self) -> Vec<ActionType> {
        let mut out: Vec<ActionType> = self.handlers.keys().copied().collect();
        out.sort_by_key(|a| a.as_str());
        out
    }
}

/// Logs the mutation it would apply and reports synthetic before-state.
/// Stands in for platform bindings that are not wired into this process.
pub struct SimulatedHandler {
    action: ActionType,
}

impl SimulatedHandler {
    pub fn new(action: ActionType) -> Self {
        Self { action }
    }

    fn rollback_data(&self, parameters: &Parameters) -> Parameters {
        let mut data = Parameters::new();
        match self.action {
            ActionType::DeploymentRollback => {
                let previous = match parameters.get("revision").and_then(Value::as_i64) {
                    Some(rev) => json!(rev + 1),
                    None => json!("current"),
                };
                data.insert("previous_revision".into(), previous);
            }
            ActionType::HpaScale => {
                let replicas = parameters
                    .get("previous_replicas")
                    .cloned()
                    .unwrap_or_else(|| json!(1));
                data.insert("previous_replicas".into(), replicas);
            }
            ActionType::ConfigRollback => {
                data.insert("previous_config".into(), json!("current"));
            }
            ActionType::CircuitBreaker | ActionType::TrafficShift => {
                data.insert("previous_state".into(), json!("closed"));
            }
            _ => {}
        }
        data
    }
}

#[async_trait]
impl ActionHandler for SimulatedHandler {
    async fn execute(
        &self,
        target: &str,
        namespace: &str,
        parameters: &Parameters,
    ) -> AutohealResult<ActionOutcome> {
        info!(
            action = %self.action,
            target = %target,
            namespace = %namespace,
            "Simulated platform mutation"
        );
        let mut state_before = Parameters::new();
        state_before.insert("target".into(), json!(target));
        state_before.insert("namespace".into(), json!(namespace));
        state_before.insert("action".into(), json!(self.action.as_str()));
        Ok(ActionOutcome::succeeded(
            state_before,
            self.rollback_data(parameters),
        ))
    }

    fn supports_rollback(&self) -> bool {
        !matches!(
            self.action,
            ActionType::PodRestart
                | ActionType::CacheFlush
                | ActionType::DatabaseFailover
                | ActionType::CustomWebhook
        )
    }

    async fn rollback(
        &self,
        target: &str,
        namespace: &str,
        rollback_data: &Parameters,
    ) -> AutohealResult<RollbackOutcome> {
        if self.action == ActionType::DeploymentRollback {
            let Some(revision) = rollback_data.get("previous_revision") else {
                return Ok(RollbackOutcome::failed("missing previous_revision"));
            };
            info!(target = %target, namespace = %namespace, revision = %revision, "Simulated redeploy of previous revision");
            return Ok(RollbackOutcome::succeeded());
        }
        info!(action = %self.action, target = %target, namespace = %namespace, "Simulated compensation");
        Ok(RollbackOutcome::succeeded())
    }
}

/// POSTs the step parameters as JSON to `parameters.url`.
pub struct WebhookHandler {
    client: reqwest::Client,
}

impl WebhookHandler {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl ActionHandler for WebhookHandler {
    async fn execute(
        &self,
        target: &str,
        _namespace: &str,
        parameters: &Parameters,
    ) -> AutohealResult<ActionOutcome> {
        let Some(url) = parameters.get("url").and_then(Value::as_str) else {
            return Ok(ActionOutcome::failed("Webhook step has no url parameter"));
        };

        match self.client.post(url).json(parameters).send().await {
            Ok(resp) if resp.status().is_success() => {
                let mut state_before = Parameters::new();
                state_before.insert("url".into(), json!(url));
                Ok(ActionOutcome::succeeded(state_before, Parameters::new()))
            }
            Ok(resp) => Ok(ActionOutcome::failed(format!(
                "Webhook returned status {}",
                resp.status()
            ))),
            Err(e) => {
                warn!(target = %target, url = %url, error = %e, "Webhook call failed");
                Ok(ActionOutcome::failed(format!("Webhook request failed: {e}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_covers_every_action() {
        let registry = HandlerRegistry::with_builtin(Duration::from_secs(5));
        assert_eq!(registry.registered().len(), ActionType::ALL.len());
        assert!(!registry.get(ActionType::CustomWebhook).unwrap().supports_rollback());
        assert!(registry.get(ActionType::HpaScale).unwrap().supports_rollback());
        assert!(HandlerRegistry::new().get(ActionType::PodRestart).is_none());
    }

    #[tokio::test]
    async fn test_simulated_deployment_rollback_round_trip() {
        let handler = SimulatedHandler::new(ActionType::DeploymentRollback);
        let mut params = Parameters::new();
        params.insert("revision".into(), json!(41));

        let outcome = handler.execute("trading-api", "production", &params).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.rollback_data["previous_revision"], 42);
        assert_eq!(outcome.state_before["target"], "trading-api");

        let undo = handler
            .rollback("trading-api", "production", &outcome.rollback_data)
            .await
            .unwrap();
        assert!(undo.success);
        let missing = handler
            .rollback("trading-api", "production", &Parameters::new())
            .await
            .unwrap();
        assert!(!missing.success);
    }

    #[tokio::test]
    async fn test_webhook_without_url_fails_cleanly() {
        let handler = WebhookHandler::new(Duration::from_secs(1));
        let outcome = handler
            .execute("hook", "production", &Parameters::new())
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("url"));
    }
}
