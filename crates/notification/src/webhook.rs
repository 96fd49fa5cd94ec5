//! JSON webhook delivery with retry.

use async_trait::async_trait;
use autoheal_core::config::NotificationConfig;
use autoheal_core::ports::{NotificationPayload, Notifier};
use std::time::Duration;
use tracing::{debug, warn};

use crate::retry::RetryPolicy;

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    retry: RetryPolicy,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration, retry: RetryPolicy) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
            retry,
        }
    }

    pub fn from_config(config: &NotificationConfig) -> Self {
        Self::new(
            config.webhook_url.clone(),
            Duration::from_secs(config.timeout_seconds),
            RetryPolicy::from_config(config),
        )
    }

    pub fn is_configured(&self) -> bool {
        !self.url.is_empty()
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    /// 2xx is delivered. Transport errors and 5xx are retried on the
    /// backoff schedule; any other status fails immediately.
    async fn send(&self, payload: &NotificationPayload) -> bool {
        if !self.is_configured() {
            warn!("No webhook URL configured, skipping notification");
            return false;
        }

        for attempt in 0..self.retry.max_attempts {
            match self.client.post(&self.url).json(payload).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(kind = payload.kind.as_str(), attempt = attempt, "Webhook accepted notification");
                    return true;
                }
                Ok(resp) if !resp.status().is_server_error() => {
                    warn!(kind = payload.kind.as_str(), status = %resp.status(), "Webhook rejected notification");
                    return false;
                }
                Ok(resp) => {
                    warn!(kind = payload.kind.as_str(), status = %resp.status(), attempt = attempt, "Webhook server error");
                }
                Err(e) => {
                    warn!(kind = payload.kind.as_str(), error = %e, attempt = attempt, "Webhook request failed");
                }
            }
            if attempt + 1 < self.retry.max_attempts {
                tokio::time::sleep(self.retry.backoff_for_attempt(attempt)).await;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoheal_core::ports::NotificationKind;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn payload() -> NotificationPayload {
        NotificationPayload {
            kind: NotificationKind::Remediation,
            title: "Remediation success".into(),
            body: "Executed 1/1 steps successfully.".into(),
            metadata: serde_json::json!({"plan_id": "PLAN-1"}),
            timestamp: Utc::now(),
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            initial_backoff_ms: 10,
            max_backoff_ms: 20,
            ..Default::default()
        }
    }

    async fn read_request(socket: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let headers = String::from_utf8_lossy(&buf[..pos]).to_lowercase();
                let body_len = headers
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= pos + 4 + body_len {
                    return;
                }
            }
        }
    }

    /// Answers one request per status, closing each connection.
    async fn serve(statuses: Vec<u16>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            for status in statuses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                read_request(&mut socket).await;
                counter.fetch_add(1, Ordering::SeqCst);
                let response = format!(
                    "HTTP/1.1 {status} Status\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{addr}/hook"), hits)
    }

    #[tokio::test]
    async fn test_missing_url_reports_false() {
        let notifier = WebhookNotifier::from_config(&NotificationConfig::default());
        assert!(!notifier.is_configured());
        assert!(!notifier.send(&payload()).await);
    }

    #[tokio::test]
    async fn test_retries_server_errors_until_success() {
        let (url, hits) = serve(vec![503, 502, 200]).await;
        let notifier = WebhookNotifier::new(url, Duration::from_secs(5), fast_retry());
        assert!(notifier.send(&payload()).await);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let (url, hits) = serve(vec![503, 503, 503]).await;
        let notifier = WebhookNotifier::new(url, Duration::from_secs(5), fast_retry());
        assert!(!notifier.send(&payload()).await);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let (url, hits) = serve(vec![400]).await;
        let notifier = WebhookNotifier::new(url, Duration::from_secs(5), fast_retry());
        assert!(!notifier.send(&payload()).await);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
