//! Webhook notifications for finished operations.
//!
//! Delivery is fire-and-forget: failures are logged and never change the
//! outcome of the operation that triggered them.

use anyhow::Result;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::NotificationConfig;
use crate::operation::Operation;

const MAX_ATTEMPTS: u32 = 3;

/// Notification event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationEvent {
    /// Operation completed.
    Complete,
    /// Operation failed.
    Error,
}

impl NotificationEvent {
    fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

/// Sends notifications based on configuration.
#[derive(Debug, Clone)]
pub struct Notifier {
    config: NotificationConfig,
    client: reqwest::Client,
}

impl Notifier {
    /// Create a new notifier from configuration.
    pub fn new(config: NotificationConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Returns true if any event has a delivery target.
    pub fn is_enabled(&self) -> bool {
        [&self.config.on_complete, &self.config.on_error]
            .into_iter()
            .any(|value| value.as_deref().and_then(webhook_url).is_some())
    }

    /// Send notification for a finished operation.
    pub async fn notify(&self, event: NotificationEvent, operation: &Operation) {
        let value = match event {
            NotificationEvent::Complete => self.config.on_complete.as_deref(),
            NotificationEvent::Error => self.config.on_error.as_deref(),
        };
        let Some(url) = value.and_then(webhook_url) else {
            return;
        };

        let payload = build_payload(event, operation);
        if let Err(e) = self.send_webhook(url, &payload).await {
            warn!(
                operation = %operation.operation_id,
                "Failed to send {} webhook: {e:#}",
                event.as_str()
            );
        }
    }

    /// POST with exponential backoff on 5xx, 429 and network errors.
    #[allow(tail_expr_drop_order)] // Drop order changes are harmless for HTTP responses
    async fn send_webhook(&self, url: &str, payload: &Value) -> Result<()> {
        debug!(url, %payload, "Sending webhook");
        let mut last_error = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let delay_secs = 1u64 << attempt;
                debug!(attempt = attempt + 1, delay_secs, "Retrying webhook");
                tokio::time::sleep(std::time::Duration::from_secs(delay_secs)).await;
            }

            match self.client.post(url).json(payload).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        debug!("Webhook sent successfully");
                        return Ok(());
                    }

                    let body = response.text().await.unwrap_or_default();
                    if status.is_server_error() || status.as_u16() == 429 {
                        last_error = Some(format!("Webhook returned {status}: {body}"));
                        continue;
                    }

                    anyhow::bail!("Webhook returned error status {status}: {body}");
                }
                Err(e) => last_error = Some(e.to_string()),
            }
        }

        anyhow::bail!(
            "Webhook failed after {MAX_ATTEMPTS} attempts: {}",
            last_error.unwrap_or_else(|| "unknown error".to_string())
        )
    }
}

/// Target URL for a notification value: `webhook:<url>` or a bare
/// http(s) URL. `none` and anything else disable delivery.
fn webhook_url(value: &str) -> Option<&str> {
    let value = value.trim();
    if let Some(url) = value.strip_prefix("webhook:") {
        let url = url.trim();
        return (!url.is_empty()).then_some(url);
    }
    if value.starts_with("http://") || value.starts_with("https://") {
        return Some(value);
    }
    if value != "none" && !value.is_empty() {
        warn!(value, "Unsupported notification target");
    }
    None
}

fn build_payload(event: NotificationEvent, operation: &Operation) -> Value {
    json!({
        "event": event.as_str(),
        "operation_id": operation.operation_id,
        "operation_type": operation.operation_type,
        "sandbox_id": operation.sandbox_id,
        "message": operation.message,
        "timestamp": operation.updated_at.to_rfc3339(),
    })
}
