use super::{NotificationPayload, Notifier, WebhookConfig};
use anyhow::{Context, Result, anyhow};
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, warn};

pub const SIGNATURE_HEADER: &str = "X-Renewgate-Signature";
pub const EVENT_HEADER: &str = "X-Renewgate-Event";

const INITIAL_BACKOFF_MS: u64 = 1000;
const MAX_BACKOFF_MS: u64 = 30_000;

/// Generic JSON webhook receiving the serialized [`NotificationPayload`]
pub struct WebhookNotifier {
    config: WebhookConfig,
    client: Client,
}

/// `sha256=<hex>` over the shared secret followed by the request body
pub fn sign_body(secret: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(body.as_bytes());
    format!("sha256={}", hex::encode(hasher.finalize()))
}

/// Delay before retry number `attempt` (1-based), doubling up to a cap
fn retry_delay(attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
    Duration::from_millis(INITIAL_BACKOFF_MS.saturating_mul(factor).min(MAX_BACKOFF_MS))
}

/// Client errors other than timeouts and rate limits will not improve on retry
fn is_retryable(status: StatusCode) -> bool {
    !status.is_client_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Result<Self> {
        if !config.enabled {
            return Err(anyhow!("Webhook notifier is disabled"));
        }

        if config.url.is_none() {
            return Err(anyhow!("Webhook URL is required"));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { config, client })
    }

    fn signature(&self, body: &str) -> Option<String> {
        self.config
            .secret
            .as_deref()
            .map(|secret| sign_body(secret, body))
    }

    async fn send_with_retry(&self, payload: &NotificationPayload) -> Result<()> {
        let url = self
            .config
            .url
            .as_ref()
            .ok_or_else(|| anyhow!("Webhook URL not configured"))?;

        let body = serde_json::to_string(payload).context("Failed to serialize payload")?;
        let signature = self.signature(&body);

        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                debug!(
                    "Retrying {} webhook (attempt {}/{})",
                    payload.event.as_str(),
                    attempt,
                    self.config.max_retries
                );
                tokio::time::sleep(retry_delay(attempt)).await;
            }

            let mut request = self
                .client
                .post(url)
                .header("Content-Type", "application/json")
                .header(EVENT_HEADER, payload.event.as_str());

            if let Some(signature) = &signature {
                request = request.header(SIGNATURE_HEADER, signature);
            }

            match request.body(body.clone()).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("Webhook {} delivered to {}", payload.event.as_str(), url);
                    return Ok(());
                },
                Ok(response) => {
                    let status = response.status();
                    warn!(
                        "Webhook returned status {}: {}",
                        status,
                        response
                            .text()
                            .await
                            .unwrap_or_else(|_| "Unable to read response".to_string())
                    );
                    if !is_retryable(status) {
                        return Err(anyhow!("Webhook rejected {}: {}", payload.event.as_str(), status));
                    }
                    last_error = Some(anyhow!("Webhook returned non-success status: {}", status));
                },
                Err(e) => {
                    warn!("Failed to send webhook notification: {}", e);
                    last_error = Some(anyhow!("HTTP request failed: {}", e));
                },
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("Webhook notification failed after all retries")))
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, payload: &NotificationPayload) -> Result<()> {
        self.send_with_retry(payload).await
    }

    fn name(&self) -> &'static str {
        "Webhook"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled && self.config.url.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::{NotificationEvent, Severity};

    fn config(secret: Option<&str>) -> WebhookConfig {
        WebhookConfig {
            enabled: true,
            url: Some("https://hooks.example.com/renewals".to_string()),
            secret: secret.map(str::to_string),
            timeout_seconds: 10,
            max_retries: 0,
        }
    }

    fn approval_payload() -> NotificationPayload {
        NotificationPayload::new(
            NotificationEvent::ApprovalRequested,
            Severity::Info,
            "develop",
            "The distribution certificate expires in 12 days. Renew it?",
        )
        .with_application_ids(vec!["com.example.app.uat".to_string()])
        .with_expiry(Some("2025-05-13".to_string()), Some(12))
        .with_approval("20250501080000-ab12cd34", None)
    }

    #[test]
    fn test_requires_enabled_config_with_url() {
        assert!(WebhookNotifier::new(config(None)).unwrap().is_enabled());
        assert!(
            WebhookNotifier::new(WebhookConfig {
                enabled: false,
                ..config(None)
            })
            .is_err()
        );
        assert!(
            WebhookNotifier::new(WebhookConfig {
                url: None,
                ..config(None)
            })
            .is_err()
        );
    }

    #[test]
    fn test_approval_request_body_shape() {
        let body = serde_json::to_string(&approval_payload()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();

        assert_eq!(value["event"], "approval_requested");
        assert_eq!(value["severity"], "info");
        assert_eq!(value["environment"], "develop");
        assert_eq!(value["approvalId"], "20250501080000-ab12cd34");
        assert_eq!(value["applicationIds"][0], "com.example.app.uat");
        assert_eq!(value["daysRemaining"], 12);
        assert!(value.get("approvalUrl").is_none());
        assert!(value.get("errorMessage").is_none());
        assert!(value.get("fields").is_none());
    }

    #[test]
    fn test_signature_covers_the_sent_body() {
        let notifier = WebhookNotifier::new(config(Some("s3cret"))).unwrap();
        let body = serde_json::to_string(&approval_payload()).unwrap();

        let mut hasher = Sha256::new();
        hasher.update(b"s3cret");
        hasher.update(body.as_bytes());
        let expected = format!("sha256={}", hex::encode(hasher.finalize()));

        assert_eq!(notifier.signature(&body), Some(expected));

        let failed = NotificationPayload::new(
            NotificationEvent::RenewalFailed,
            Severity::Failure,
            "develop",
            "Certificate renewal failed.",
        );
        let other = serde_json::to_string(&failed).unwrap();
        assert_ne!(notifier.signature(&body), notifier.signature(&other));
    }

    #[test]
    fn test_no_signature_without_secret() {
        let notifier = WebhookNotifier::new(config(None)).unwrap();
        assert!(notifier.signature("{}").is_none());
    }

    #[test]
    fn test_retry_delay_doubles_up_to_cap() {
        assert_eq!(retry_delay(1), Duration::from_secs(1));
        assert_eq!(retry_delay(2), Duration::from_secs(2));
        assert_eq!(retry_delay(4), Duration::from_secs(8));
        assert_eq!(retry_delay(10), Duration::from_secs(30));
        assert_eq!(retry_delay(200), Duration::from_secs(30));
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable(StatusCode::BAD_GATEWAY));
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_retryable(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable(StatusCode::NOT_FOUND));
    }
}
