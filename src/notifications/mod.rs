use crate::metrics;
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{error, info, warn};

mod slack;
mod webhook;

pub use slack::SlackNotifier;
pub use webhook::WebhookNotifier;

/// Notification event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    /// Renewal needed, waiting for a human decision
    ApprovalRequested,
    /// Renewal approved by a human
    RenewalApproved,
    /// Renewal rejected by a human
    RenewalRejected,
    /// New certificate issued and published
    RenewalCompleted,
    /// Renewal or publishing failed
    RenewalFailed,
    /// Free-form pipeline status message
    StatusUpdate,
}

impl NotificationEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApprovalRequested => "approval.requested",
            Self::RenewalApproved => "renewal.approved",
            Self::RenewalRejected => "renewal.rejected",
            Self::RenewalCompleted => "renewal.completed",
            Self::RenewalFailed => "renewal.failed",
            Self::StatusUpdate => "status.update",
        }
    }
}

/// Status classification shown to humans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Success,
    Failure,
    Warning,
    Info,
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid status '{0}', expected success, failure, warning or info")]
pub struct SeverityParseError(String);

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Success => ":white_check_mark:",
            Self::Failure => ":x:",
            Self::Warning => ":warning:",
            Self::Info => ":information_source:",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            Self::Success => "#36a64f", // Green
            Self::Failure => "#ff0000", // Red
            Self::Warning => "#ff9900", // Orange
            Self::Info => "#0099ff",    // Blue
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = SeverityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "warning" => Ok(Self::Warning),
            "info" => Ok(Self::Info),
            _ => Err(SeverityParseError(s.to_string())),
        }
    }
}

/// Human-facing name of a deployment environment
pub fn environment_display_name(environment: &str) -> String {
    if environment == "main" {
        "Production".to_string()
    } else {
        environment.to_uppercase()
    }
}

/// Notification payload containing event details
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub event: NotificationEvent,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub environment: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub application_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_remaining: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_url: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

impl NotificationPayload {
    pub fn new(
        event: NotificationEvent,
        severity: Severity,
        environment: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event,
            severity,
            timestamp: Utc::now(),
            environment: environment.into(),
            message: message.into(),
            application_ids: Vec::new(),
            approval_id: None,
            approval_url: None,
            expiry_date: None,
            days_remaining: None,
            actor: None,
            error_message: None,
            run_url: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_application_ids(mut self, ids: Vec<String>) -> Self {
        self.application_ids = ids;
        self
    }

    pub fn with_approval(mut self, approval_id: impl Into<String>, url: Option<String>) -> Self {
        self.approval_id = Some(approval_id.into());
        self.approval_url = url;
        self
    }

    pub fn with_expiry(mut self, expiry_date: Option<String>, days_remaining: Option<i64>) -> Self {
        self.expiry_date = expiry_date;
        self.days_remaining = days_remaining;
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }

    pub fn with_run_url(mut self, url: Option<String>) -> Self {
        self.run_url = url;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Generate a human-readable title for the notification
    pub fn title(&self) -> String {
        let env = environment_display_name(&self.environment);
        match self.event {
            NotificationEvent::ApprovalRequested => {
                format!("Certificate renewal approval requested ({})", env)
            },
            NotificationEvent::RenewalApproved => format!("Certificate renewal approved ({})", env),
            NotificationEvent::RenewalRejected => format!("Certificate renewal rejected ({})", env),
            NotificationEvent::RenewalCompleted => {
                format!("Certificate renewal completed ({})", env)
            },
            NotificationEvent::RenewalFailed => format!("Certificate renewal failed ({})", env),
            NotificationEvent::StatusUpdate => format!("Certificate renewal status ({})", env),
        }
    }

    /// Generate a human-readable description for the notification
    pub fn description(&self) -> String {
        let mut desc = self.message.clone();

        if !self.application_ids.is_empty() {
            desc.push_str(&format!("\nBundle IDs: {}", self.application_ids.join(", ")));
        }

        if let Some(expiry) = &self.expiry_date {
            desc.push_str(&format!("\nExpires: {}", expiry));
        }

        if let Some(days) = self.days_remaining {
            desc.push_str(&format!("\nDays remaining: {}", days));
        }

        if let Some(approval_id) = &self.approval_id {
            desc.push_str(&format!("\nApproval ID: {}", approval_id));
        }

        if let Some(actor) = &self.actor {
            desc.push_str(&format!("\nBy: {}", actor));
        }

        if let Some(error) = &self.error_message {
            desc.push_str(&format!("\nError: {}", error));
        }

        desc
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub slack: SlackConfig,
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SlackConfig {
    pub enabled: bool,
    pub webhook_url: Option<String>,
    pub username: Option<String>,
    pub icon_emoji: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub secret: Option<String>,
    pub timeout_seconds: u64,
    pub max_retries: u32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            secret: None,
            timeout_seconds: 10,
            max_retries: 3,
        }
    }
}

impl NotificationConfig {
    /// Check if any notification channels are enabled
    pub fn has_enabled_channels(&self) -> bool {
        self.slack.enabled || self.webhook.enabled
    }
}

/// Notifier trait for different notification backends
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, payload: &NotificationPayload) -> Result<()>;
    fn name(&self) -> &'static str;
    fn is_enabled(&self) -> bool;
}

/// Coordinates all configured notifiers
pub struct NotificationManager {
    notifiers: Vec<Box<dyn Notifier>>,
}

impl NotificationManager {
    pub fn new(config: NotificationConfig) -> Self {
        let mut notifiers: Vec<Box<dyn Notifier>> = Vec::new();

        if config.slack.enabled {
            match SlackNotifier::new(config.slack.clone()) {
                Ok(notifier) => notifiers.push(Box::new(notifier)),
                Err(e) => error!("Failed to create Slack notifier: {}", e),
            }
        }

        if config.webhook.enabled {
            match WebhookNotifier::new(config.webhook.clone()) {
                Ok(notifier) => notifiers.push(Box::new(notifier)),
                Err(e) => error!("Failed to create webhook notifier: {}", e),
            }
        }

        info!(
            "Notification manager initialized with {} notifiers",
            notifiers.len()
        );

        Self { notifiers }
    }

    /// Build a manager from already constructed notifiers
    pub fn with_notifiers(notifiers: Vec<Box<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    /// Send to every enabled notifier. Succeeds if at least one delivered.
    ///
    /// Used where a missing notification is itself a failure, such as an
    /// approval request nobody would otherwise see.
    pub async fn deliver(&self, payload: &NotificationPayload) -> Result<()> {
        if !self.has_enabled_notifiers() {
            return Err(anyhow!("No notification channels are configured"));
        }

        info!(
            "Sending notification: {} ({})",
            payload.event.as_str(),
            payload.environment
        );

        let mut delivered = 0usize;
        let mut failures = Vec::new();

        for notifier in self.notifiers.iter().filter(|n| n.is_enabled()) {
            match notifier.send(payload).await {
                Ok(()) => {
                    info!("Notification sent successfully via {}", notifier.name());
                    metrics::NOTIFICATIONS_SENT_TOTAL.inc();
                    delivered += 1;
                },
                Err(e) => {
                    error!("Failed to send notification via {}: {}", notifier.name(), e);
                    metrics::NOTIFICATIONS_FAILED_TOTAL.inc();
                    failures.push(format!("{}: {}", notifier.name(), e));
                },
            }
        }

        if delivered == 0 {
            return Err(anyhow!(
                "Notification was not delivered: {}",
                failures.join("; ")
            ));
        }

        Ok(())
    }

    /// Fire-and-forget: failures are logged and never returned
    pub async fn notify(&self, payload: &NotificationPayload) {
        if self.notifiers.is_empty() {
            warn!(
                "No notification channels configured, skipping {}",
                payload.event.as_str()
            );
            return;
        }

        if let Err(e) = self.deliver(payload).await {
            warn!("Continuing without notification: {}", e);
        }
    }

    /// Check if any notifiers are enabled
    pub fn has_enabled_notifiers(&self) -> bool {
        self.notifiers.iter().any(|n| n.is_enabled())
    }

    /// Get count of enabled notifiers
    pub fn enabled_count(&self) -> usize {
        self.notifiers.iter().filter(|n| n.is_enabled()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingNotifier {
        sent: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl Notifier for CountingNotifier {
        async fn send(&self, _payload: &NotificationPayload) -> Result<()> {
            if self.fail {
                return Err(anyhow!("channel down"));
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Counting"
        }

        fn is_enabled(&self) -> bool {
            true
        }
    }

    fn payload() -> NotificationPayload {
        NotificationPayload::new(
            NotificationEvent::ApprovalRequested,
            Severity::Info,
            "main",
            "Certificate expires soon",
        )
    }

    #[test]
    fn test_severity_parsing() {
        assert_eq!("SUCCESS".parse::<Severity>().unwrap(), Severity::Success);
        assert_eq!("warning".parse::<Severity>().unwrap(), Severity::Warning);
        assert!("loud".parse::<Severity>().is_err());
    }

    #[test]
    fn test_environment_display_name() {
        assert_eq!(environment_display_name("main"), "Production");
        assert_eq!(environment_display_name("develop"), "DEVELOP");
    }

    #[test]
    fn test_payload_title_and_description() {
        let payload = payload()
            .with_application_ids(vec!["com.example.app".to_string()])
            .with_expiry(Some("2025-06-01".to_string()), Some(25))
            .with_approval("A1", None);

        assert_eq!(
            payload.title(),
            "Certificate renewal approval requested (Production)"
        );
        let desc = payload.description();
        assert!(desc.contains("Bundle IDs: com.example.app"));
        assert!(desc.contains("Days remaining: 25"));
        assert!(desc.contains("Approval ID: A1"));
    }

    #[tokio::test]
    async fn test_deliver_without_channels_fails() {
        let manager = NotificationManager::with_notifiers(vec![]);
        assert!(manager.deliver(&payload()).await.is_err());
        // notify never surfaces the failure
        manager.notify(&payload()).await;
    }

    #[tokio::test]
    async fn test_deliver_succeeds_if_any_channel_delivers() {
        let sent = Arc::new(AtomicUsize::new(0));
        let manager = NotificationManager::with_notifiers(vec![
            Box::new(CountingNotifier {
                sent: sent.clone(),
                fail: true,
            }),
            Box::new(CountingNotifier {
                sent: sent.clone(),
                fail: false,
            }),
        ]);

        assert!(manager.deliver(&payload()).await.is_ok());
        assert_eq!(sent.load(Ordering::SeqCst), 1);
        assert_eq!(manager.enabled_count(), 2);
    }

    #[tokio::test]
    async fn test_deliver_fails_when_every_channel_fails() {
        let manager = NotificationManager::with_notifiers(vec![Box::new(CountingNotifier {
            sent: Arc::new(AtomicUsize::new(0)),
            fail: true,
        })]);

        let err = manager.deliver(&payload()).await.unwrap_err();
        assert!(err.to_string().contains("channel down"));
    }
}
