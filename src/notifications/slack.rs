use super::{
    NotificationEvent, NotificationPayload, Notifier, SlackConfig, environment_display_name,
};
use anyhow::{Context, Result, anyhow};
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

pub struct SlackNotifier {
    config: SlackConfig,
    client: Client,
}

impl SlackNotifier {
    pub fn new(config: SlackConfig) -> Result<Self> {
        if !config.enabled {
            return Err(anyhow!("Slack notifier is disabled"));
        }

        if config.webhook_url.is_none() {
            return Err(anyhow!("Slack webhook URL is required"));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { config, client })
    }

    /// Build Slack message in Block Kit format
    fn build_message(&self, payload: &NotificationPayload) -> serde_json::Value {
        let emoji = payload.severity.emoji();
        let color = payload.severity.color();
        let title = payload.title();

        let mut summary = vec![json!({
            "type": "mrkdwn",
            "text": format!("*Environment:*\n{}", environment_display_name(&payload.environment))
        })];

        if !payload.application_ids.is_empty() {
            summary.push(json!({
                "type": "mrkdwn",
                "text": format!("*Bundle ID:*\n{}", payload.application_ids.join(", "))
            }));
        }

        if let Some(expiry) = &payload.expiry_date {
            summary.push(json!({
                "type": "mrkdwn",
                "text": format!("*Expires:*\n{}", expiry)
            }));
        }

        if let Some(days) = payload.days_remaining {
            summary.push(json!({
                "type": "mrkdwn",
                "text": format!("*Days remaining:*\n{}", days)
            }));
        }

        if let Some(actor) = &payload.actor {
            summary.push(json!({
                "type": "mrkdwn",
                "text": format!("*By:*\n{}", actor)
            }));
        }

        // Slack caps section fields at 10
        for (key, value) in payload.fields.iter().take(10usize.saturating_sub(summary.len())) {
            summary.push(json!({
                "type": "mrkdwn",
                "text": format!("*{}:*\n{}", key, value)
            }));
        }

        let mut blocks = vec![
            json!({
                "type": "header",
                "text": {
                    "type": "plain_text",
                    "text": format!("{} {}", emoji, title),
                    "emoji": true
                }
            }),
            json!({
                "type": "section",
                "text": {
                    "type": "mrkdwn",
                    "text": payload.message
                }
            }),
            json!({
                "type": "section",
                "fields": summary
            }),
        ];

        if let Some(error) = &payload.error_message {
            blocks.push(json!({
                "type": "section",
                "text": {
                    "type": "mrkdwn",
                    "text": format!("*Error:*\n```{}```", error)
                }
            }));
        }

        if payload.event == NotificationEvent::ApprovalRequested {
            if let Some(approval_id) = &payload.approval_id {
                blocks.push(json!({
                    "type": "section",
                    "text": {
                        "type": "mrkdwn",
                        "text": approval_instructions(
                            approval_id,
                            &payload.environment,
                            payload.approval_url.as_deref()
                        )
                    }
                }));
            }
        }

        let mut context = vec![json!({
            "type": "mrkdwn",
            "text": format!("<!date^{}^{{date_short_pretty}} at {{time}}|{}>",
                payload.timestamp.timestamp(),
                payload.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
            )
        })];

        if let Some(run_url) = &payload.run_url {
            context.push(json!({
                "type": "mrkdwn",
                "text": format!("<{}|View workflow run>", run_url)
            }));
        }

        blocks.push(json!({
            "type": "context",
            "elements": context
        }));

        let mut message = json!({
            "text": format!("{} {}", emoji, title),
            "blocks": blocks,
            "attachments": [{
                "color": color,
                "fallback": title.clone()
            }]
        });

        // Incoming webhooks post to the channel bound to the URL
        if let Some(username) = &self.config.username {
            message["username"] = json!(username);
        } else {
            message["username"] = json!("Renewgate");
        }

        if let Some(icon) = &self.config.icon_emoji {
            message["icon_emoji"] = json!(icon);
        } else {
            message["icon_emoji"] = json!(":closed_lock_with_key:");
        }

        message
    }
}

/// Steps a human follows to answer an approval request
fn approval_instructions(approval_id: &str, environment: &str, url: Option<&str>) -> String {
    let open = match url {
        Some(url) => format!("1. <{}|Open the approval workflow>", url),
        None => "1. Open the approval workflow".to_string(),
    };

    format!(
        "*To approve:*\n{}\n2. Click \"Run workflow\"\n3. Enter:\n   • `approval_action`: `approve`\n   • `environment`: `{}`\n   • `approval_id`: `{}`\n\n*To reject:* run the same workflow with `approval_action` set to `reject`.\nRequests expire after 24 hours.",
        open, environment, approval_id
    )
}

#[async_trait::async_trait]
impl Notifier for SlackNotifier {
    async fn send(&self, payload: &NotificationPayload) -> Result<()> {
        let webhook_url = self
            .config
            .webhook_url
            .as_ref()
            .ok_or_else(|| anyhow!("Slack webhook URL not configured"))?;

        let message = self.build_message(payload);
        let json_str =
            serde_json::to_string(&message).context("Failed to serialize message to JSON")?;
        debug!("Sending Slack notification ({} bytes)", json_str.len());

        let response = self
            .client
            .post(webhook_url)
            .header("Content-Type", "application/json")
            .body(json_str)
            .send()
            .await
            .map_err(|e| {
                anyhow!(
                    "Failed to send Slack notification: {} | is_timeout: {} | is_connect: {}",
                    e,
                    e.is_timeout(),
                    e.is_connect()
                )
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read response".to_string());
            return Err(anyhow!("Slack API returned error {}: {}", status, body));
        }

        debug!("Slack notification sent successfully");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Slack"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled && self.config.webhook_url.is_some()
    }
}
