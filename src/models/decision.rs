use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Outcome of one evaluation cycle, handed to the approval and renewal stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewalDecision {
    pub needs_update: bool,

    /// Set when renewal was requested regardless of expiry evidence
    #[serde(default)]
    pub forced: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_id: Option<String>,

    /// Application identifiers in the order they were supplied
    pub application_ids: Vec<String>,

    /// The requested application id that linked the selected certificate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_application_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<FixedOffset>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_remaining: Option<i64>,
}

impl RenewalDecision {
    /// Renewal requested without consulting the certificate directory
    pub fn forced(application_ids: Vec<String>) -> Self {
        Self {
            needs_update: true,
            forced: true,
            certificate_id: None,
            application_ids,
            matched_application_id: None,
            expires_at: None,
            days_remaining: None,
        }
    }

    /// Renewal needed because no usable expiry evidence could be gathered
    pub fn without_evidence(application_ids: Vec<String>) -> Self {
        Self {
            forced: false,
            ..Self::forced(application_ids)
        }
    }

    /// The application id an approval request is scoped to
    pub fn primary_application_id(&self) -> Option<&str> {
        self.matched_application_id
            .as_deref()
            .or_else(|| self.application_ids.first().map(String::as_str))
    }

    /// Expiry date rendered for humans, `YYYY-MM-DD`
    pub fn expiry_date(&self) -> Option<String> {
        self.expires_at
            .map(|expires_at| expires_at.format("%Y-%m-%d").to_string())
    }
}
