use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// How long a pending request stays consumable after it was created
pub const APPROVAL_TTL_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Processed,
}

/// Human decision recorded against a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

#[derive(Debug, Error)]
pub enum ApprovalDecisionError {
    #[error("Invalid approval action '{0}', expected 'approve' or 'reject'")]
    Invalid(String),
}

impl ApprovalDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalDecision::Approve => "approve",
            ApprovalDecision::Reject => "reject",
        }
    }
}

impl fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalDecision {
    type Err = ApprovalDecisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "approve" => Ok(ApprovalDecision::Approve),
            "reject" => Ok(ApprovalDecision::Reject),
            _ => Err(ApprovalDecisionError::Invalid(s.to_string())),
        }
    }
}

/// Persisted record gating a single renewal cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub approval_id: String,
    pub environment: String,
    pub application_id: String,
    pub requested_at: DateTime<Utc>,
    pub status: ApprovalStatus,

    /// Set only once the request is processed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<ApprovalDecision>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_by: Option<String>,
}

impl ApprovalRequest {
    pub fn pending(
        approval_id: impl Into<String>,
        environment: impl Into<String>,
        application_id: impl Into<String>,
        requested_at: DateTime<Utc>,
    ) -> Self {
        Self {
            approval_id: approval_id.into(),
            environment: environment.into(),
            application_id: application_id.into(),
            requested_at,
            status: ApprovalStatus::Pending,
            decision: None,
            processed_at: None,
            processed_by: None,
        }
    }

    /// Last instant at which the request may still be consumed (inclusive)
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.requested_at + Duration::hours(APPROVAL_TTL_HOURS)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    pub fn is_processed(&self) -> bool {
        self.status == ApprovalStatus::Processed
    }
}
