use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Signing certificate type as reported by the certificate directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateKind {
    /// Required to release a production build
    Distribution,
    Development,
    /// Any other vendor type, kept verbatim
    Other(String),
}

#[derive(Debug, Error)]
pub enum CertificateKindError {
    #[error("Empty certificate type")]
    Empty,
}

impl CertificateKind {
    /// Vendor identifier used by the certificate directory
    pub fn as_vendor_str(&self) -> &str {
        match self {
            CertificateKind::Distribution => "IOS_DISTRIBUTION",
            CertificateKind::Development => "IOS_DEVELOPMENT",
            CertificateKind::Other(raw) => raw,
        }
    }
}

impl FromStr for CertificateKind {
    type Err = CertificateKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err(CertificateKindError::Empty),
            "IOS_DISTRIBUTION" | "DISTRIBUTION" => Ok(CertificateKind::Distribution),
            "IOS_DEVELOPMENT" | "DEVELOPMENT" => Ok(CertificateKind::Development),
            other => Ok(CertificateKind::Other(other.to_string())),
        }
    }
}

/// Snapshot of a certificate as fetched from the directory. Never mutated locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRecord {
    pub id: String,
    pub name: String,
    pub kind: CertificateKind,
    /// Expiration instant in the offset the directory reported it in
    pub expires_at: DateTime<FixedOffset>,
}

/// Provisioning profile linked to a certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRecord {
    pub id: String,
    pub name: String,
    /// Bundle identifier the profile is bound to, when the directory returned one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_id: Option<String>,
}

/// A certificate paired with the first of the requested application ids it serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateMatch {
    pub certificate: CertificateRecord,
    pub application_id: String,
}
