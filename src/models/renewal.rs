use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Artifacts produced by issuing a new certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCertificate {
    pub certificate_path: PathBuf,
    pub p12_path: PathBuf,
}

/// Outcome of a successful renewal run, consumed by the publisher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewalResult {
    pub success: bool,
    pub certificate_path: PathBuf,
    pub p12_path: PathBuf,
    pub application_ids: Vec<String>,

    /// Refreshed profile per application id; ids whose refresh failed are absent
    #[serde(default)]
    pub provisioning_profiles: BTreeMap<String, PathBuf>,

    pub issued_at: DateTime<Utc>,
}

impl RenewalResult {
    /// Application ids that did not get a refreshed profile
    pub fn missing_profiles(&self) -> Vec<&str> {
        self.application_ids
            .iter()
            .filter(|id| !self.provisioning_profiles.contains_key(*id))
            .map(String::as_str)
            .collect()
    }
}
