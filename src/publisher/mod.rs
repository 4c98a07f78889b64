use crate::approval::write_atomic;
use crate::clock::Clock;
use crate::models::RenewalResult;
use crate::notifications::{NotificationEvent, NotificationManager, NotificationPayload, Severity};
use crate::secrets::SecretStore;
use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub const RESULT_FILE: &str = "result.json";

/// Environment part of secret names: `prd` for main, otherwise the name itself
pub fn secret_suffix(environment: &str) -> &str {
    if environment == "main" { "prd" } else { environment }
}

pub fn certificate_secret_name(base: &str, environment: &str) -> String {
    format!("{}/distribution-certificate-{}", base, secret_suffix(environment))
}

pub fn metadata_secret_name(base: &str, environment: &str) -> String {
    format!("{}/certificate-metadata-{}", base, secret_suffix(environment))
}

#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub state_dir: PathBuf,
    pub secret_base_name: String,
    pub p12_password: Option<String>,
    pub updated_by: String,
    pub environment: String,
    pub run_url: Option<String>,
}

/// What `upload` wrote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub certificate_secret: String,
    /// `None` when the metadata write failed
    pub metadata_secret: Option<String>,
    pub profiles: usize,
}

pub struct ResultPublisher {
    settings: PublisherSettings,
    secrets: Arc<dyn SecretStore>,
    notifications: Arc<NotificationManager>,
    clock: Arc<dyn Clock>,
}

impl ResultPublisher {
    pub fn new(
        settings: PublisherSettings,
        secrets: Arc<dyn SecretStore>,
        notifications: Arc<NotificationManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            secrets,
            notifications,
            clock,
        }
    }

    /// Snapshot the renewal result for later stages
    pub fn persist(&self, result: &RenewalResult) -> Result<PathBuf> {
        save_result(&self.settings.state_dir, result)
    }

    pub fn load(&self) -> Result<RenewalResult> {
        load_result(&self.settings.state_dir)
    }

    /// Push the issued artifacts to the secret store
    pub async fn upload(&self, result: &RenewalResult, environment: &str) -> Result<UploadSummary> {
        let certificate = read_base64(&result.certificate_path)?;
        let p12 = read_base64(&result.p12_path)?;

        let mut profiles = BTreeMap::new();
        for (application_id, path) in &result.provisioning_profiles {
            match read_base64(path) {
                Ok(encoded) => {
                    profiles.insert(application_id.clone(), encoded);
                },
                Err(e) => warn!("Skipping profile for {}: {:#}", application_id, e),
            }
        }

        let now = self.clock.now().to_rfc3339();
        let base = &self.settings.secret_base_name;
        let certificate_secret = certificate_secret_name(base, environment);

        let mut payload = json!({
            "certificate": certificate,
            "p12": p12,
            "p12_password": self.settings.p12_password.clone().unwrap_or_default(),
            "application_ids": result.application_ids,
            "updated_at": now,
            "updated_by": self.settings.updated_by,
        });
        if !profiles.is_empty() {
            payload["provisioning_profiles"] = json!(profiles);
        }

        self.secrets
            .put(&certificate_secret, &payload)
            .await
            .with_context(|| format!("Failed to upload {}", certificate_secret))?;
        info!(
            "Uploaded certificate to {} with {} profile(s)",
            certificate_secret,
            profiles.len()
        );

        let metadata_secret = metadata_secret_name(base, environment);
        let metadata = json!({
            "last_update": now,
            "application_ids": result.application_ids,
            "certificate_type": "IOS_DISTRIBUTION",
            "update_source": self.settings.updated_by,
        });

        let metadata_secret = match self.secrets.put(&metadata_secret, &metadata).await {
            Ok(()) => Some(metadata_secret),
            Err(e) => {
                warn!("Failed to write metadata secret {}: {:#}", metadata_secret, e);
                None
            },
        };

        Ok(UploadSummary {
            certificate_secret,
            metadata_secret,
            profiles: profiles.len(),
        })
    }

    /// Post a status message; delivery problems are logged only
    pub async fn announce(
        &self,
        status: Severity,
        message: &str,
        fields: BTreeMap<String, String>,
    ) {
        let event = match status {
            Severity::Success => NotificationEvent::RenewalCompleted,
            Severity::Failure => NotificationEvent::RenewalFailed,
            Severity::Warning | Severity::Info => NotificationEvent::StatusUpdate,
        };

        let mut payload =
            NotificationPayload::new(event, status, &self.settings.environment, message)
                .with_run_url(self.settings.run_url.clone());
        payload.timestamp = self.clock.now();
        payload.fields = fields;

        self.notifications.notify(&payload).await;
    }
}

/// Write `result.json` into the state directory
pub fn save_result(state_dir: &Path, result: &RenewalResult) -> Result<PathBuf> {
    fs::create_dir_all(state_dir)
        .with_context(|| format!("Failed to create {}", state_dir.display()))?;

    let path = state_dir.join(RESULT_FILE);
    let json = serde_json::to_vec_pretty(result).context("Failed to serialize result")?;
    write_atomic(&path, &json)?;
    info!("Saved renewal result to {}", path.display());
    Ok(path)
}

pub fn load_result(state_dir: &Path) -> Result<RenewalResult> {
    let path = state_dir.join(RESULT_FILE);
    let raw = fs::read(&path).with_context(|| format!("No renewal result at {}", path.display()))?;
    serde_json::from_slice(&raw)
        .with_context(|| format!("Failed to parse renewal result {}", path.display()))
}

fn read_base64(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(STANDARD.encode(bytes))
}
