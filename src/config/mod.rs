//! Run configuration.
//!
//! Values come from environment variables first, then an optional YAML file
//! whose keys override them, then CLI flags applied by the binary.

use crate::directory::{AppStoreConnectConfig, DEFAULT_BASE_URL};
use crate::notifications::{NotificationConfig, SlackConfig, WebhookConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_ENVIRONMENT: &str = "main";
pub const DEFAULT_DAYS_THRESHOLD: i64 = 30;
const DEFAULT_APPROVAL_WORKFLOW: &str = "approval-certificate-update.yml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewalConfig {
    pub environment: String,
    pub days_threshold: i64,
    /// Holds approval records and stage snapshots between invocations
    pub state_dir: PathBuf,
    pub metrics_textfile: Option<PathBuf>,
    pub tie_break: TieBreakPolicy,
    pub app_store_connect: AppStoreConnectSettings,
    pub signing: SigningSettings,
    pub secrets: SecretStoreSettings,
    pub project: ProjectSettings,
    pub approval: ApprovalSettings,
    pub notifications: NotificationConfig,
    /// CI run metadata, never read from the config file
    #[serde(skip)]
    pub run: RunContext,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreakPolicy {
    #[default]
    FirstSeen,
    CertificateId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStoreConnectSettings {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningSettings {
    pub fastlane_path: PathBuf,
    pub team_id: Option<String>,
    pub username: Option<String>,
    pub certificates_dir: PathBuf,
    pub profiles_dir: PathBuf,
    pub p12_password: Option<String>,
    /// App Store Connect API key handed to fastlane
    pub api_key_id: Option<String>,
    pub api_issuer_id: Option<String>,
    pub api_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretBackend {
    #[default]
    File,
    Kubernetes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretStoreSettings {
    pub backend: SecretBackend,
    pub base_name: String,
    /// Root directory for the file backend
    pub directory: PathBuf,
    /// Namespace for the kubernetes backend
    pub namespace: String,
    pub updated_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSettings {
    pub root: PathBuf,
    /// Environment name to bundle identifier suffix, e.g. develop -> .uat
    pub bundle_id_suffixes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalSettings {
    /// Page a human opens to answer the request
    pub workflow_url: Option<String>,
    pub workflow_file: Option<String>,
}

/// Metadata about the CI run invoking a stage
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub server_url: Option<String>,
    pub repository: Option<String>,
    pub run_id: Option<String>,
    pub actor: Option<String>,
}

impl RunContext {
    pub fn repository_url(&self) -> Option<String> {
        let repository = self.repository.as_deref()?;
        let server = self.server_url.as_deref().unwrap_or("https://github.com");
        Some(format!("{}/{}", server.trim_end_matches('/'), repository))
    }

    pub fn run_url(&self) -> Option<String> {
        let run_id = self.run_id.as_deref()?;
        Some(format!("{}/actions/runs/{}", self.repository_url()?, run_id))
    }
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl RenewalConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source, empty values count as unset
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let state_dir = get("RENEWGATE_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".renewgate"));

        let slack_url = get("SLACK_WEBHOOK_URL");
        let notifications = NotificationConfig {
            slack: SlackConfig {
                enabled: parse_bool(get("SLACK_ENABLED"), slack_url.is_some()),
                webhook_url: slack_url,
                username: get("SLACK_USERNAME"),
                icon_emoji: get("SLACK_ICON_EMOJI"),
            },
            webhook: WebhookConfig {
                enabled: parse_bool(get("WEBHOOK_ENABLED"), false),
                url: get("WEBHOOK_URL"),
                secret: get("WEBHOOK_SECRET"),
                timeout_seconds: parse_u64(get("WEBHOOK_TIMEOUT"), 10),
                max_retries: parse_u32(get("WEBHOOK_MAX_RETRIES"), 3),
            },
        };

        Self {
            environment: get("RENEWGATE_ENVIRONMENT")
                .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string()),
            days_threshold: get("RENEWGATE_DAYS_THRESHOLD")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_DAYS_THRESHOLD),
            metrics_textfile: get("RENEWGATE_METRICS_TEXTFILE").map(PathBuf::from),
            tie_break: match get("RENEWGATE_TIE_BREAK").as_deref() {
                Some("certificate-id") => TieBreakPolicy::CertificateId,
                _ => TieBreakPolicy::FirstSeen,
            },
            app_store_connect: AppStoreConnectSettings {
                base_url: get("ASC_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
                token: get("ASC_API_TOKEN"),
                timeout_seconds: parse_u64(get("ASC_TIMEOUT"), 30),
            },
            signing: SigningSettings {
                fastlane_path: get("FASTLANE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("fastlane")),
                team_id: get("FASTLANE_TEAM_ID"),
                username: get("FASTLANE_USER"),
                certificates_dir: get("FASTLANE_CERTIFICATES_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| state_dir.join("certificates")),
                profiles_dir: get("FASTLANE_PROFILES_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| state_dir.join("profiles")),
                p12_password: get("FASTLANE_P12_PASSWORD"),
                api_key_id: get("ASC_KEY_ID"),
                api_issuer_id: get("ASC_ISSUER_ID"),
                api_key_path: get("ASC_KEY_PATH").map(PathBuf::from),
            },
            secrets: SecretStoreSettings {
                backend: match get("RENEWGATE_SECRET_BACKEND").as_deref() {
                    Some("kubernetes") => SecretBackend::Kubernetes,
                    _ => SecretBackend::File,
                },
                base_name: get("RENEWGATE_SECRET_BASE_NAME")
                    .unwrap_or_else(|| "apple-certificate-update".to_string()),
                directory: get("RENEWGATE_SECRET_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| state_dir.join("secrets")),
                namespace: get("RENEWGATE_SECRET_NAMESPACE")
                    .unwrap_or_else(|| "default".to_string()),
                updated_by: get("RENEWGATE_UPDATED_BY")
                    .unwrap_or_else(|| "github-actions".to_string()),
            },
            project: ProjectSettings {
                root: get("RENEWGATE_PROJECT_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(".")),
                bundle_id_suffixes: get("RENEWGATE_BUNDLE_ID_SUFFIXES")
                    .map(|v| parse_suffixes(&v))
                    .unwrap_or_default(),
            },
            approval: ApprovalSettings {
                workflow_url: get("RENEWGATE_APPROVAL_WORKFLOW_URL"),
                workflow_file: get("RENEWGATE_APPROVAL_WORKFLOW"),
            },
            notifications,
            run: RunContext {
                server_url: get("GITHUB_SERVER_URL"),
                repository: get("GITHUB_REPOSITORY"),
                run_id: get("GITHUB_RUN_ID"),
                actor: get("GITHUB_ACTOR"),
            },
            state_dir,
        }
    }

    /// Environment defaults overlaid with the keys present in a YAML file
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = Self::from_env();
        match path {
            Some(path) => config.merge_file(path),
            None => Ok(config),
        }
    }

    pub fn merge_file(self, path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Merging configuration from {}", path.display());
        self.merge_yaml(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn merge_yaml(self, raw: &str) -> Result<Self, serde_yaml::Error> {
        let overlay: serde_yaml::Value = serde_yaml::from_str(raw)?;
        if overlay.is_null() {
            return Ok(self);
        }

        let run = self.run.clone();
        let mut base = serde_yaml::to_value(&self)?;
        merge_values(&mut base, overlay);

        let mut merged: Self = serde_yaml::from_value(base)?;
        merged.run = run;
        Ok(merged)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environment.trim().is_empty() {
            return Err(ConfigError::Invalid("environment must not be empty".into()));
        }
        if self.secrets.base_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "secrets.baseName must not be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn directory_config(&self) -> AppStoreConnectConfig {
        AppStoreConnectConfig {
            base_url: self.app_store_connect.base_url.clone(),
            token: self.app_store_connect.token.clone(),
            timeout_seconds: self.app_store_connect.timeout_seconds,
        }
    }

    pub fn bundle_id_suffix(&self) -> Option<&str> {
        self.project
            .bundle_id_suffixes
            .get(&self.environment)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Where the `credentials` stage writes the API key for later stages
    pub fn api_key_path(&self) -> PathBuf {
        self.signing
            .api_key_path
            .clone()
            .unwrap_or_else(|| self.state_dir.join("AuthKey.p8"))
    }

    pub fn api_credentials_secret(&self) -> String {
        crate::credentials::secret_name(&self.secrets.base_name, &self.environment)
    }

    pub fn approvals_dir(&self) -> PathBuf {
        self.state_dir.join("approvals")
    }

    /// Where a human answers approval requests, when it can be derived
    pub fn approval_workflow_url(&self) -> Option<String> {
        if let Some(url) = &self.approval.workflow_url {
            return Some(url.clone());
        }
        let file = self
            .approval
            .workflow_file
            .as_deref()
            .unwrap_or(DEFAULT_APPROVAL_WORKFLOW);
        Some(format!(
            "{}/actions/workflows/{}",
            self.run.repository_url()?,
            file
        ))
    }
}

impl Default for AppStoreConnectSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token: None,
            timeout_seconds: 30,
        }
    }
}

fn merge_values(base: &mut serde_yaml::Value, overlay: serde_yaml::Value) {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(base), serde_yaml::Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    },
                }
            }
        },
        (base, overlay) => *base = overlay,
    }
}

// Helper functions for parsing configuration values
fn parse_bool(value: Option<String>, default: bool) -> bool {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn parse_u64(value: Option<String>, default: u64) -> u64 {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn parse_u32(value: Option<String>, default: u32) -> u32 {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// `develop=.uat,staging=.stg`
fn parse_suffixes(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(env, suffix)| (env.trim().to_string(), suffix.trim().to_string()))
        .filter(|(env, _)| !env.is_empty())
        .collect()
}
