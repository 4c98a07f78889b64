//! App Store Connect API credentials.
//!
//! The API key lives in the secret store as `{base}/api-credentials-{suffix}`
//! with `key_id`, `issuer_id` and `private_key` (a PKCS#8 `.p8` PEM). The
//! `credentials` stage writes the key to disk for fastlane; directory calls
//! authenticate with a short-lived ES256 token minted from the same key.

use crate::config::RenewalConfig;
use crate::publisher::secret_suffix;
use crate::secrets::SecretStore;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub const TOKEN_AUDIENCE: &str = "appstoreconnect-v1";
/// App Store Connect refuses tokens living longer than 20 minutes
pub const TOKEN_LIFETIME_MINUTES: i64 = 20;

const REQUIRED_FIELDS: [&str; 3] = ["key_id", "issuer_id", "private_key"];

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("Secret {0} does not exist")]
    SecretNotFound(String),
    #[error("Secret {name} is missing {}", .missing.join(", "))]
    MissingFields { name: String, missing: Vec<String> },
    #[error("Secret {name} is malformed: {source}")]
    Malformed {
        name: String,
        source: serde_json::Error,
    },
    #[error("Failed to access {}: {source}", .path.display())]
    KeyFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to sign API token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
    #[error("Secret store error: {0:#}")]
    Store(#[source] anyhow::Error),
}

#[derive(Clone, Deserialize)]
pub struct ApiCredentials {
    pub key_id: String,
    pub issuer_id: String,
    pub private_key: String,
}

impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("key_id", &self.key_id)
            .field("issuer_id", &self.issuer_id)
            .field("private_key", &"******")
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iss: String,
    iat: i64,
    exp: i64,
    aud: String,
}

/// `{base}/api-credentials-{prd|environment}`
pub fn secret_name(base_name: &str, environment: &str) -> String {
    format!("{}/api-credentials-{}", base_name, secret_suffix(environment))
}

/// Read the API key for an environment from the secret store
pub async fn fetch(store: &dyn SecretStore, name: &str) -> Result<ApiCredentials, CredentialsError> {
    debug!("Fetching API credentials from {}", name);
    let value = store
        .get(name)
        .await
        .map_err(CredentialsError::Store)?
        .ok_or_else(|| CredentialsError::SecretNotFound(name.to_string()))?;
    ApiCredentials::from_value(name, value)
}

/// Bearer token for directory calls: an explicit token wins, otherwise one
/// is minted from the key configured by `ASC_KEY_ID`, `ASC_ISSUER_ID` and the
/// key file. `None` when neither is configured.
pub fn configured_token(
    config: &RenewalConfig,
    now: DateTime<Utc>,
) -> Result<Option<String>, CredentialsError> {
    if let Some(token) = &config.app_store_connect.token {
        return Ok(Some(token.clone()));
    }

    let (Some(key_id), Some(issuer_id)) = (
        config.signing.api_key_id.as_deref(),
        config.signing.api_issuer_id.as_deref(),
    ) else {
        return Ok(None);
    };

    let credentials = ApiCredentials::load(key_id, issuer_id, &config.api_key_path())?;
    credentials.mint_token(now).map(Some)
}

impl ApiCredentials {
    fn from_value(name: &str, value: serde_json::Value) -> Result<Self, CredentialsError> {
        let missing: Vec<String> = REQUIRED_FIELDS
            .iter()
            .filter(|field| {
                value
                    .get(**field)
                    .and_then(|v| v.as_str())
                    .is_none_or(|v| v.trim().is_empty())
            })
            .map(|field| field.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(CredentialsError::MissingFields {
                name: name.to_string(),
                missing,
            });
        }

        serde_json::from_value(value).map_err(|source| CredentialsError::Malformed {
            name: name.to_string(),
            source,
        })
    }

    /// Credentials whose private key was written by an earlier stage
    pub fn load(key_id: &str, issuer_id: &str, key_path: &Path) -> Result<Self, CredentialsError> {
        let private_key = fs::read_to_string(key_path).map_err(|source| CredentialsError::KeyFile {
            path: key_path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            key_id: key_id.to_string(),
            issuer_id: issuer_id.to_string(),
            private_key,
        })
    }

    /// Write the private key readable by the owner only
    pub fn write_key(&self, path: &Path) -> Result<(), CredentialsError> {
        let io_error = |source: std::io::Error| CredentialsError::KeyFile {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        // A key left by an earlier run is read-only
        if path.exists() {
            fs::remove_file(path).map_err(io_error)?;
        }

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o400);
        }
        let mut file = options.open(path).map_err(io_error)?;
        file.write_all(self.private_key.as_bytes()).map_err(io_error)?;

        info!("Wrote API key {} to {}", self.key_id, path.display());
        Ok(())
    }

    /// ES256 token for the App Store Connect API, valid for twenty minutes from `now`
    pub fn mint_token(&self, now: DateTime<Utc>) -> Result<String, CredentialsError> {
        let claims = Claims {
            iss: self.issuer_id.clone(),
            iat: now.timestamp(),
            exp: (now + Duration::minutes(TOKEN_LIFETIME_MINUTES)).timestamp(),
            aud: TOKEN_AUDIENCE.to_string(),
        };

        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.key_id.clone());

        let key = EncodingKey::from_ec_pem(self.private_key.as_bytes())?;
        Ok(jsonwebtoken::encode(&header, &claims, &key)?)
    }
}
