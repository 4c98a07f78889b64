use crate::models::{CertificateKind, CertificateRecord, ProfileRecord};
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, FixedOffset};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.appstoreconnect.apple.com/v1";

/// Read-only view of the vendor's certificate and profile catalogue
#[async_trait::async_trait]
pub trait CertificateDirectory: Send + Sync {
    /// All certificates visible to the account, any type
    async fn list_certificates(&self) -> Result<Vec<CertificateRecord>>;

    /// Profiles linked to a certificate
    async fn list_profiles(&self, certificate_id: &str) -> Result<Vec<ProfileRecord>>;
}

#[derive(Debug, Clone)]
pub struct AppStoreConnectConfig {
    pub base_url: String,
    /// Bearer token minted by the pipeline for this run
    pub token: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for AppStoreConnectConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token: None,
            timeout_seconds: 30,
        }
    }
}

// JSON:API envelopes, only the fields the evaluator relies on

#[derive(Debug, Deserialize)]
struct Document<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    #[serde(default)]
    included: Vec<IncludedResource>,
}

#[derive(Debug, Deserialize)]
struct CertificateResource {
    id: String,
    attributes: CertificateAttributes,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CertificateAttributes {
    #[serde(default)]
    name: Option<String>,
    certificate_type: String,
    expiration_date: String,
}

#[derive(Debug, Deserialize)]
struct ProfileResource {
    id: String,
    #[serde(default)]
    attributes: ProfileAttributes,
    #[serde(default)]
    relationships: Option<ProfileRelationships>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileAttributes {
    #[serde(default)]
    name: Option<String>,
    /// Some payloads inline the bundle id object on the profile
    #[serde(default)]
    bundle_id: Option<InlineBundleId>,
}

#[derive(Debug, Deserialize)]
struct InlineBundleId {
    identifier: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileRelationships {
    bundle_id: Option<Relationship>,
}

#[derive(Debug, Deserialize)]
struct Relationship {
    data: Option<ResourceIdentifier>,
}

#[derive(Debug, Deserialize)]
struct ResourceIdentifier {
    id: String,
}

#[derive(Debug, Deserialize)]
struct IncludedResource {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    #[serde(default)]
    attributes: serde_json::Value,
}

/// App Store Connect writes offsets without a colon (`+0000`), which RFC 3339 rejects
fn parse_expiration_date(raw: &str) -> Result<DateTime<FixedOffset>, chrono::ParseError> {
    DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z")
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
}

impl TryFrom<CertificateResource> for CertificateRecord {
    type Error = anyhow::Error;

    fn try_from(resource: CertificateResource) -> Result<Self> {
        let expires_at = parse_expiration_date(&resource.attributes.expiration_date)
            .with_context(|| {
                format!(
                    "Invalid expirationDate '{}' on certificate {}",
                    resource.attributes.expiration_date, resource.id
                )
            })?;
        let kind = resource
            .attributes
            .certificate_type
            .parse::<CertificateKind>()
            .with_context(|| format!("Missing certificateType on certificate {}", resource.id))?;

        Ok(CertificateRecord {
            name: resource
                .attributes
                .name
                .unwrap_or_else(|| resource.id.clone()),
            id: resource.id,
            kind,
            expires_at,
        })
    }
}

fn profiles_from_document(document: Document<ProfileResource>) -> Vec<ProfileRecord> {
    let bundle_ids: HashMap<&str, &str> = document
        .included
        .iter()
        .filter(|resource| resource.kind == "bundleIds")
        .filter_map(|resource| {
            resource
                .attributes
                .get("identifier")
                .and_then(|v| v.as_str())
                .map(|identifier| (resource.id.as_str(), identifier))
        })
        .collect();

    document
        .data
        .iter()
        .map(|profile| {
            let inline = profile
                .attributes
                .bundle_id
                .as_ref()
                .and_then(|b| b.identifier.clone());
            let related = profile
                .relationships
                .as_ref()
                .and_then(|r| r.bundle_id.as_ref())
                .and_then(|r| r.data.as_ref())
                .and_then(|d| bundle_ids.get(d.id.as_str()))
                .map(|identifier| identifier.to_string());

            ProfileRecord {
                id: profile.id.clone(),
                name: profile
                    .attributes
                    .name
                    .clone()
                    .unwrap_or_else(|| profile.id.clone()),
                application_id: inline.or(related),
            }
        })
        .collect()
}

/// REST client for the App Store Connect certificate and profile endpoints
pub struct AppStoreConnectClient {
    config: AppStoreConnectConfig,
    client: Client,
}

impl AppStoreConnectClient {
    pub fn new(config: AppStoreConnectConfig) -> Result<Self> {
        if config.token.as_deref().unwrap_or_default().is_empty() {
            return Err(anyhow!("App Store Connect API token is required"));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { config, client })
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), endpoint);
        let token = self
            .config
            .token
            .as_deref()
            .ok_or_else(|| anyhow!("App Store Connect API token not configured"))?;

        debug!("Querying App Store Connect: {}", url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .header("Content-Type", "application/json")
            .query(query)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to query App Store Connect: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "App Store Connect request {} failed {}: {}",
                endpoint,
                status,
                body
            ));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| anyhow!("Failed to parse App Store Connect response: {}", e))
    }
}

#[async_trait::async_trait]
impl CertificateDirectory for AppStoreConnectClient {
    async fn list_certificates(&self) -> Result<Vec<CertificateRecord>> {
        let document: Document<CertificateResource> =
            self.get("/certificates", &[("limit", "200")]).await?;

        document
            .data
            .into_iter()
            .map(CertificateRecord::try_from)
            .collect()
    }

    async fn list_profiles(&self, certificate_id: &str) -> Result<Vec<ProfileRecord>> {
        let document: Document<ProfileResource> = self
            .get(
                "/profiles",
                &[
                    ("filter[certificates]", certificate_id),
                    ("include", "bundleId"),
                    ("limit", "200"),
                ],
            )
            .await?;

        let profiles = profiles_from_document(document);
        let unbound = profiles
            .iter()
            .filter(|p| p.application_id.is_none())
            .count();
        if unbound > 0 {
            warn!(
                "{} profile(s) linked to certificate {} carry no bundle identifier",
                unbound, certificate_id
            );
        }

        Ok(profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_requires_token() {
        let client = AppStoreConnectClient::new(AppStoreConnectConfig::default());
        assert!(client.is_err());

        let client = AppStoreConnectClient::new(AppStoreConnectConfig {
            token: Some("token".to_string()),
            ..Default::default()
        });
        assert!(client.is_ok());
    }

    #[test]
    fn test_certificate_resource_conversion() {
        let document: Document<CertificateResource> = serde_json::from_value(json!({
            "data": [{
                "id": "CERT1",
                "type": "certificates",
                "attributes": {
                    "name": "iOS Distribution: Example Inc",
                    "certificateType": "IOS_DISTRIBUTION",
                    "expirationDate": "2025-06-01T12:00:00.000+09:00"
                }
            }]
        }))
        .unwrap();

        let records: Vec<CertificateRecord> = document
            .data
            .into_iter()
            .map(CertificateRecord::try_from)
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, CertificateKind::Distribution);
        assert_eq!(records[0].expires_at.offset().local_minus_utc(), 9 * 3600);
    }

    #[test]
    fn test_expiration_date_formats() {
        let compact = parse_expiration_date("2026-06-01T12:00:00.000+0000").unwrap();
        assert_eq!(compact.offset().local_minus_utc(), 0);
        assert_eq!(compact.to_rfc3339(), "2026-06-01T12:00:00+00:00");

        let no_fraction = parse_expiration_date("2026-06-01T12:00:00-0700").unwrap();
        assert_eq!(no_fraction.offset().local_minus_utc(), -7 * 3600);

        let zulu = parse_expiration_date("2026-06-01T12:00:00Z").unwrap();
        assert_eq!(zulu, compact);
    }

    #[test]
    fn test_listing_accepts_compact_offsets() {
        let document: Document<CertificateResource> = serde_json::from_value(json!({
            "data": [
                {
                    "id": "CERT1",
                    "attributes": {
                        "certificateType": "IOS_DISTRIBUTION",
                        "expirationDate": "2026-06-01T12:00:00.000+0000"
                    }
                },
                {
                    "id": "CERT2",
                    "attributes": {
                        "certificateType": "DEVELOPMENT",
                        "expirationDate": "2026-01-15T08:30:00.000+09:00"
                    }
                }
            ]
        }))
        .unwrap();

        let records: Vec<CertificateRecord> = document
            .data
            .into_iter()
            .map(CertificateRecord::try_from)
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name, "CERT1");
        assert_eq!(records[0].expires_at.offset().local_minus_utc(), 0);
    }

    #[test]
    fn test_invalid_expiration_date_is_an_error() {
        let resource: CertificateResource = serde_json::from_value(json!({
            "id": "CERT1",
            "attributes": {
                "certificateType": "IOS_DISTRIBUTION",
                "expirationDate": "next tuesday"
            }
        }))
        .unwrap();

        assert!(CertificateRecord::try_from(resource).is_err());
    }

    #[test]
    fn test_profiles_resolve_inline_and_included_bundle_ids() {
        let document: Document<ProfileResource> = serde_json::from_value(json!({
            "data": [
                {
                    "id": "P1",
                    "attributes": {
                        "name": "App Store app",
                        "bundleId": { "identifier": "com.example.app" }
                    }
                },
                {
                    "id": "P2",
                    "attributes": { "name": "App Store widget" },
                    "relationships": { "bundleId": { "data": { "type": "bundleIds", "id": "B2" } } }
                },
                {
                    "id": "P3",
                    "attributes": { "name": "Orphan" }
                }
            ],
            "included": [
                { "type": "bundleIds", "id": "B2", "attributes": { "identifier": "com.example.widget" } }
            ]
        }))
        .unwrap();

        let profiles = profiles_from_document(document);
        assert_eq!(
            profiles[0].application_id.as_deref(),
            Some("com.example.app")
        );
        assert_eq!(
            profiles[1].application_id.as_deref(),
            Some("com.example.widget")
        );
        assert_eq!(profiles[2].application_id, None);
    }
}
