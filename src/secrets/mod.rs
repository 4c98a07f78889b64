use crate::approval::write_atomic;
use anyhow::{Context, Result, anyhow};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

/// Key holding the JSON document inside a Kubernetes Secret
pub const PAYLOAD_KEY: &str = "payload.json";

/// Named JSON documents with upsert semantics
#[async_trait::async_trait]
pub trait SecretStore: Send + Sync {
    /// Create the secret or replace its whole payload
    async fn put(&self, name: &str, payload: &serde_json::Value) -> Result<()>;

    async fn get(&self, name: &str) -> Result<Option<serde_json::Value>>;
}

/// One JSON file per secret below a root directory.
/// Slashes in a name become subdirectories.
pub struct FileSecretStore {
    root: PathBuf,
}

impl FileSecretStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        let valid = !name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(anyhow!("Invalid secret name '{}'", name));
        }
        Ok(self.root.join(format!("{}.json", name)))
    }
}

#[async_trait::async_trait]
impl SecretStore for FileSecretStore {
    async fn put(&self, name: &str, payload: &serde_json::Value) -> Result<()> {
        let path = self.path_for(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let existed = path.exists();
        let json = serde_json::to_vec_pretty(payload).context("Failed to serialize secret")?;
        write_atomic(&path, &json)?;

        if existed {
            info!("Updated secret {}", name);
        } else {
            info!("Created secret {}", name);
        }
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<serde_json::Value>> {
        let path = self.path_for(name)?;
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        let value = serde_json::from_slice(&raw)
            .with_context(|| format!("Failed to parse secret {}", name))?;
        Ok(Some(value))
    }
}

/// Kubernetes Secrets in one namespace
pub struct KubernetesSecretStore {
    api: Api<Secret>,
    namespace: String,
}

impl KubernetesSecretStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    /// Connect using the ambient kubeconfig or in-cluster service account
    pub async fn connect(namespace: &str) -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("Failed to create Kubernetes client")?;
        Ok(Self::new(client, namespace))
    }
}

/// Map a hierarchical secret name onto a valid Kubernetes object name
pub fn kubernetes_name(name: &str) -> String {
    let mapped: String = name
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    mapped
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

#[async_trait::async_trait]
impl SecretStore for KubernetesSecretStore {
    async fn put(&self, name: &str, payload: &serde_json::Value) -> Result<()> {
        let object_name = kubernetes_name(name);
        let json = serde_json::to_string(payload).context("Failed to serialize secret")?;

        let mut string_data = BTreeMap::new();
        string_data.insert(PAYLOAD_KEY.to_string(), json);

        let secret = Secret {
            metadata: kube::api::ObjectMeta {
                name: Some(object_name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(
                    [("app".to_string(), "renewgate".to_string())]
                        .into_iter()
                        .collect(),
                ),
                annotations: Some(
                    [("renewgate/secret-name".to_string(), name.to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            string_data: Some(string_data),
            ..Default::default()
        };

        match self.api.get_opt(&object_name).await? {
            Some(existing) => {
                let mut secret = secret;
                secret.metadata.resource_version = existing.metadata.resource_version;
                self.api
                    .replace(&object_name, &Default::default(), &secret)
                    .await
                    .with_context(|| format!("Failed to update Secret {}", object_name))?;
                info!("Updated Secret {}/{}", self.namespace, object_name);
            },
            None => {
                self.api
                    .create(&Default::default(), &secret)
                    .await
                    .with_context(|| format!("Failed to create Secret {}", object_name))?;
                info!("Created Secret {}/{}", self.namespace, object_name);
            },
        }

        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<serde_json::Value>> {
        let object_name = kubernetes_name(name);
        let Some(secret) = self.api.get_opt(&object_name).await? else {
            debug!("Secret {} not found", object_name);
            return Ok(None);
        };

        let bytes = secret
            .data
            .unwrap_or_default()
            .remove(PAYLOAD_KEY)
            .ok_or_else(|| anyhow!("Secret {} has no {} key", object_name, PAYLOAD_KEY))?;

        let value = serde_json::from_slice(&bytes.0)
            .with_context(|| format!("Failed to parse Secret {}", object_name))?;
        Ok(Some(value))
    }
}
