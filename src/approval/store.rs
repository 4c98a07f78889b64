use crate::models::ApprovalRequest;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

const LIVE_POINTER: &str = "live";

/// Persistence for approval requests.
///
/// Records are keyed by approval id. Exactly one of them is the live request,
/// the one a new approval decision is checked against; `save_live` moves the
/// pointer (last writer wins).
#[async_trait::async_trait]
pub trait ApprovalStore: Send + Sync {
    /// Persist a new request and make it the live one
    async fn save_live(&self, request: &ApprovalRequest) -> Result<()>;

    /// Overwrite an existing record without touching the live pointer
    async fn update(&self, request: &ApprovalRequest) -> Result<()>;

    async fn load(&self, approval_id: &str) -> Result<Option<ApprovalRequest>>;

    async fn live(&self) -> Result<Option<ApprovalRequest>>;
}

#[derive(Default)]
struct MemoryState {
    requests: HashMap<String, ApprovalRequest>,
    live: Option<String>,
}

/// In-process store, used by tests and dry runs
#[derive(Clone, Default)]
pub struct MemoryApprovalStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.requests.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait::async_trait]
impl ApprovalStore for MemoryApprovalStore {
    async fn save_live(&self, request: &ApprovalRequest) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .requests
            .insert(request.approval_id.clone(), request.clone());
        state.live = Some(request.approval_id.clone());
        Ok(())
    }

    async fn update(&self, request: &ApprovalRequest) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .requests
            .insert(request.approval_id.clone(), request.clone());
        Ok(())
    }

    async fn load(&self, approval_id: &str) -> Result<Option<ApprovalRequest>> {
        Ok(self.state.read().await.requests.get(approval_id).cloned())
    }

    async fn live(&self) -> Result<Option<ApprovalRequest>> {
        let state = self.state.read().await;
        Ok(state
            .live
            .as_ref()
            .and_then(|id| state.requests.get(id))
            .cloned())
    }
}

/// Directory-backed store: one JSON document per request plus a `live` pointer file
pub struct FileApprovalStore {
    root: PathBuf,
}

impl FileApprovalStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create approval store at {}", root.display()))?;
        Ok(Self { root })
    }

    fn record_path(&self, approval_id: &str) -> PathBuf {
        self.root.join(format!("{}.json", sanitize(approval_id)))
    }

    fn write_record(&self, request: &ApprovalRequest) -> Result<()> {
        let json = serde_json::to_vec_pretty(request)
            .context("Failed to serialize approval request")?;
        write_atomic(&self.record_path(&request.approval_id), &json)
    }
}

#[async_trait::async_trait]
impl ApprovalStore for FileApprovalStore {
    async fn save_live(&self, request: &ApprovalRequest) -> Result<()> {
        self.write_record(request)?;
        write_atomic(
            &self.root.join(LIVE_POINTER),
            request.approval_id.as_bytes(),
        )?;
        debug!(
            "Stored approval request {} as live in {}",
            request.approval_id,
            self.root.display()
        );
        Ok(())
    }

    async fn update(&self, request: &ApprovalRequest) -> Result<()> {
        self.write_record(request)
    }

    async fn load(&self, approval_id: &str) -> Result<Option<ApprovalRequest>> {
        let path = self.record_path(approval_id);
        if !path.exists() {
            return Ok(None);
        }

        let raw = fs::read(&path)
            .with_context(|| format!("Failed to read approval request {}", path.display()))?;
        let request = serde_json::from_slice(&raw)
            .with_context(|| format!("Failed to parse approval request {}", path.display()))?;
        Ok(Some(request))
    }

    async fn live(&self) -> Result<Option<ApprovalRequest>> {
        let pointer = self.root.join(LIVE_POINTER);
        if !pointer.exists() {
            return Ok(None);
        }

        let approval_id = fs::read_to_string(&pointer)
            .with_context(|| format!("Failed to read {}", pointer.display()))?;
        self.load(approval_id.trim()).await
    }
}

/// Approval ids are opaque; keep them from escaping the store directory
fn sanitize(approval_id: &str) -> String {
    approval_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

/// Write to a sibling temp file then rename, so readers never see a torn record
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}
