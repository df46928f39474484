//! On-disk flow repository for the Harbor compute node
//!
//! Every flow is stored as one pretty-printed JSON document named after its
//! id. Writes go to a temporary file that is renamed over the previous
//! version, so a crash never leaves a truncated document behind, and a node
//! restarted with the same state directory resumes its flows.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use harbor_core::domain::flow::{Flow, FlowId, FlowMutation};
use harbor_core::domain::repository::FlowRepository;
use harbor_core::CoreError;

const EXTENSION: &str = "json";

/// Flow repository persisting one JSON file per flow
#[derive(Debug)]
pub struct JsonFileFlowRepository {
    dir: PathBuf,
    // Serializes every read-modify-write cycle
    lock: Mutex<()>,
}

impl JsonFileFlowRepository {
    /// Open (and create if needed) a repository rooted at `dir`
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        debug!(dir = %dir.display(), "Opened flow state directory");

        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    /// Directory holding the flow documents
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // Percent-encodes every byte outside `[A-Za-z0-9._-]`; the mapping is injective.
    fn path_for(&self, id: &FlowId) -> PathBuf {
        let mut file_name = String::with_capacity(id.0.len());
        for byte in id.0.bytes() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
                file_name.push(char::from(byte));
            } else {
                file_name.push_str(&format!("%{byte:02X}"));
            }
        }
        self.dir.join(format!("{file_name}.{EXTENSION}"))
    }

    async fn read(&self, path: &Path) -> Result<Option<Flow>, CoreError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, path: &Path, flow: &Flow) -> Result<(), CoreError> {
        let tmp_path = path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(flow)?;
        fs::write(&tmp_path, bytes).await?;
        fs::rename(&tmp_path, path).await?;
        Ok(())
    }
}

#[async_trait]
impl FlowRepository for JsonFileFlowRepository {
    async fn get_flow(&self, id: &FlowId) -> Result<Option<Flow>, CoreError> {
        let _guard = self.lock.lock().await;
        self.read(&self.path_for(id)).await
    }

    async fn set_flow(&self, id: &FlowId, flow: Flow) -> Result<(), CoreError> {
        let _guard = self.lock.lock().await;
        self.write(&self.path_for(id), &flow).await
    }

    async fn delete_flow(&self, id: &FlowId) -> Result<(), CoreError> {
        let _guard = self.lock.lock().await;
        match fs::remove_file(self.path_for(id)).await {
            Ok(()) => {
                debug!(flow_id = %id, "Flow deleted");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_flows(&self) -> Result<Vec<Flow>, CoreError> {
        let _guard = self.lock.lock().await;
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut flows = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                continue;
            }
            match self.read(&path).await {
                Ok(Some(flow)) => flows.push(flow),
                Ok(None) => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Skipping unreadable flow document");
                }
            }
        }

        flows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(flows)
    }

    async fn mutate(&self, id: &FlowId, mutation: FlowMutation) -> Result<Flow, CoreError> {
        let _guard = self.lock.lock().await;
        let path = self.path_for(id);

        let mut flow = self
            .read(&path)
            .await?
            .ok_or_else(|| CoreError::FlowNotFound(id.to_string()))?;
        flow.apply(mutation)?;
        self.write(&path, &flow).await?;
        Ok(flow)
    }
}
