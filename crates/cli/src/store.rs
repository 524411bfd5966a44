//! Run snapshots as one JSON file per run.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use pipeline::ports::{StateStore, StateStoreError};
use pipeline::PipelineRunId;
use serde_json::Value;
use tracing::debug;

pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, run_id: PipelineRunId) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }
}

fn store_error(action: &str, path: &Path, error: impl std::fmt::Display) -> StateStoreError {
    StateStoreError {
        message: format!("failed to {action} {}: {error}", path.display()),
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn read_state(&self, run_id: PipelineRunId) -> Result<Option<Value>, StateStoreError> {
        let path = self.path_for(run_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(store_error("read", &path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| store_error("parse", &path, e))
    }

    /// Writes to a sibling temporary file and renames it over the snapshot,
    /// so a crash mid-write leaves the previous snapshot intact.
    async fn write_state(&self, run_id: PipelineRunId, snapshot: Value) -> Result<(), StateStoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| store_error("create", &self.dir, e))?;
        let path = self.path_for(run_id);
        let staging = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(&snapshot).map_err(|e| store_error("encode", &path, e))?;
        tokio::fs::write(&staging, bytes)
            .await
            .map_err(|e| store_error("write", &staging, e))?;
        tokio::fs::rename(&staging, &path)
            .await
            .map_err(|e| store_error("replace", &path, e))?;
        debug!(path = %path.display(), "Snapshot written");
        Ok(())
    }
}
