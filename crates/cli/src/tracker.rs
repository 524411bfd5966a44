//! A work-item tracker backed by a local directory.
//!
//! ```text
//! <dir>/
//!   approvals/<work-item>/<node>   "approved" or "rejected"
//!   status.jsonl                   one StatusUpdate per line
//!   escalations.jsonl              one Escalation per line
//!   sub_items.jsonl                one SubWorkItemRequest per line, id = line number
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use pipeline::ports::{GateSignal, SubWorkItemRequest, TrackerError, WorkItemTracker};
use pipeline::report::{Escalation, StatusUpdate};
use pipeline::{NodeId, RetryPolicy, SubWorkItemId, WorkItemId};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub struct LocalTracker {
    dir: PathBuf,
    // Serialises appends and sub-item numbering.
    append: Mutex<()>,
}

fn tracker_error(action: &str, path: &Path, error: impl std::fmt::Display) -> TrackerError {
    TrackerError {
        message: format!("failed to {action} {}: {error}", path.display()),
        policy: RetryPolicy::NonRetryable,
    }
}

impl LocalTracker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            append: Mutex::new(()),
        }
    }

    fn approval_path(&self, work_item: WorkItemId, node: &NodeId) -> PathBuf {
        self.dir
            .join("approvals")
            .join(work_item.to_string())
            .join(node.as_str())
    }

    /// Records a human decision for a gated node.
    pub async fn record_decision(
        &self,
        work_item: WorkItemId,
        node: &NodeId,
        approved: bool,
    ) -> Result<(), TrackerError> {
        let path = self.approval_path(work_item, node);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| tracker_error("create", parent, e))?;
        }
        let decision = if approved { "approved" } else { "rejected" };
        tokio::fs::write(&path, decision)
            .await
            .map_err(|e| tracker_error("write", &path, e))
    }

    /// Appends one JSON line and returns the number of lines now in the file.
    async fn append_line(&self, file: &str, value: &impl Serialize) -> Result<u64, TrackerError> {
        let _guard = self.append.lock().await;
        let path = self.dir.join(file);
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| tracker_error("create", &self.dir, e))?;
        let existing = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text.lines().filter(|line| !line.trim().is_empty()).count() as u64,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(tracker_error("read", &path, e)),
        };
        let mut line = serde_json::to_string(value).map_err(|e| tracker_error("encode", &path, e))?;
        line.push('\n');
        let mut handle = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| tracker_error("open", &path, e))?;
        handle
            .write_all(line.as_bytes())
            .await
            .map_err(|e| tracker_error("append to", &path, e))?;
        handle.flush().await.map_err(|e| tracker_error("flush", &path, e))?;
        Ok(existing + 1)
    }
}

#[async_trait]
impl WorkItemTracker for LocalTracker {
    async fn gate_signal(&self, work_item: WorkItemId, node: &NodeId) -> Result<GateSignal, TrackerError> {
        let path = self.approval_path(work_item, node);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(GateSignal::Pending),
            Err(e) => return Err(tracker_error("read", &path, e)),
        };
        Ok(match text.trim() {
            "approved" => GateSignal::Approved,
            "rejected" => GateSignal::Rejected,
            other => {
                warn!(path = %path.display(), content = other, "Unrecognised approval file, treating as pending");
                GateSignal::Pending
            }
        })
    }

    async fn post_status(&self, update: StatusUpdate) -> Result<(), TrackerError> {
        info!(
            node = update.node.as_ref().map(NodeId::as_str).unwrap_or("-"),
            status = %update.status,
            "{}",
            update.message
        );
        self.append_line("status.jsonl", &update).await.map(|_| ())
    }

    async fn post_escalation(&self, escalation: Escalation) -> Result<(), TrackerError> {
        warn!(reason = %escalation.reason, nodes = escalation.nodes.len(), "Run escalated");
        self.append_line("escalations.jsonl", &escalation).await.map(|_| ())
    }

    async fn create_sub_work_item(&self, request: SubWorkItemRequest) -> Result<SubWorkItemId, TrackerError> {
        let number = self.append_line("sub_items.jsonl", &request).await?;
        Ok(SubWorkItemId::new(number))
    }
}
