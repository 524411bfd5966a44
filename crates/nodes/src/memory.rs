//! In-memory [`StateStore`] for tests and single-process embedding.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use pipeline::ports::{StateStore, StateStoreError};
use pipeline::PipelineRunId;
use serde_json::Value;

#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    snapshots: Mutex<HashMap<PipelineRunId, Value>>,
    writes: Mutex<u64>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of snapshots written so far.
    pub fn write_count(&self) -> u64 {
        self.writes.lock().map(|count| *count).unwrap_or(0)
    }

    /// Latest snapshot of `run_id`, if any.
    pub fn snapshot(&self, run_id: PipelineRunId) -> Option<Value> {
        self.snapshots
            .lock()
            .ok()
            .and_then(|snapshots| snapshots.get(&run_id).cloned())
    }

    /// Replaces the stored snapshot, e.g. to simulate a crash at a given point.
    pub fn insert(&self, run_id: PipelineRunId, snapshot: Value) {
        if let Ok(mut snapshots) = self.snapshots.lock() {
            snapshots.insert(run_id, snapshot);
        }
    }
}

fn poisoned() -> StateStoreError {
    StateStoreError {
        message: "state store lock poisoned".into(),
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn read_state(&self, run_id: PipelineRunId) -> Result<Option<Value>, StateStoreError> {
        let snapshots = self.snapshots.lock().map_err(|_| poisoned())?;
        Ok(snapshots.get(&run_id).cloned())
    }

    async fn write_state(&self, run_id: PipelineRunId, snapshot: Value) -> Result<(), StateStoreError> {
        self.snapshots
            .lock()
            .map_err(|_| poisoned())?
            .insert(run_id, snapshot);
        *self.writes.lock().map_err(|_| poisoned())? += 1;
        Ok(())
    }
}
