//! In-memory result store.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use triage_core::{AnalyzerResult, TaskId};

use super::{CommitOutcome, Result, ResultStore};

/// Result store that lives for the duration of the process.
#[derive(Default)]
pub struct MemoryResultStore {
    results: Mutex<HashMap<TaskId, AnalyzerResult>>,
}

impl MemoryResultStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn commit(&self, result: AnalyzerResult) -> Result<CommitOutcome> {
        let mut results = self.results.lock().await;
        if let Some(existing) = results.get(&result.task_id) {
            return Ok(CommitOutcome::AlreadyCommitted(existing.clone()));
        }
        results.insert(result.task_id, result.clone());
        Ok(CommitOutcome::Committed(result))
    }

    async fn get(&self, id: TaskId) -> Result<Option<AnalyzerResult>> {
        Ok(self.results.lock().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<AnalyzerResult>> {
        let mut all: Vec<_> = self.results.lock().await.values().cloned().collect();
        all.sort_by_key(|r| r.task_id);
        Ok(all)
    }
}
