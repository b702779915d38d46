//! JSON file result store.
//!
//! Stores each terminal result as `results/<task-id>.json` under the root
//! directory. Files are written through a temporary name and renamed, so a
//! reader never sees a half-written result.

use async_trait::async_trait;
use std::path::Path;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::warn;
use triage_core::{AnalyzerResult, TaskId};

use super::{CommitOutcome, Result, ResultStore};

/// File-based JSON result store.
pub struct JsonResultStore {
    root: std::path::PathBuf,
    // Serializes check-then-write so two commits for one task cannot both win.
    write_lock: Mutex<()>,
}

impl JsonResultStore {
    /// Create storage, creating the `results/` directory if needed.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("results")).await?;

        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    fn result_path(&self, id: TaskId) -> std::path::PathBuf {
        self.root.join("results").join(format!("{}.json", id))
    }
}

#[async_trait]
impl ResultStore for JsonResultStore {
    async fn commit(&self, result: AnalyzerResult) -> Result<CommitOutcome> {
        let _guard = self.write_lock.lock().await;

        let path = self.result_path(result.task_id);
        if let Some(existing) = read_json::<AnalyzerResult>(&path).await? {
            return Ok(CommitOutcome::AlreadyCommitted(existing));
        }

        let json = serde_json::to_string_pretty(&result)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json.as_bytes()).await?;
        fs::rename(&tmp, &path).await?;

        Ok(CommitOutcome::Committed(result))
    }

    async fn get(&self, id: TaskId) -> Result<Option<AnalyzerResult>> {
        read_json(&self.result_path(id)).await
    }

    async fn list(&self) -> Result<Vec<AnalyzerResult>> {
        let mut results: Vec<AnalyzerResult> = list_dir(&self.root.join("results")).await?;
        results.sort_by_key(|r| r.task_id);
        Ok(results)
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &std::path::Path) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(json) => {
            let value = serde_json::from_str(&json)?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn list_dir<T: serde::de::DeserializeOwned>(dir: &std::path::Path) -> Result<Vec<T>> {
    let mut items = Vec::new();
    let mut rd = fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        if entry.path().extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        match read_json(&entry.path()).await {
            Ok(Some(item)) => items.push(item),
            Ok(None) => {}
            Err(e) => warn!(path = %entry.path().display(), "skipping unreadable result: {}", e),
        }
    }
    Ok(items)
}
