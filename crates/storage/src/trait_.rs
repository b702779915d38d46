//! Storage trait abstractions.

use async_trait::async_trait;
use triage_core::{AnalyzerResult, ArtifactRef, PendingArtifact, TaskId};

/// Error type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Item not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Stored bytes do not match the reference
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Outcome of committing a terminal result.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// This call stored the result
    Committed(AnalyzerResult),
    /// A result for the task already existed; it is returned unchanged
    AlreadyCommitted(AnalyzerResult),
}

impl CommitOutcome {
    /// The result that is stored for the task, whichever call wrote it.
    pub fn into_result(self) -> AnalyzerResult {
        match self {
            CommitOutcome::Committed(r) | CommitOutcome::AlreadyCommitted(r) => r,
        }
    }

    /// Whether this call performed the write.
    pub fn is_new(&self) -> bool {
        matches!(self, CommitOutcome::Committed(_))
    }
}

/// Resolves input artifacts to readable files and stores output artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Check that the referenced bytes are available and return a reference
    /// whose path can be read directly.
    async fn resolve(&self, artifact: &ArtifactRef) -> Result<ArtifactRef>;

    /// Persist a fully formed output artifact for a task.
    async fn store(&self, task: TaskId, artifact: &PendingArtifact) -> Result<ArtifactRef>;

    /// Remove a previously stored artifact (used to roll back a partial commit).
    async fn discard(&self, artifact: &ArtifactRef) -> Result<()>;
}

/// Keeps exactly one terminal result per task.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Store a result unless one already exists for the task.
    async fn commit(&self, result: AnalyzerResult) -> Result<CommitOutcome>;

    /// Load the result for a task.
    async fn get(&self, id: TaskId) -> Result<Option<AnalyzerResult>>;

    /// List all stored results.
    async fn list(&self) -> Result<Vec<AnalyzerResult>>;
}
