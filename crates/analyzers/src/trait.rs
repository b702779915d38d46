//! Analyzer abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use triage_core::{AnalyzerOptions, ArtifactRef, ErrorKind, Finding, PendingArtifact, TaskId};

use crate::options::OptionSpec;
use crate::progress::Progress;

/// A pluggable unit performing one kind of scan, carve or measurement.
///
/// Implementations must check `cancel` at their suspension points and
/// return [`AnalyzerError::Cancelled`] promptly once it fires. Output
/// artifacts are returned as pending data and committed by the engine; an
/// analyzer never writes into the artifact store itself.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Get analyzer name (the name envelopes refer to).
    fn name(&self) -> &str;

    /// Get analyzer capabilities and options.
    fn descriptor(&self) -> AnalyzerDescriptor;

    /// Run the analyzer over resolved inputs.
    async fn run(
        &self,
        input: &AnalysisInput,
        cancel: &CancellationToken,
    ) -> Result<AnalyzerOutput, AnalyzerError>;
}

/// Input handed to [`Analyzer::run`].
#[derive(Debug, Clone)]
pub struct AnalysisInput {
    /// Task being executed
    pub task_id: TaskId,

    /// Resolved input artifacts, readable at their paths
    pub artifacts: Vec<ArtifactRef>,

    /// Validated options with defaults applied
    pub options: AnalyzerOptions,

    /// Attempt number, starting at 1
    pub attempt: u32,

    /// Where to publish progress while running
    pub progress: Progress,
}

/// Output of a successful run.
#[derive(Debug, Clone, Default)]
pub struct AnalyzerOutput {
    /// Findings in production order
    pub findings: Vec<Finding>,

    /// Output artifacts to commit
    pub artifacts: Vec<PendingArtifact>,

    /// Problems with part of the input; non-empty means partial failure
    pub warnings: Vec<String>,
}

impl AnalyzerOutput {
    /// Output with findings only.
    pub fn findings(findings: Vec<Finding>) -> Self {
        Self {
            findings,
            ..Default::default()
        }
    }
}

/// Capability descriptor registered with the analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerDescriptor {
    /// Analyzer name
    pub name: String,

    /// Resource class used for concurrency limits
    pub class: String,

    /// Description
    pub description: String,

    /// Recognised options
    pub options: Vec<OptionSpec>,

    /// Whether identical input and options always yield identical findings
    pub deterministic: bool,
}

/// Errors an analyzer can report.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AnalyzerError {
    /// Malformed or unsupported artifact or configuration
    #[error("{0}")]
    Input(String),

    /// External tool crash or resource exhaustion
    #[error("{0}")]
    Transient(String),

    /// The analyzer gave up because its own time budget ran out
    #[error("{0}")]
    Timeout(String),

    /// The cancellation token fired
    #[error("cancelled")]
    Cancelled,
}

impl AnalyzerError {
    /// Classification used by the engine's retry policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalyzerError::Input(_) => ErrorKind::Input,
            AnalyzerError::Transient(_) => ErrorKind::Transient,
            AnalyzerError::Timeout(_) => ErrorKind::Timeout,
            AnalyzerError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl From<std::io::Error> for AnalyzerError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        match e.kind() {
            Io::NotFound | Io::InvalidData | Io::InvalidInput | Io::PermissionDenied => {
                AnalyzerError::Input(e.to_string())
            }
            _ => AnalyzerError::Transient(e.to_string()),
        }
    }
}
