//! Terminal results of analyzer runs.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::artifact::ArtifactRef;
use crate::finding::Finding;
use crate::id::TaskId;
use crate::state::TaskState;
use crate::Time;

/// Outcome status of one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// Analyzer completed without warnings
    Success,
    /// Analyzer completed but reported problems with part of the input
    PartialFailure,
    /// Analyzer (or the engine around it) failed
    Failure,
    /// Deadline exceeded
    TimedOut,
    /// Cancelled before completion
    Cancelled,
}

impl ResultStatus {
    /// The task state that corresponds to this status.
    pub fn terminal_state(self) -> TaskState {
        match self {
            ResultStatus::Success | ResultStatus::PartialFailure => TaskState::Succeeded,
            ResultStatus::Failure => TaskState::Failed,
            ResultStatus::TimedOut => TaskState::TimedOut,
            ResultStatus::Cancelled => TaskState::Cancelled,
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultStatus::Success => write!(f, "success"),
            ResultStatus::PartialFailure => write!(f, "partial_failure"),
            ResultStatus::Failure => write!(f, "failure"),
            ResultStatus::TimedOut => write!(f, "timed_out"),
            ResultStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Error taxonomy shared by analyzers and the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or unsupported artifact or configuration; never retried
    Input,
    /// External tool or resource failure; retried with backoff
    Transient,
    /// Deadline exceeded
    Timeout,
    /// Engine invariant violation
    Internal,
    /// Cancellation requested
    Cancelled,
}

impl ErrorKind {
    /// Prefix used in diagnostics so each kind is recognisable without logs.
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::Input => "input error",
            ErrorKind::Transient => "transient error",
            ErrorKind::Timeout => "timed out",
            ErrorKind::Internal => "internal error",
            ErrorKind::Cancelled => "cancelled",
        }
    }

    /// Whether the engine may retry an error of this kind.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The single terminal result committed for a task envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerResult {
    /// Envelope this result belongs to
    pub task_id: TaskId,

    /// Analyzer that was requested
    pub analyzer: String,

    /// Outcome
    pub status: ResultStatus,

    /// Error classification for non-success outcomes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,

    /// Findings, in the order the analyzer produced them
    #[serde(default)]
    pub findings: Vec<Finding>,

    /// Committed output artifacts
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,

    /// Human readable explanation of the outcome
    pub diagnostic: String,

    /// Analyzer invocations made (0 if it never ran)
    pub attempts: u32,

    /// When the analyzer first started running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Time>,

    /// When the result was produced
    pub finished_at: Time,
}

impl AnalyzerResult {
    /// A completed run. Non-empty `warnings` make it a partial failure.
    pub fn completed(
        task_id: TaskId,
        analyzer: impl Into<String>,
        findings: Vec<Finding>,
        artifacts: Vec<ArtifactRef>,
        warnings: &[String],
    ) -> Self {
        let (status, diagnostic) = if warnings.is_empty() {
            (
                ResultStatus::Success,
                format!(
                    "completed: {} finding(s), {} artifact(s)",
                    findings.len(),
                    artifacts.len()
                ),
            )
        } else {
            (
                ResultStatus::PartialFailure,
                format!(
                    "partial failure: {} finding(s), {} artifact(s); {}",
                    findings.len(),
                    artifacts.len(),
                    warnings.join("; ")
                ),
            )
        };

        Self {
            task_id,
            analyzer: analyzer.into(),
            status,
            error_kind: None,
            findings,
            artifacts,
            diagnostic,
            attempts: 0,
            started_at: None,
            finished_at: chrono::Utc::now(),
        }
    }

    /// A run that ended without usable output.
    ///
    /// The status follows the error kind: timeouts become `TimedOut`,
    /// cancellation becomes `Cancelled`, everything else `Failure`.
    pub fn errored(
        task_id: TaskId,
        analyzer: impl Into<String>,
        kind: ErrorKind,
        message: impl fmt::Display,
    ) -> Self {
        let status = match kind {
            ErrorKind::Timeout => ResultStatus::TimedOut,
            ErrorKind::Cancelled => ResultStatus::Cancelled,
            ErrorKind::Input | ErrorKind::Transient | ErrorKind::Internal => ResultStatus::Failure,
        };

        Self {
            task_id,
            analyzer: analyzer.into(),
            status,
            error_kind: Some(kind),
            findings: Vec::new(),
            artifacts: Vec::new(),
            diagnostic: format!("{}: {}", kind.label(), message),
            attempts: 0,
            started_at: None,
            finished_at: chrono::Utc::now(),
        }
    }

    /// Override the failure status while keeping the error kind, e.g. an
    /// ignored cancellation is reported as `Failure` with kind `Cancelled`.
    pub fn with_status(mut self, status: ResultStatus) -> Self {
        self.status = status;
        self
    }

    /// Record how many invocations were made.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Record when the analyzer started running.
    pub fn with_started_at(mut self, started_at: Option<Time>) -> Self {
        self.started_at = started_at;
        self
    }

    /// Whether the analyzer produced usable output.
    pub fn is_success(&self) -> bool {
        matches!(self.status, ResultStatus::Success | ResultStatus::PartialFailure)
    }
}
