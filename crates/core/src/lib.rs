//! triage core data models.
//!
//! This crate defines the data that flows through the dispatch core:
//! artifacts, task envelopes, findings, results and the task lifecycle.

#![warn(missing_docs)]

// Core identities
mod id;

// Inputs
mod artifact;
mod envelope;

// Outputs
mod finding;
mod result;
mod state;

// Re-exports
pub use id::*;

pub use artifact::{content_hash, ArtifactRef, PendingArtifact};
pub use envelope::{AnalyzerOptions, TaskEnvelope, TaskEnvelopeBuilder};
pub use finding::{Finding, FindingKind, Location};
pub use result::{AnalyzerResult, ErrorKind, ResultStatus};
pub use state::TaskState;

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;
