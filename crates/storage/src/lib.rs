//! Storage abstractions and implementations for triage.
//!
//! This crate provides the artifact store (resolving inputs, persisting
//! outputs) and the result store (one terminal result per task).

#![warn(missing_docs)]

pub mod trait_;
pub mod fs_artifacts;
pub mod memory;
pub mod json_storage;

pub use trait_::{ArtifactStore, CommitOutcome, Result, ResultStore, StorageError};
pub use fs_artifacts::FsArtifactStore;
pub use memory::MemoryResultStore;
pub use json_storage::JsonResultStore;
