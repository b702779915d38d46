//! Task envelope - the immutable unit of dispatch.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::artifact::ArtifactRef;
use crate::id::TaskId;
use crate::Time;

/// Configuration options passed to an analyzer, keyed by option name.
pub type AnalyzerOptions = BTreeMap<String, serde_json::Value>;

/// Immutable description of one unit of analysis work.
///
/// Envelopes are built once (see [`TaskEnvelope::builder`]) and then only
/// read. They are serializable so a transport can deliver them as JSON.
/// The `id` is required on the wire: redelivery is recognised by it, so a
/// decoder must never invent one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    id: TaskId,
    analyzer: String,
    inputs: Vec<ArtifactRef>,
    #[serde(default)]
    options: AnalyzerOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deadline_ms: Option<u64>,
    #[serde(default)]
    priority: u8,
    #[serde(default = "chrono::Utc::now")]
    created_at: Time,
}

impl TaskEnvelope {
    /// Start building an envelope for the named analyzer.
    pub fn builder(analyzer: impl Into<String>) -> TaskEnvelopeBuilder {
        TaskEnvelopeBuilder {
            id: None,
            analyzer: analyzer.into(),
            inputs: Vec::new(),
            options: AnalyzerOptions::new(),
            deadline: None,
            priority: 0,
        }
    }

    /// Envelope identifier (also the identifier of its result).
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Requested analyzer name.
    pub fn analyzer(&self) -> &str {
        &self.analyzer
    }

    /// Input artifacts, in order.
    pub fn inputs(&self) -> &[ArtifactRef] {
        &self.inputs
    }

    /// Analyzer options.
    pub fn options(&self) -> &AnalyzerOptions {
        &self.options
    }

    /// Run deadline measured from the moment the analyzer starts running.
    /// `None` means the engine's default for the analyzer class applies.
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }

    /// Dispatch priority, 0 is normal. Higher values may overtake a bounded
    /// number of queued envelopes of the same class.
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Creation timestamp.
    pub fn created_at(&self) -> Time {
        self.created_at
    }
}

/// Builder for [`TaskEnvelope`].
#[derive(Debug, Clone)]
pub struct TaskEnvelopeBuilder {
    id: Option<TaskId>,
    analyzer: String,
    inputs: Vec<ArtifactRef>,
    options: AnalyzerOptions,
    deadline: Option<Duration>,
    priority: u8,
}

impl TaskEnvelopeBuilder {
    /// Use a specific id (e.g. when re-delivering a known envelope).
    pub fn id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    /// Append an input artifact.
    pub fn input(mut self, artifact: ArtifactRef) -> Self {
        self.inputs.push(artifact);
        self
    }

    /// Append several input artifacts.
    pub fn inputs(mut self, artifacts: impl IntoIterator<Item = ArtifactRef>) -> Self {
        self.inputs.extend(artifacts);
        self
    }

    /// Set one option.
    pub fn option(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Replace all options.
    pub fn options(mut self, options: AnalyzerOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the run deadline.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the priority.
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Finish the envelope.
    pub fn build(self) -> TaskEnvelope {
        TaskEnvelope {
            id: self.id.unwrap_or_default(),
            analyzer: self.analyzer,
            inputs: self.inputs,
            options: self.options,
            deadline_ms: self.deadline.map(|d| d.as_millis().min(u64::MAX as u128) as u64),
            priority: self.priority,
            created_at: chrono::Utc::now(),
        }
    }
}
