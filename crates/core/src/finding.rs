//! Findings - discrete results produced by analyzers.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::id::ArtifactId;

/// Kind tag of a finding.
///
/// Serialized as a plain kebab-case string so new analyzers can introduce
/// their own kinds through [`FindingKind::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FindingKind {
    /// Pattern match
    Match,
    /// File recovered by carving
    CarvedFile,
    /// Entropy measurement
    Entropy,
    /// Entropy measurement above the analyzer's threshold
    EntropyFlag,
    /// Extracted strings summary
    Strings,
    /// Anything else
    Custom(String),
}

impl FindingKind {
    /// The wire name of this kind.
    pub fn as_str(&self) -> &str {
        match self {
            FindingKind::Match => "match",
            FindingKind::CarvedFile => "carved-file",
            FindingKind::Entropy => "entropy",
            FindingKind::EntropyFlag => "entropy-flag",
            FindingKind::Strings => "strings",
            FindingKind::Custom(name) => name,
        }
    }
}

impl From<String> for FindingKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "match" => FindingKind::Match,
            "carved-file" => FindingKind::CarvedFile,
            "entropy" => FindingKind::Entropy,
            "entropy-flag" => FindingKind::EntropyFlag,
            "strings" => FindingKind::Strings,
            _ => FindingKind::Custom(s),
        }
    }
}

impl From<&str> for FindingKind {
    fn from(s: &str) -> Self {
        FindingKind::from(s.to_string())
    }
}

impl From<FindingKind> for String {
    fn from(kind: FindingKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where in an artifact a finding was made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Location {
    /// Single byte offset
    Offset {
        /// Offset from the start of the artifact
        offset: u64,
    },
    /// Half-open byte range
    Range {
        /// First byte
        start: u64,
        /// One past the last byte
        end: u64,
    },
    /// Path inside (or of) the artifact
    Path {
        /// Path text
        path: String,
    },
    /// The artifact as a whole
    Whole,
}

/// One discrete result produced by an analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    kind: FindingKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    artifact: Option<ArtifactId>,
    location: Location,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    score: Option<f64>,
}

impl Finding {
    /// Create a finding without payload or score.
    pub fn new(kind: impl Into<FindingKind>, location: Location) -> Self {
        Self {
            kind: kind.into(),
            artifact: None,
            location,
            payload: serde_json::Value::Null,
            score: None,
        }
    }

    /// Attach the artifact the finding refers to.
    pub fn in_artifact(mut self, artifact: ArtifactId) -> Self {
        self.artifact = Some(artifact);
        self
    }

    /// Attach kind-specific data.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Attach a numeric score.
    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    /// Kind tag.
    pub fn kind(&self) -> &FindingKind {
        &self.kind
    }

    /// Artifact the finding was made in, if known.
    pub fn artifact(&self) -> Option<ArtifactId> {
        self.artifact
    }

    /// Location within the artifact.
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Kind-specific data.
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Score or confidence, if the analyzer produces one.
    pub fn score(&self) -> Option<f64> {
        self.score
    }
}
