//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use triage_analyzers::CommandSpec;

use crate::aggregator::SummaryRules;
use crate::governor::GovernorConfig;
use crate::retry::RetryPolicy;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("cannot read config {path}: {source}")]
    Io {
        /// Config file
        path: PathBuf,
        /// Cause
        source: std::io::Error,
    },

    /// The file is not valid configuration
    #[error("invalid config {path}: {source}")]
    Parse {
        /// Config file
        path: PathBuf,
        /// Cause
        source: serde_json::Error,
    },
}

/// Everything tunable about execution. Every field has a default, so a
/// config file only lists what it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Retry policy for transient errors
    pub retry: RetryPolicy,

    /// Run deadline when neither envelope nor class sets one
    pub default_deadline_ms: u64,

    /// Run deadline per analyzer class
    pub class_deadlines_ms: HashMap<String, u64>,

    /// Time a signalled analyzer gets to stop before it is terminated
    pub grace_period_ms: u64,

    /// Upper bound on waiting for a slot
    pub queue_timeout_ms: Option<u64>,

    /// Slot limits
    pub governor: GovernorConfig,

    /// Flagging rules
    pub summary: SummaryRules,

    /// Where output artifacts are written
    pub artifact_root: PathBuf,

    /// Root of the JSON result store (results go to `results/` below it)
    pub result_dir: PathBuf,

    /// Check input size and hash on resolution
    pub verify_inputs: bool,

    /// External tools to register as analyzers
    pub commands: Vec<CommandSpec>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            default_deadline_ms: 300_000,
            class_deadlines_ms: HashMap::new(),
            grace_period_ms: 5_000,
            queue_timeout_ms: None,
            governor: GovernorConfig::default(),
            summary: SummaryRules::default(),
            artifact_root: PathBuf::from(".triage/artifacts"),
            result_dir: PathBuf::from(".triage"),
            verify_inputs: true,
            commands: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the default run deadline.
    pub fn with_default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline_ms = deadline.as_millis() as u64;
        self
    }

    /// Set the grace period.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period_ms = grace.as_millis() as u64;
        self
    }

    /// Set the queue timeout.
    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Set the slot limits.
    pub fn with_governor(mut self, governor: GovernorConfig) -> Self {
        self.governor = governor;
        self
    }

    /// Run deadline for `class`.
    pub fn deadline_for(&self, class: &str) -> Duration {
        Duration::from_millis(
            self.class_deadlines_ms
                .get(class)
                .copied()
                .unwrap_or(self.default_deadline_ms),
        )
    }

    /// Grace period.
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Queue timeout, if any.
    pub fn queue_timeout(&self) -> Option<Duration> {
        self.queue_timeout_ms.map(Duration::from_millis)
    }
}
