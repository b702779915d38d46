//! Progress reporting from a running analyzer.

use std::sync::Arc;
use tokio::sync::watch;

/// Latest progress report of a task, if any was made.
pub type ProgressReceiver = watch::Receiver<Option<serde_json::Value>>;

/// Handle an analyzer uses to publish progress while it runs.
///
/// Only the most recent report is kept. Reporting never blocks and never
/// fails, even when nobody is listening.
#[derive(Debug, Clone)]
pub struct Progress {
    sender: Arc<watch::Sender<Option<serde_json::Value>>>,
}

impl Progress {
    /// Create a handle and a receiver observing it.
    pub fn channel() -> (Self, ProgressReceiver) {
        let (sender, receiver) = watch::channel(None);
        (
            Self {
                sender: Arc::new(sender),
            },
            receiver,
        )
    }

    /// Publish a report, replacing the previous one.
    pub fn report(&self, value: serde_json::Value) {
        self.sender.send_replace(Some(value));
    }

    /// Most recent report.
    pub fn latest(&self) -> Option<serde_json::Value> {
        self.sender.borrow().clone()
    }
}

impl Default for Progress {
    /// A handle nobody observes.
    fn default() -> Self {
        Self::channel().0
    }
}
