//! Per-envelope lifecycle.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of one task envelope.
///
/// ```text
/// Queued → SlotAcquired → Running → {Succeeded, Failed, TimedOut, Cancelled}
/// ```
///
/// `Queued` and `SlotAcquired` may also move straight to `Failed`,
/// `TimedOut` or `Cancelled` (e.g. cancellation before the analyzer starts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Admitted, waiting for a slot
    Queued,
    /// Holding a slot, resolving inputs
    SlotAcquired,
    /// Analyzer invocation in progress
    Running,
    /// Finished with usable output
    Succeeded,
    /// Finished without usable output
    Failed,
    /// Deadline exceeded
    TimedOut,
    /// Cancelled before completion
    Cancelled,
}

impl TaskState {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::TimedOut | TaskState::Cancelled
        )
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Queued, SlotAcquired) => true,
            (SlotAcquired, Running) => true,
            (from, to) if !from.is_terminal() && to.is_terminal() => {
                // Only a running task can succeed.
                to != Succeeded || from == Running
            }
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Queued => write!(f, "queued"),
            TaskState::SlotAcquired => write!(f, "slot_acquired"),
            TaskState::Running => write!(f, "running"),
            TaskState::Succeeded => write!(f, "succeeded"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::TimedOut => write!(f, "timed_out"),
            TaskState::Cancelled => write!(f, "cancelled"),
        }
    }
}
