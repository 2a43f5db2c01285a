//! Task and beacon records as seen by the lifecycle manager.

use serde::{Deserialize, Serialize};

/// Task lifecycle state.
///
/// `queued → dispatched → completed | failed`, or `queued → canceled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Dispatched,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Dispatched => "dispatched",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Whether `self → next` is an edge of the state machine.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Dispatched | Self::Canceled)
                | (Self::Dispatched, Self::Completed | Self::Failed)
        )
    }
}

/// Who asked for the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum TaskOrigin {
    Operator(String),
    Policy,
}

/// A unit of work queued for a beacon. Never deleted; doubles as audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub beacon_id: String,
    pub command: String,
    #[serde(with = "crate::protocol::b64")]
    pub arguments: Vec<u8>,
    pub status: TaskStatus,
    /// Decoded output (or failure explanation). Empty until the task finishes.
    pub output: String,
    pub origin: TaskOrigin,
    /// Epoch milliseconds.
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BeaconStatus {
    Active,
    /// Marked for forced termination; the next poll receives an exit task.
    Terminating,
    Exited,
}

/// Server-side view of a beacon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Beacon {
    pub beacon_id: String,
    pub hostname: String,
    pub sleep_secs: u64,
    pub jitter_pct: u8,
    pub status: BeaconStatus,
    pub first_seen: u64,
    pub last_seen: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_forward_edges_are_allowed() {
        use TaskStatus::*;
        let all = [Queued, Dispatched, Completed, Failed, Canceled];
        let allowed = [
            (Queued, Dispatched),
            (Queued, Canceled),
            (Dispatched, Completed),
            (Dispatched, Failed),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from:?} -> {to:?}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for s in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Canceled] {
            assert!(s.is_terminal());
            assert!(!s.can_transition_to(TaskStatus::Queued));
        }
    }
}
