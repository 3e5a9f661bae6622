//! Build, step and service status machine.
//!
//! One status enum is shared by builds, steps and services. Transitions are
//! monotonic: a unit moves from `Pending` through `Running` into exactly one
//! terminal state, and `Skipped` is only reachable from `Pending`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Execution status of a build, step or service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Planned but not started
    #[default]
    Pending,
    /// Currently executing
    Running,
    /// Finished with exit code 0
    Success,
    /// Finished with a non-zero exit code
    Failure,
    /// Terminated by cancellation
    Killed,
    /// Ruleset evaluated false; never executed
    Skipped,
    /// The worker itself failed while driving the unit
    Error,
}

impl Status {
    /// Returns true if no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::Pending | Status::Running)
    }

    /// Returns true if the status counts as a failed outcome.
    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(self, Status::Failure | Status::Killed | Status::Error)
    }

    /// Severity used to merge step outcomes into a build outcome.
    ///
    /// Skipped units carry no weight; `Failure > Success` per the build
    /// aggregation contract.
    #[must_use]
    pub fn severity(self) -> u8 {
        match self {
            Status::Pending | Status::Running | Status::Skipped => 0,
            Status::Success => 1,
            Status::Failure => 2,
            Status::Killed => 3,
            Status::Error => 4,
        }
    }

    /// Whether a transition from `self` to `next` is allowed.
    ///
    /// Re-asserting the current status is always allowed so that record
    /// uploads stay idempotent.
    #[must_use]
    pub fn can_transition(self, next: Status) -> bool {
        if self == next {
            return true;
        }
        match self {
            Status::Pending => matches!(next, Status::Running | Status::Skipped),
            Status::Running => {
                matches!(next, Status::Success | Status::Failure | Status::Killed | Status::Error)
            }
            _ => false,
        }
    }

    /// Merges a unit outcome into an aggregate build status.
    #[must_use]
    pub fn merge(self, other: Status) -> Status {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Success => "success",
            Status::Failure => "failure",
            Status::Killed => "killed",
            Status::Skipped => "skipped",
            Status::Error => "error",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_transitions() {
        assert!(Status::Pending.can_transition(Status::Running));
        assert!(Status::Pending.can_transition(Status::Skipped));
        assert!(!Status::Pending.can_transition(Status::Success));
        assert!(!Status::Pending.can_transition(Status::Failure));
    }

    #[test]
    fn test_running_transitions() {
        assert!(Status::Running.can_transition(Status::Success));
        assert!(Status::Running.can_transition(Status::Failure));
        assert!(Status::Running.can_transition(Status::Killed));
        assert!(!Status::Running.can_transition(Status::Pending));
        assert!(!Status::Running.can_transition(Status::Skipped));
    }

    #[test]
    fn test_terminal_states_absorb() {
        for terminal in [Status::Success, Status::Failure, Status::Killed, Status::Skipped] {
            assert!(terminal.is_terminal());
            assert!(terminal.can_transition(terminal));
            assert!(!terminal.can_transition(Status::Running));
            assert!(!terminal.can_transition(Status::Pending));
        }
    }

    #[test]
    fn test_skipped_only_from_pending() {
        assert!(Status::Pending.can_transition(Status::Skipped));
        assert!(!Status::Running.can_transition(Status::Skipped));
        assert!(!Status::Success.can_transition(Status::Skipped));
    }

    #[test]
    fn test_merge_prefers_severity() {
        assert_eq!(Status::Success.merge(Status::Failure), Status::Failure);
        assert_eq!(Status::Failure.merge(Status::Success), Status::Failure);
        assert_eq!(Status::Success.merge(Status::Skipped), Status::Success);
        assert_eq!(Status::Running.merge(Status::Success), Status::Success);
        assert_eq!(Status::Failure.merge(Status::Killed), Status::Killed);
    }

    #[test]
    fn test_display_roundtrip() {
        assert_eq!(Status::Success.to_string(), "success");
        assert_eq!(Status::Killed.to_string(), "killed");
        let json = serde_json::to_string(&Status::Failure).unwrap();
        assert_eq!(json, "\"failure\"");
    }
}
