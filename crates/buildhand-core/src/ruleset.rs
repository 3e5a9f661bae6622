//! Gating rules for containers.
//!
//! Every container carries a [`Ruleset`] evaluated against [`RuleData`]
//! drawn from build metadata. A container whose ruleset does not match is
//! recorded as skipped and never touches the runtime.
//!
//! With no explicit rules a container runs only while the build is still
//! succeeding, which is what makes a failing step short-circuit the steps
//! after it without any executor-side bookkeeping.

use serde::{Deserialize, Serialize};

use crate::status::Status;

/// Gating conditions for one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Ruleset {
    /// Rules that must match for the container to run
    #[serde(default, rename = "if")]
    pub if_rules: Rules,
    /// Rules that suppress the container when they match
    #[serde(default, rename = "unless")]
    pub unless_rules: Rules,
    /// Record a failure without poisoning subsequent containers
    #[serde(default)]
    pub continue_on_error: bool,
}

/// One set of match conditions. Within a field values are OR-ed; across
/// fields they are AND-ed. An empty field matches anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Rules {
    /// Branch names
    #[serde(default)]
    pub branch: Vec<String>,
    /// Webhook events ("push", "tag", "deployment", ...)
    #[serde(default)]
    pub event: Vec<String>,
    /// Build statuses ("success", "failure")
    #[serde(default)]
    pub status: Vec<String>,
    /// Repository full names
    #[serde(default)]
    pub repo: Vec<String>,
}

/// Build metadata the rules are evaluated against.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleData {
    /// Branch the build runs for
    pub branch: String,
    /// Event that triggered the build
    pub event: String,
    /// Current aggregate build status
    pub status: Status,
    /// Repository full name
    pub repo: String,
}

impl RuleData {
    /// Rule data for a build with no interesting metadata.
    #[must_use]
    pub fn with_status(status: Status) -> Self {
        Self {
            branch: String::new(),
            event: String::new(),
            status,
            repo: String::new(),
        }
    }
}

impl Rules {
    /// True when no condition is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.branch.is_empty()
            && self.event.is_empty()
            && self.status.is_empty()
            && self.repo.is_empty()
    }

    /// Evaluates the rules against build metadata.
    #[must_use]
    pub fn matches(&self, data: &RuleData) -> bool {
        let field = |values: &[String], actual: &str| {
            values.is_empty() || values.iter().any(|v| v == actual)
        };

        field(&self.branch, &data.branch)
            && field(&self.event, &data.event)
            && field(&self.status, &data.status.to_string())
            && field(&self.repo, &data.repo)
    }
}

impl Ruleset {
    /// Decides whether the container should run.
    #[must_use]
    pub fn matches(&self, data: &RuleData) -> bool {
        if !self.unless_rules.is_empty() && self.unless_rules.matches(data) {
            return false;
        }

        if self.if_rules.is_empty() {
            // implicit rule: run while the build has not gone bad
            return matches!(data.status, Status::Pending | Status::Running | Status::Success);
        }

        self.if_rules.matches(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(status: Status) -> RuleData {
        RuleData {
            branch: "main".to_string(),
            event: "push".to_string(),
            status,
            repo: "octo/spoon".to_string(),
        }
    }

    #[test]
    fn test_default_ruleset_runs_while_succeeding() {
        let rs = Ruleset::default();
        assert!(rs.matches(&data(Status::Running)));
        assert!(rs.matches(&data(Status::Success)));
        assert!(!rs.matches(&data(Status::Failure)));
        assert!(!rs.matches(&data(Status::Killed)));
    }

    #[test]
    fn test_status_rule_runs_on_failure() {
        let rs = Ruleset {
            if_rules: Rules {
                status: vec!["failure".to_string()],
                ..Rules::default()
            },
            ..Ruleset::default()
        };
        assert!(rs.matches(&data(Status::Failure)));
        assert!(!rs.matches(&data(Status::Success)));
    }

    #[test]
    fn test_branch_and_event_are_anded() {
        let rs = Ruleset {
            if_rules: Rules {
                branch: vec!["main".to_string()],
                event: vec!["tag".to_string()],
                ..Rules::default()
            },
            ..Ruleset::default()
        };
        // branch matches but event does not
        assert!(!rs.matches(&data(Status::Running)));
    }

    #[test]
    fn test_unless_suppresses() {
        let rs = Ruleset {
            unless_rules: Rules {
                branch: vec!["main".to_string()],
                ..Rules::default()
            },
            ..Ruleset::default()
        };
        assert!(!rs.matches(&data(Status::Running)));

        let other = RuleData {
            branch: "dev".to_string(),
            ..data(Status::Running)
        };
        assert!(rs.matches(&other));
    }

    #[test]
    fn test_empty_field_matches_anything() {
        let rules = Rules::default();
        assert!(rules.matches(&data(Status::Running)));
        assert!(rules.is_empty());
    }
}
