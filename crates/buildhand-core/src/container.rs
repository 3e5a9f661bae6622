//! The unit of execution.
//!
//! A [`Container`] is one concrete container the runtime will create: a step,
//! a service, or the synthetic `init` marker. Containers arrive fully
//! compiled; the executor only injects environment and secrets before
//! handing them to the runtime.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::secret::SecretRef;
use crate::ruleset::Ruleset;
use crate::INIT_STEP;

/// Image pull policy for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PullPolicy {
    /// Always pull the image before creating the container
    Always,
    /// Pull only when the image is not present locally
    #[default]
    NotPresent,
    /// Never pull; fail setup if the image is missing
    Never,
}

/// A single container within a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Container {
    /// Identifier unique within the pipeline
    #[serde(default)]
    pub id: String,
    /// Human-readable name ("clone", "test", "db", ...)
    #[serde(default)]
    pub name: String,
    /// Positive number, unique and stable per pipeline execution
    #[serde(default)]
    pub number: u32,
    /// Image reference
    #[serde(default)]
    pub image: String,
    /// Commands executed inside the container
    #[serde(default)]
    pub commands: Vec<String>,
    /// Entrypoint override
    #[serde(default)]
    pub entrypoint: Vec<String>,
    /// Environment; insertion order is irrelevant
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// If true, execution does not wait for termination
    #[serde(default)]
    pub detach: bool,
    /// Run with elevated privileges
    #[serde(default)]
    pub privileged: bool,
    /// Image pull policy
    #[serde(default)]
    pub pull: PullPolicy,
    /// Secrets to inject before substitution
    #[serde(default)]
    pub secrets: Vec<SecretRef>,
    /// Gating conditions evaluated against build metadata
    #[serde(default)]
    pub ruleset: Ruleset,
}

impl Container {
    /// Creates a container with the fields every unit needs.
    #[must_use]
    pub fn new(name: impl Into<String>, image: impl Into<String>, number: u32) -> Self {
        let name = name.into();
        Self {
            id: format!("{name}_{number}"),
            name,
            number,
            image: image.into(),
            ..Self::default()
        }
    }

    /// Sets the commands.
    #[must_use]
    pub fn with_commands(mut self, commands: Vec<String>) -> Self {
        self.commands = commands;
        self
    }

    /// Adds an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Marks the container as detached.
    #[must_use]
    pub fn detached(mut self) -> Self {
        self.detach = true;
        self
    }

    /// Sets the ruleset.
    #[must_use]
    pub fn with_ruleset(mut self, ruleset: Ruleset) -> Self {
        self.ruleset = ruleset;
        self
    }

    /// Adds a secret reference.
    #[must_use]
    pub fn with_secret(mut self, ref_: SecretRef) -> Self {
        self.secrets.push(ref_);
        self
    }

    /// True for the synthetic initial step, which is never executed.
    #[must_use]
    pub fn is_init(&self) -> bool {
        self.name == INIT_STEP
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_new() {
        let ctn = Container::new("compile", "rust:1.77", 2);
        assert_eq!(ctn.id, "compile_2");
        assert_eq!(ctn.number, 2);
        assert!(!ctn.detach);
        assert_eq!(ctn.pull, PullPolicy::NotPresent);
    }

    #[test]
    fn test_init_marker() {
        assert!(Container::new("init", "#init", 1).is_init());
        assert!(!Container::new("clone", "alpine", 2).is_init());
    }

    #[test]
    fn test_serde_defaults() {
        // compiled pipelines may omit most fields
        let ctn: Container = serde_json::from_str(r#"{"name":"t","number":3,"image":"alpine"}"#)
            .expect("minimal container");
        assert_eq!(ctn.name, "t");
        assert!(ctn.environment.is_empty());
        assert_eq!(ctn.pull, PullPolicy::NotPresent);
    }
}
