//! Pipeline, stage and volume definitions.
//!
//! A [`Pipeline`] is the immutable input a worker claims from the queue:
//! services, stages of steps, secret declarations and a shared volume,
//! already compiled and ordered by the control plane.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

use crate::container::Container;
use crate::secret::SecretSpec;

/// A compiled pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Pipeline {
    /// Identifier, unique per execution; also names build-scoped resources
    #[serde(default)]
    pub id: String,
    /// Pipeline format version
    #[serde(default)]
    pub version: String,
    /// Worker routing labels
    #[serde(default)]
    pub routes: Vec<String>,
    /// Long-lived containers started before any step
    #[serde(default)]
    pub services: Vec<Container>,
    /// Ordered stages of steps
    #[serde(default)]
    pub stages: Vec<Stage>,
    /// Secrets the pipeline needs resolved
    #[serde(default)]
    pub secrets: Vec<SecretSpec>,
    /// Shared build volume
    #[serde(default)]
    pub volume: Volume,
}

/// An ordered group of steps.
///
/// Stages may run concurrently when the `needs` dependency graph permits;
/// within a stage, steps run sequentially.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Stage {
    /// Stage name, unique within the pipeline
    #[serde(default)]
    pub name: String,
    /// Names of stages that must finish first
    #[serde(default)]
    pub needs: Vec<String>,
    /// A failure in this stage does not poison peer stages
    #[serde(default)]
    pub independent: bool,
    /// Steps, run in declaration order
    #[serde(default)]
    pub steps: Vec<Container>,
}

impl Stage {
    /// Creates an empty stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Appends a step.
    #[must_use]
    pub fn with_step(mut self, step: Container) -> Self {
        self.steps.push(step);
        self
    }

    /// Declares a dependency on another stage.
    #[must_use]
    pub fn with_need(mut self, need: impl Into<String>) -> Self {
        self.needs.push(need.into());
        self
    }
}

/// The shared build volume mounted into every container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Volume {
    /// Volume name; derived from the pipeline id when empty
    #[serde(default)]
    pub name: String,
    /// Mount destination inside containers
    #[serde(default)]
    pub destination: String,
}

/// Problems detected when validating a pipeline before execution.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The pipeline has no identifier
    #[error("pipeline has no id")]
    MissingId,
    /// The pipeline declares no stages and no services
    #[error("pipeline is empty")]
    Empty,
    /// A container number is zero
    #[error("container '{name}' has no number")]
    MissingNumber {
        /// Offending container name
        name: String,
    },
    /// Two containers share a number
    #[error("container number {number} is used more than once")]
    DuplicateNumber {
        /// The duplicated number
        number: u32,
    },
    /// A stage needs a stage that does not exist
    #[error("stage '{stage}' needs unknown stage '{needs}'")]
    UnknownDependency {
        /// Stage declaring the dependency
        stage: String,
        /// Missing dependency name
        needs: String,
    },
    /// The needs graph contains a cycle
    #[error("stage dependency cycle involving: {stages}")]
    DependencyCycle {
        /// Stages left unresolvable, comma-joined
        stages: String,
    },
}

impl Pipeline {
    /// Creates an empty pipeline.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: "1".to_string(),
            ..Self::default()
        }
    }

    /// Appends a stage.
    #[must_use]
    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Appends a service.
    #[must_use]
    pub fn with_service(mut self, service: Container) -> Self {
        self.services.push(service);
        self
    }

    /// Name of the build-scoped network.
    #[must_use]
    pub fn network(&self) -> String {
        format!("network_{}", self.id)
    }

    /// Name of the build-scoped volume.
    #[must_use]
    pub fn volume_name(&self) -> String {
        if self.volume.name.is_empty() {
            format!("volume_{}", self.id)
        } else {
            self.volume.name.clone()
        }
    }

    /// All containers in execution order: services first, then steps.
    pub fn containers(&self) -> impl Iterator<Item = &Container> {
        self.services
            .iter()
            .chain(self.stages.iter().flat_map(|s| s.steps.iter()))
    }

    /// Validates the pipeline ahead of planning.
    ///
    /// Checks identifier presence, container numbering and the stage
    /// dependency graph. A cycle in `needs` is a caller error surfaced
    /// before any resource is created.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::MissingId);
        }

        if self.stages.is_empty() && self.services.is_empty() {
            return Err(ValidationError::Empty);
        }

        let mut seen = HashSet::new();
        for ctn in self.containers() {
            if ctn.number == 0 {
                return Err(ValidationError::MissingNumber {
                    name: ctn.name.clone(),
                });
            }
            if !seen.insert(ctn.number) {
                return Err(ValidationError::DuplicateNumber { number: ctn.number });
            }
        }

        self.validate_needs()
    }

    /// Verifies the `needs` graph is a DAG over known stages.
    fn validate_needs(&self) -> Result<(), ValidationError> {
        let names: HashSet<&str> = self.stages.iter().map(|s| s.name.as_str()).collect();

        let mut indegree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for stage in &self.stages {
            indegree.entry(stage.name.as_str()).or_insert(0);
            for need in &stage.needs {
                if !names.contains(need.as_str()) {
                    return Err(ValidationError::UnknownDependency {
                        stage: stage.name.clone(),
                        needs: need.clone(),
                    });
                }
                *indegree.entry(stage.name.as_str()).or_insert(0) += 1;
                dependents
                    .entry(need.as_str())
                    .or_default()
                    .push(stage.name.as_str());
            }
        }

        // Kahn's algorithm; anything left over sits on a cycle
        let mut ready: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut resolved = 0usize;

        while let Some(name) = ready.pop_front() {
            resolved += 1;
            if let Some(next) = dependents.get(name) {
                for dep in next {
                    let d = indegree.get_mut(dep).expect("dependent is a known stage");
                    *d -= 1;
                    if *d == 0 {
                        ready.push_back(dep);
                    }
                }
            }
        }

        if resolved != self.stages.len() {
            let mut stuck: Vec<&str> = indegree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(n, _)| *n)
                .collect();
            stuck.sort_unstable();
            return Err(ValidationError::DependencyCycle {
                stages: stuck.join(", "),
            });
        }

        Ok(())
    }
}
