//! # Buildhand Executor
//!
//! Build execution engine for buildhand. The [`Engine`] takes one compiled
//! pipeline and drives it through a strict lifecycle on top of an abstract
//! container runtime while streaming logs and synchronizing state with the
//! control plane:
//!
//! ```text
//! create_build -> plan_build -> assemble_build -> exec_build -> destroy_build
//! ```
//!
//! ## Architecture
//!
//! - `build`: the five lifecycle operations
//! - `stage`: dependency-wave scheduling of stages; sequential steps
//! - `step`: the per-container create/plan/exec/destroy quartet
//! - `service`: long-lived containers torn down only at build end
//! - `secret`: secret injection with origin enforcement
//! - `stream`: one log streamer task per container
//! - `reporter`: serialized record uploads with bounded backoff
//!
//! `destroy_build` must run on every exit path; the worker loop owns that
//! guarantee and the engine keeps it cheap to honor: teardown is
//! best-effort, idempotent, and decoupled from the build's cancellation
//! token.

#![warn(missing_docs)]
#![warn(unused)]

pub mod build;
pub mod reporter;
pub mod secret;
pub mod service;
pub mod stage;
pub mod step;
pub mod stream;

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use buildhand_client::{ClientError, ControlPlane};
use buildhand_core::{
    BuildRecord, Container, LogRecord, Pipeline, Secret, ServiceRecord, Status, StepRecord,
    SubstituteError, ValidationError,
};
use buildhand_runtime::{Runtime, RuntimeError, RuntimeErrorKind};

use reporter::Reporter;

/// Executor result type.
pub type ExecutorResult<T = ()> = Result<T, ExecutorError>;

/// Executor error with an opaque public face.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ExecutorError(#[from] ExecutorErrorKind);

/// Specific executor error kinds.
///
/// A container exiting non-zero is a step *outcome*, recorded as status;
/// it never appears here.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorErrorKind {
    /// Malformed pipeline, bad substitution or cyclic dependencies
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration {
        /// What is wrong with the input
        reason: String,
    },

    /// A secret's origin forbids the target container
    #[error("secret '{secret}' not allowed in container '{container}'")]
    SecretDenied {
        /// Secret name
        secret: String,
        /// Container that requested it
        container: String,
    },

    /// A control-plane call failed beyond retry
    #[error("control plane call failed: {source}")]
    Api {
        /// Underlying client error
        #[source]
        source: ClientError,
    },

    /// A runtime call failed beyond retry
    #[error("runtime call failed: {source}")]
    Runtime {
        /// Underlying runtime error
        #[source]
        source: RuntimeError,
    },

    /// The build was cancelled
    #[error("build cancelled")]
    Cancelled,

    /// Broken internal expectations
    #[error("internal executor error: {reason}")]
    Internal {
        /// Description
        reason: String,
    },
}

impl ExecutorError {
    /// The specific kind.
    #[must_use]
    pub fn kind(&self) -> &ExecutorErrorKind {
        &self.0
    }

    /// True when the build was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.0, ExecutorErrorKind::Cancelled)
    }
}

impl From<ClientError> for ExecutorError {
    fn from(e: ClientError) -> Self {
        Self(ExecutorErrorKind::Api { source: e })
    }
}

impl From<RuntimeError> for ExecutorError {
    fn from(e: RuntimeError) -> Self {
        if matches!(e.kind(), RuntimeErrorKind::Cancelled) {
            return Self(ExecutorErrorKind::Cancelled);
        }
        Self(ExecutorErrorKind::Runtime { source: e })
    }
}

impl From<ValidationError> for ExecutorError {
    fn from(e: ValidationError) -> Self {
        Self(ExecutorErrorKind::InvalidConfiguration {
            reason: e.to_string(),
        })
    }
}

impl From<SubstituteError> for ExecutorError {
    fn from(e: SubstituteError) -> Self {
        Self(ExecutorErrorKind::InvalidConfiguration {
            reason: e.to_string(),
        })
    }
}

/// Default bound on concurrently running stages.
pub const DEFAULT_STAGE_CONCURRENCY: usize = 8;

/// Shared handle to a step record.
pub type StepHandle = Arc<Mutex<StepRecord>>;
/// Shared handle to a service record.
pub type ServiceHandle = Arc<Mutex<ServiceRecord>>;
/// Shared handle to a log record.
pub type LogHandle = Arc<Mutex<LogRecord>>;

/// Static metadata the engine injects into every container.
#[derive(Debug, Clone)]
pub struct EngineMeta {
    /// Worker hostname
    pub hostname: String,
    /// Branch the build runs for
    pub branch: String,
    /// Event that triggered the build
    pub event: String,
    /// Repository full name
    pub repo: String,
}

impl Default for EngineMeta {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            branch: String::new(),
            event: String::new(),
            repo: String::new(),
        }
    }
}

/// All state scoped to one build execution.
///
/// Nothing here is process-wide: step, service and log handles live in
/// per-build concurrent maps keyed by container id, the secret map is
/// populated once at plan time and read-only afterwards, and the
/// cancellation token threads through every runtime and API call.
pub struct Engine {
    pub(crate) meta: EngineMeta,
    pub(crate) pipeline: Arc<Pipeline>,
    pub(crate) runtime: Arc<dyn Runtime>,
    pub(crate) reporter: Reporter,
    pub(crate) build: Arc<Mutex<BuildRecord>>,
    pub(crate) steps: DashMap<String, StepHandle>,
    pub(crate) services: DashMap<String, ServiceHandle>,
    pub(crate) logs: DashMap<String, LogHandle>,
    pub(crate) secrets: DashMap<String, Secret>,
    /// Containers after env injection, secret injection and substitution,
    /// keyed by container id.
    pub(crate) prepared: DashMap<String, Container>,
    /// External build token; cancelling it kills the build.
    pub(crate) token: CancellationToken,
    /// Child token owning log tails; cancelled by teardown so tails that
    /// outlive their step are reaped.
    pub(crate) stream_token: CancellationToken,
    pub(crate) streamers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    /// Gating status the rulesets evaluate against.
    pub(crate) outcome: std::sync::RwLock<Status>,
    /// Summary message for a fatal build error.
    pub(crate) fatal: std::sync::Mutex<Option<(Status, String)>>,
    /// Bounds how many stages run concurrently within a wave.
    pub(crate) stage_limit: Arc<tokio::sync::Semaphore>,
}

impl Engine {
    /// Creates an engine for one build.
    #[must_use]
    pub fn new(
        pipeline: Pipeline,
        build: BuildRecord,
        runtime: Arc<dyn Runtime>,
        api: Arc<dyn ControlPlane>,
        meta: EngineMeta,
        token: CancellationToken,
    ) -> Self {
        let stream_token = token.child_token();
        Self {
            meta,
            pipeline: Arc::new(pipeline),
            runtime,
            reporter: Reporter::new(api),
            build: Arc::new(Mutex::new(build)),
            steps: DashMap::new(),
            services: DashMap::new(),
            logs: DashMap::new(),
            secrets: DashMap::new(),
            prepared: DashMap::new(),
            token,
            stream_token,
            streamers: std::sync::Mutex::new(Vec::new()),
            outcome: std::sync::RwLock::new(Status::Running),
            fatal: std::sync::Mutex::new(None),
            stage_limit: Arc::new(tokio::sync::Semaphore::new(DEFAULT_STAGE_CONCURRENCY)),
        }
    }

    /// Bounds concurrent stage execution to `threads`.
    #[must_use]
    pub fn with_stage_concurrency(mut self, threads: usize) -> Self {
        self.stage_limit = Arc::new(tokio::sync::Semaphore::new(threads.max(1)));
        self
    }

    /// The pipeline being executed.
    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// The fully-prepared form of a container (after metadata env,
    /// secret injection and substitution), once assembly has run.
    #[must_use]
    pub fn prepared_container(&self, id: &str) -> Option<Container> {
        self.prepared.get(id).map(|c| c.value().clone())
    }

    /// Current gating status rule evaluation sees.
    #[must_use]
    pub fn outcome(&self) -> Status {
        *self.outcome.read().expect("outcome lock poisoned")
    }

    /// Folds a unit outcome into the gating status.
    pub(crate) fn merge_outcome(&self, status: Status) {
        let mut outcome = self.outcome.write().expect("outcome lock poisoned");
        *outcome = outcome.merge(status);
    }

    /// Records a fatal error so teardown can upload a terminal build
    /// status and surface a summary message.
    pub fn fail(&self, err: &ExecutorError) {
        let (status, message) = if err.is_cancelled() {
            (Status::Killed, "build cancelled".to_string())
        } else {
            (Status::Error, err.to_string())
        };
        *self.fatal.lock().expect("fatal lock poisoned") = Some((status, message));
    }

    pub(crate) fn spawn_streamer(&self, handle: JoinHandle<()>) {
        self.streamers
            .lock()
            .expect("streamer lock poisoned")
            .push(handle);
    }
}
