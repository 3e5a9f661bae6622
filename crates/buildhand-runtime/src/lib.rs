//! # Buildhand Runtime
//!
//! Container runtime abstraction for buildhand.
//!
//! The executor consumes the [`Runtime`] capability set; concrete drivers
//! implement it. Two drivers ship here:
//!
//! - `docker`: the Docker Engine API via bollard
//! - `mock`: a scriptable in-memory driver for tests and dry runs
//!
//! Every operation fails with a classified [`RuntimeError`]; classification
//! is the driver's responsibility and only [`RuntimeErrorKind::Transient`]
//! is worth retrying at the caller's boundary.

#![warn(missing_docs)]
#![warn(unused)]

pub mod docker;
pub mod mock;

pub use docker::DockerRuntime;
pub use mock::{ContainerPlan, MockRuntime};

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use buildhand_core::{Container, Pipeline};

/// Combined stdout+stderr byte stream of a container.
///
/// Closes when the container terminates, or early when the cancellation
/// token handed to [`Runtime::tail_container`] fires.
pub type TailStream = Box<dyn AsyncRead + Send + Unpin>;

/// Terminal state observed on a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContainerInspection {
    /// Exit code of the main process
    pub exit_code: i64,
    /// True while the container has not reached a terminal state
    pub running: bool,
}

/// Runtime error with an opaque public face.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct RuntimeError(#[from] RuntimeErrorKind);

/// Classified runtime failures.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeErrorKind {
    /// The backend cannot be reached at all
    #[error("runtime unavailable: {reason}")]
    Unavailable {
        /// Driver-supplied description
        reason: String,
    },
    /// A retriable failure; the only kind worth retrying
    #[error("transient runtime failure: {reason}")]
    Transient {
        /// Driver-supplied description
        reason: String,
    },
    /// The referenced object does not exist
    #[error("not found: {object}")]
    NotFound {
        /// Missing object description
        object: String,
    },
    /// The operation cannot proceed in the current state
    #[error("precondition failed: {reason}")]
    PreconditionFailed {
        /// Driver-supplied description
        reason: String,
    },
    /// The backend refused the operation
    #[error("permission denied: {reason}")]
    PermissionDenied {
        /// Driver-supplied description
        reason: String,
    },
    /// The operation was cancelled through its token
    #[error("cancelled")]
    Cancelled,
    /// Anything else
    #[error("runtime error: {reason}")]
    Internal {
        /// Driver-supplied description
        reason: String,
    },
}

impl RuntimeError {
    /// The classified kind.
    #[must_use]
    pub fn kind(&self) -> &RuntimeErrorKind {
        &self.0
    }

    /// True for failures worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self.0, RuntimeErrorKind::Transient { .. })
    }

    /// True when the referenced object does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self.0, RuntimeErrorKind::NotFound { .. })
    }
}

/// Runtime result type.
pub type RuntimeResult<T = ()> = Result<T, RuntimeError>;

/// The capability set the executor drives containers through.
///
/// Build-scoped operations are idempotent; `remove_*` operations succeed
/// when the target is already gone so teardown can run after partial
/// setup. A backend whose pods carry implicit volume lifecycle may
/// implement the volume operations as no-ops.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Identifier of the backend ("docker", "mock"), injected into
    /// container environments and step records.
    fn driver(&self) -> &'static str;

    /// Prepares build-scoped resources: network and shared volume.
    async fn setup_build(&self, pipeline: &Pipeline) -> RuntimeResult;

    /// Finalizes build-scoped resources once services are up.
    async fn assemble_build(&self, pipeline: &Pipeline) -> RuntimeResult;

    /// Releases all build-scoped resources. Must succeed even when setup
    /// only partially completed.
    async fn remove_build(&self, pipeline: &Pipeline) -> RuntimeResult;

    /// Creates the pipeline volume.
    async fn create_volume(&self, pipeline: &Pipeline) -> RuntimeResult;

    /// Inspects the pipeline volume.
    async fn inspect_volume(&self, pipeline: &Pipeline) -> RuntimeResult<Vec<u8>>;

    /// Removes the pipeline volume.
    async fn remove_volume(&self, pipeline: &Pipeline) -> RuntimeResult;

    /// Creates the pipeline network.
    async fn create_network(&self, pipeline: &Pipeline) -> RuntimeResult;

    /// Inspects the pipeline network.
    async fn inspect_network(&self, pipeline: &Pipeline) -> RuntimeResult<Vec<u8>>;

    /// Removes the pipeline network.
    async fn remove_network(&self, pipeline: &Pipeline) -> RuntimeResult;

    /// Pulls the image per policy and creates the container. No execution.
    async fn setup_container(&self, ctn: &Container) -> RuntimeResult;

    /// Starts the container. Returns after start, not completion.
    async fn run_container(&self, pipeline: &Pipeline, ctn: &Container) -> RuntimeResult;

    /// Opens the combined output stream of the container.
    async fn tail_container(
        &self,
        ctn: &Container,
        token: CancellationToken,
    ) -> RuntimeResult<TailStream>;

    /// Blocks until the container reaches a terminal state.
    async fn wait_container(&self, ctn: &Container) -> RuntimeResult;

    /// Reads the exit code and terminal state of the container.
    async fn inspect_container(&self, ctn: &Container) -> RuntimeResult<ContainerInspection>;

    /// Destroys the container. A no-op when it does not exist.
    async fn remove_container(&self, ctn: &Container) -> RuntimeResult;
}

/// Connects the driver selected by identifier.
///
/// Unknown identifiers fail with [`RuntimeErrorKind::PreconditionFailed`]
/// (a configuration error); reachable-but-broken backends fail with
/// [`RuntimeErrorKind::Unavailable`].
pub async fn connect(driver: &str) -> RuntimeResult<Arc<dyn Runtime>> {
    match driver {
        "docker" => Ok(Arc::new(DockerRuntime::connect().await?)),
        "mock" => Ok(Arc::new(MockRuntime::new())),
        other => Err(RuntimeError::from(RuntimeErrorKind::PreconditionFailed {
            reason: format!("unknown runtime driver '{other}'"),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification_helpers() {
        let transient = RuntimeError::from(RuntimeErrorKind::Transient {
            reason: "socket hiccup".to_string(),
        });
        assert!(transient.is_transient());
        assert!(!transient.is_not_found());

        let missing = RuntimeError::from(RuntimeErrorKind::NotFound {
            object: "container x".to_string(),
        });
        assert!(missing.is_not_found());
        assert!(!missing.is_transient());
    }

    #[tokio::test]
    async fn test_connect_unknown_driver() {
        let err = connect("warp-drive").await.err().expect("must fail");
        assert!(matches!(err.kind(), RuntimeErrorKind::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn test_connect_mock() {
        let runtime = connect("mock").await.expect("mock always connects");
        assert_eq!(runtime.driver(), "mock");
    }
}
