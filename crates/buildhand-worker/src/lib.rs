//! # Buildhand Worker
//!
//! Queue consumer and operate loop for buildhand. The worker claims
//! pipeline build items from a shared queue, filters them by routing
//! labels, and drives each one through the executor's lifecycle with a
//! build timeout and a teardown that runs on every exit path.
//!
//! ## Architecture
//!
//! - `config`: recognized worker options
//! - `queue`: the queue item envelope, the `Queue` trait and the
//!   in-memory queue
//! - `worker`: the operate loop
//!
//! One worker executes one build at a time per executor instance.

#![warn(missing_docs)]
#![warn(unused)]

pub mod config;
pub mod queue;
pub mod worker;

pub use config::Config;
pub use queue::{InMemoryQueue, Queue, QueueItem, Repo};
pub use worker::Worker;

/// Worker error with an opaque public face.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct WorkerError(#[from] WorkerErrorKind);

/// Specific worker error kinds.
#[derive(Debug, thiserror::Error)]
pub enum WorkerErrorKind {
    /// The worker configuration is unusable
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration {
        /// What is wrong
        reason: String,
    },

    /// The queue backend failed
    #[error("queue unavailable: {reason}")]
    QueueUnavailable {
        /// Backend-supplied description
        reason: String,
    },

    /// A claimed build failed to execute
    #[error("build execution failed: {reason}")]
    ExecutionFailed {
        /// Executor-supplied description
        reason: String,
    },
}

impl WorkerError {
    /// The specific kind.
    #[must_use]
    pub fn kind(&self) -> &WorkerErrorKind {
        &self.0
    }
}

/// Worker result type.
pub type WorkerResult<T = ()> = Result<T, WorkerError>;
