//! # Buildhand Client
//!
//! Type-safe client for the buildhand control-plane API.
//!
//! The executor talks to the control plane exclusively through the
//! [`ControlPlane`] trait: build/step/service record updates, per-container
//! log append uploads, and secret resolution. Two implementations ship
//! here:
//!
//! - [`HttpControlPlane`]: the real thing, over HTTP with bearer auth
//! - [`mock::FakeControlPlane`]: an in-memory double that records every
//!   upload, for executor tests
//!
//! All update endpoints are idempotent with respect to repeated identical
//! payloads, which is what makes at-least-once log delivery safe.

#![warn(missing_docs)]
#![warn(unused)]

pub mod error;
pub mod http;
pub mod mock;

pub use error::{ClientError, Result};
pub use http::HttpControlPlane;
pub use mock::FakeControlPlane;

use async_trait::async_trait;
use uuid::Uuid;

use buildhand_core::{BuildRecord, LogRecord, Secret, SecretSpec, ServiceRecord, StepRecord};

/// Operations the executor core invokes against the control plane.
///
/// Each call returns the record as persisted by the server so callers can
/// adopt server-assigned fields.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Upserts the build record.
    async fn update_build(&self, build: &BuildRecord) -> Result<BuildRecord>;

    /// Upserts a step record.
    async fn update_step(&self, step: &StepRecord) -> Result<StepRecord>;

    /// Upserts a service record.
    async fn update_service(&self, service: &ServiceRecord) -> Result<ServiceRecord>;

    /// Fetches (or creates) the log record for a step.
    async fn get_step_log(&self, build_id: Uuid, number: u32) -> Result<LogRecord>;

    /// Replaces the log record for a step with the given cumulative data.
    async fn update_step_log(&self, log: &LogRecord) -> Result<LogRecord>;

    /// Fetches (or creates) the log record for a service.
    async fn get_service_log(&self, build_id: Uuid, number: u32) -> Result<LogRecord>;

    /// Replaces the log record for a service with the given cumulative data.
    async fn update_service_log(&self, log: &LogRecord) -> Result<LogRecord>;

    /// Resolves a secret declaration to its value.
    async fn get_secret(&self, spec: &SecretSpec) -> Result<Secret>;
}
