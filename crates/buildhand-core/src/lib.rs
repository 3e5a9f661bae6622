//! # Buildhand Core
//!
//! Core domain types for the buildhand build worker.
//!
//! This crate defines the compiled pipeline model a worker receives from the
//! queue, the record types it synchronizes with the control plane, and the
//! pure helpers the executor builds on.
//!
//! ## Architecture
//!
//! The crate is organized in bounded contexts:
//!
//! - `pipeline`: Pipeline, Stage and Volume definitions
//! - `container`: the unit of execution and its pull policy
//! - `ruleset`: gating rules evaluated against build metadata
//! - `secret`: resolved secrets and per-container references
//! - `status`: the shared build/step/service status machine
//! - `record`: build, step, service and log records
//! - `substitute`: environment variable substitution
//!
//! ## Example
//!
//! ```rust
//! use buildhand_core::{Container, Pipeline, Stage};
//!
//! let pipeline = Pipeline::new("pipeline_42")
//!     .with_stage(Stage::new("build").with_step(Container::new("compile", "rust:1.77", 1)))
//!     .with_stage(Stage::new("publish").with_need("build"));
//!
//! assert!(pipeline.validate().is_ok());
//! ```

#![warn(missing_docs)]
#![warn(unused)]

pub mod container;
pub mod pipeline;
pub mod record;
pub mod ruleset;
pub mod secret;
pub mod status;
pub mod substitute;

// Re-exports for common use
pub use container::{Container, PullPolicy};
pub use pipeline::{Pipeline, Stage, ValidationError, Volume};
pub use record::{BuildRecord, LogRecord, ServiceRecord, StepRecord};
pub use ruleset::{RuleData, Rules, Ruleset};
pub use secret::{Secret, SecretRef, SecretSpec};
pub use status::Status;
pub use substitute::{substitute, SubstituteError};

/// Buildhand core version, injected into container environments.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the synthetic initial step.
///
/// A container with this name is a marker produced by pipeline compilation;
/// it is never set up, executed or destroyed.
pub const INIT_STEP: &str = "init";
