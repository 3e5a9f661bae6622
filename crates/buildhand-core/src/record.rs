//! Records synchronized with the control plane.
//!
//! These mirror the control plane's persisted objects. The executor owns the
//! in-memory copies for the duration of one build and funnels every mutation
//! through its reporter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::container::Container;
use crate::status::Status;

/// The build record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    /// Build identifier
    pub id: Uuid,
    /// Build number within the repository
    pub number: u64,
    /// Aggregate status
    pub status: Status,
    /// When execution began
    pub started: Option<DateTime<Utc>>,
    /// When execution finished
    pub finished: Option<DateTime<Utc>>,
    /// Summary message surfaced to users on failure
    pub message: Option<String>,
    /// Worker host that executed the build
    pub host: String,
}

impl BuildRecord {
    /// Creates a pending build record.
    #[must_use]
    pub fn new(id: Uuid, number: u64, host: impl Into<String>) -> Self {
        Self {
            id,
            number,
            status: Status::Pending,
            started: None,
            finished: None,
            message: None,
            host: host.into(),
        }
    }
}

/// A step record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Record identifier
    pub id: Uuid,
    /// Owning build
    pub build_id: Uuid,
    /// Step name
    pub name: String,
    /// Container number within the pipeline
    pub number: u32,
    /// Current status
    pub status: Status,
    /// Container exit code once terminal
    pub exit_code: i64,
    /// When the step started
    pub started: Option<DateTime<Utc>>,
    /// When the step finished
    pub finished: Option<DateTime<Utc>>,
    /// Worker host
    pub host: String,
    /// Runtime driver identifier, as reported by the driver
    pub runtime: String,
    /// Host distribution
    pub distribution: String,
}

impl StepRecord {
    /// Creates a pending record for a container.
    #[must_use]
    pub fn for_container(build_id: Uuid, ctn: &Container) -> Self {
        Self {
            id: Uuid::new_v4(),
            build_id,
            name: ctn.name.clone(),
            number: ctn.number,
            status: Status::Pending,
            exit_code: 0,
            started: None,
            finished: None,
            host: String::new(),
            runtime: String::new(),
            distribution: String::new(),
        }
    }

    /// Marks the record finished with a terminal status.
    pub fn finish(&mut self, status: Status, exit_code: i64) {
        self.status = status;
        self.exit_code = exit_code;
        self.finished = Some(Utc::now());
    }
}

/// A service record. Shape matches [`StepRecord`]; services are reported on
/// a separate control-plane resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Record identifier
    pub id: Uuid,
    /// Owning build
    pub build_id: Uuid,
    /// Service name
    pub name: String,
    /// Container number within the pipeline
    pub number: u32,
    /// Current status
    pub status: Status,
    /// Container exit code once terminal
    pub exit_code: i64,
    /// When the service started
    pub started: Option<DateTime<Utc>>,
    /// When the service finished
    pub finished: Option<DateTime<Utc>>,
    /// Worker host
    pub host: String,
    /// Runtime driver identifier
    pub runtime: String,
    /// Host distribution
    pub distribution: String,
}

impl ServiceRecord {
    /// Creates a pending record for a container.
    #[must_use]
    pub fn for_container(build_id: Uuid, ctn: &Container) -> Self {
        Self {
            id: Uuid::new_v4(),
            build_id,
            name: ctn.name.clone(),
            number: ctn.number,
            status: Status::Pending,
            exit_code: 0,
            started: None,
            finished: None,
            host: String::new(),
            runtime: String::new(),
            distribution: String::new(),
        }
    }

    /// Marks the record finished with a terminal status.
    pub fn finish(&mut self, status: Status, exit_code: i64) {
        self.status = status;
        self.exit_code = exit_code;
        self.finished = Some(Utc::now());
    }
}

/// An append-only log record tied to one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Record identifier
    pub id: Uuid,
    /// Owning build
    pub build_id: Uuid,
    /// Container number the log belongs to
    pub number: u32,
    /// Accumulated log bytes
    #[serde(with = "serde_bytes_vec")]
    pub data: Vec<u8>,
}

impl LogRecord {
    /// Creates an empty log record.
    #[must_use]
    pub fn new(build_id: Uuid, number: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            build_id,
            number,
            data: Vec::new(),
        }
    }

    /// Appends bytes. The record is never truncated by the worker.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }
}

/// Log data travels as a base64 string in JSON payloads.
mod serde_bytes_vec {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
