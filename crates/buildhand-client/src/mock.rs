//! In-memory control plane for tests.
//!
//! Records the full history of every upload so tests can assert status
//! transitions, upload counts and cumulative log growth. Failures can be
//! injected to exercise the executor's retry and error paths.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use buildhand_core::{BuildRecord, LogRecord, Secret, SecretSpec, ServiceRecord, StepRecord, Status};

use crate::error::{ClientError, Result};
use crate::ControlPlane;

/// An in-memory, history-keeping control plane.
#[derive(Clone, Default)]
pub struct FakeControlPlane {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    builds: Mutex<Vec<BuildRecord>>,
    steps: DashMap<u32, Vec<StepRecord>>,
    services: DashMap<u32, Vec<ServiceRecord>>,
    step_logs: DashMap<u32, LogRecord>,
    step_log_uploads: DashMap<u32, Vec<Vec<u8>>>,
    service_logs: DashMap<u32, LogRecord>,
    service_log_uploads: DashMap<u32, Vec<Vec<u8>>>,
    secrets: DashMap<String, Secret>,
    failures_remaining: AtomicU32,
}

impl FakeControlPlane {
    /// Creates an empty fake.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a secret the executor can resolve.
    pub fn add_secret(&self, secret: Secret) {
        self.inner.secrets.insert(secret.name.clone(), secret);
    }

    /// Makes the next `count` record/log updates fail with a 503.
    pub fn fail_next_updates(&self, count: u32) {
        self.inner.failures_remaining.store(count, Ordering::SeqCst);
    }

    fn maybe_fail(&self) -> Result<()> {
        let remaining = &self.inner.failures_remaining;
        let mut current = remaining.load(Ordering::SeqCst);
        while current > 0 {
            match remaining.compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Err(ClientError::api(503, "injected outage")),
                Err(actual) => current = actual,
            }
        }
        Ok(())
    }

    /// Every build record upload, in order.
    #[must_use]
    pub fn build_history(&self) -> Vec<BuildRecord> {
        self.inner.builds.lock().expect("builds lock").clone()
    }

    /// The most recently uploaded build status.
    #[must_use]
    pub fn last_build_status(&self) -> Option<Status> {
        self.build_history().last().map(|b| b.status)
    }

    /// Every upload of the step record with this number, in order.
    #[must_use]
    pub fn step_history(&self, number: u32) -> Vec<StepRecord> {
        self.inner
            .steps
            .get(&number)
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }

    /// Every upload of the service record with this number, in order.
    #[must_use]
    pub fn service_history(&self, number: u32) -> Vec<ServiceRecord> {
        self.inner
            .services
            .get(&number)
            .map(|h| h.value().clone())
            .unwrap_or_default()
    }

    /// Cumulative log bytes the server currently holds for a step.
    #[must_use]
    pub fn step_log_data(&self, number: u32) -> Vec<u8> {
        self.inner
            .step_logs
            .get(&number)
            .map(|l| l.value().data.clone())
            .unwrap_or_default()
    }

    /// Cumulative log bytes the server currently holds for a service.
    #[must_use]
    pub fn service_log_data(&self, number: u32) -> Vec<u8> {
        self.inner
            .service_logs
            .get(&number)
            .map(|l| l.value().data.clone())
            .unwrap_or_default()
    }

    /// Snapshot of the payload data at each step-log upload, in order.
    #[must_use]
    pub fn step_log_uploads(&self, number: u32) -> Vec<Vec<u8>> {
        self.inner
            .step_log_uploads
            .get(&number)
            .map(|u| u.value().clone())
            .unwrap_or_default()
    }

    /// Number of step-log upload calls observed for a container.
    #[must_use]
    pub fn step_log_upload_count(&self, number: u32) -> usize {
        self.step_log_uploads(number).len()
    }

    /// Snapshot of the payload data at each service-log upload, in order.
    #[must_use]
    pub fn service_log_uploads(&self, number: u32) -> Vec<Vec<u8>> {
        self.inner
            .service_log_uploads
            .get(&number)
            .map(|u| u.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn update_build(&self, build: &BuildRecord) -> Result<BuildRecord> {
        self.maybe_fail()?;
        self.inner
            .builds
            .lock()
            .expect("builds lock")
            .push(build.clone());
        Ok(build.clone())
    }

    async fn update_step(&self, step: &StepRecord) -> Result<StepRecord> {
        self.maybe_fail()?;
        self.inner
            .steps
            .entry(step.number)
            .or_default()
            .push(step.clone());
        Ok(step.clone())
    }

    async fn update_service(&self, service: &ServiceRecord) -> Result<ServiceRecord> {
        self.maybe_fail()?;
        self.inner
            .services
            .entry(service.number)
            .or_default()
            .push(service.clone());
        Ok(service.clone())
    }

    async fn get_step_log(&self, build_id: Uuid, number: u32) -> Result<LogRecord> {
        let log = self
            .inner
            .step_logs
            .entry(number)
            .or_insert_with(|| LogRecord::new(build_id, number));
        Ok(log.value().clone())
    }

    async fn update_step_log(&self, log: &LogRecord) -> Result<LogRecord> {
        self.maybe_fail()?;
        self.inner.step_logs.insert(log.number, log.clone());
        self.inner
            .step_log_uploads
            .entry(log.number)
            .or_default()
            .push(log.data.clone());
        Ok(log.clone())
    }

    async fn get_service_log(&self, build_id: Uuid, number: u32) -> Result<LogRecord> {
        let log = self
            .inner
            .service_logs
            .entry(number)
            .or_insert_with(|| LogRecord::new(build_id, number));
        Ok(log.value().clone())
    }

    async fn update_service_log(&self, log: &LogRecord) -> Result<LogRecord> {
        self.maybe_fail()?;
        self.inner.service_logs.insert(log.number, log.clone());
        self.inner
            .service_log_uploads
            .entry(log.number)
            .or_default()
            .push(log.data.clone());
        Ok(log.clone())
    }

    async fn get_secret(&self, spec: &SecretSpec) -> Result<Secret> {
        self.inner
            .secrets
            .get(&spec.name)
            .map(|s| s.value().clone())
            .ok_or_else(|| ClientError::NotFound(format!("secret '{}'", spec.name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_histories_accumulate_in_order() {
        let fake = FakeControlPlane::new();
        let build_id = Uuid::new_v4();

        let mut build = BuildRecord::new(build_id, 1, "worker-1");
        build.status = Status::Running;
        fake.update_build(&build).await.unwrap();
        build.status = Status::Success;
        fake.update_build(&build).await.unwrap();

        let history = fake.build_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, Status::Running);
        assert_eq!(history[1].status, Status::Success);
    }

    #[tokio::test]
    async fn test_log_uploads_record_snapshots() {
        let fake = FakeControlPlane::new();
        let build_id = Uuid::new_v4();

        let mut log = fake.get_step_log(build_id, 3).await.unwrap();
        log.append(b"one\n");
        fake.update_step_log(&log).await.unwrap();
        log.append(b"two\n");
        fake.update_step_log(&log).await.unwrap();

        assert_eq!(fake.step_log_upload_count(3), 2);
        assert_eq!(fake.step_log_data(3), b"one\ntwo\n");

        // earlier payloads are prefixes of later ones
        let uploads = fake.step_log_uploads(3);
        assert!(uploads[1].starts_with(&uploads[0]));
    }

    #[tokio::test]
    async fn test_injected_failures_deplete() {
        let fake = FakeControlPlane::new();
        fake.fail_next_updates(1);

        let build = BuildRecord::new(Uuid::new_v4(), 1, "worker-1");
        let err = fake.update_build(&build).await.unwrap_err();
        assert!(err.is_retriable());
        fake.update_build(&build).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_secret_is_not_found() {
        let fake = FakeControlPlane::new();
        let spec = SecretSpec {
            name: "ghost".to_string(),
            ..SecretSpec::default()
        };
        assert!(fake.get_secret(&spec).await.unwrap_err().is_not_found());
    }
}
