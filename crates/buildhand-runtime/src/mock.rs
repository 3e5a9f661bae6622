//! Scriptable in-memory driver.
//!
//! Used by executor tests and dry runs. Each container can be given a
//! [`ContainerPlan`] scripting its exit code, emitted log bytes, injected
//! transient setup failures and run duration; the driver records every
//! setup and remove call so tests can assert the cleanup invariant.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use buildhand_core::{Container, Pipeline};

use crate::{
    ContainerInspection, Runtime, RuntimeError, RuntimeErrorKind, RuntimeResult, TailStream,
};

/// Scripted behavior for one container, keyed by container name.
#[derive(Debug, Clone)]
pub struct ContainerPlan {
    /// Exit code reported by inspect
    pub exit_code: i64,
    /// Bytes emitted on the tail stream
    pub logs: Vec<u8>,
    /// Number of setup calls that fail transiently before one succeeds
    pub transient_setup_failures: u32,
    /// How long wait_container blocks
    pub run_duration: Duration,
    /// Keep the tail open until the container is removed (service-like)
    pub tail_until_removed: bool,
}

impl Default for ContainerPlan {
    fn default() -> Self {
        Self {
            exit_code: 0,
            logs: Vec::new(),
            transient_setup_failures: 0,
            run_duration: Duration::ZERO,
            tail_until_removed: false,
        }
    }
}

impl ContainerPlan {
    /// Sets the exit code.
    #[must_use]
    pub fn with_exit_code(mut self, code: i64) -> Self {
        self.exit_code = code;
        self
    }

    /// Sets the emitted log bytes.
    #[must_use]
    pub fn with_logs(mut self, logs: impl Into<Vec<u8>>) -> Self {
        self.logs = logs.into();
        self
    }

    /// Injects transient setup failures.
    #[must_use]
    pub fn with_transient_setup_failures(mut self, count: u32) -> Self {
        self.transient_setup_failures = count;
        self
    }

    /// Sets how long the container "runs".
    #[must_use]
    pub fn with_run_duration(mut self, duration: Duration) -> Self {
        self.run_duration = duration;
        self
    }

    /// Keeps the tail open until removal.
    #[must_use]
    pub fn held_open(mut self) -> Self {
        self.tail_until_removed = true;
        self
    }
}

/// In-memory runtime driver.
#[derive(Clone, Default)]
pub struct MockRuntime {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    plans: DashMap<String, ContainerPlan>,
    pending_setup_failures: DashMap<String, u32>,
    setups: DashMap<String, usize>,
    removes: DashMap<String, usize>,
    created: DashMap<String, Arc<Notify>>,
    builds_setup: AtomicUsize,
    builds_removed: AtomicUsize,
}

impl MockRuntime {
    /// Creates a driver with no scripted containers; everything succeeds
    /// with exit code 0 and no output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the behavior of a container by name.
    pub fn plan(&self, name: impl Into<String>, plan: ContainerPlan) {
        let name = name.into();
        self.inner
            .pending_setup_failures
            .insert(name.clone(), plan.transient_setup_failures);
        self.inner.plans.insert(name, plan);
    }

    fn plan_for(&self, name: &str) -> ContainerPlan {
        self.inner
            .plans
            .get(name)
            .map(|p| p.value().clone())
            .unwrap_or_default()
    }

    /// Successful setup calls seen for a container.
    #[must_use]
    pub fn setup_count(&self, name: &str) -> usize {
        self.inner.setups.get(name).map_or(0, |c| *c.value())
    }

    /// Remove calls seen for a container.
    #[must_use]
    pub fn remove_count(&self, name: &str) -> usize {
        self.inner.removes.get(name).map_or(0, |c| *c.value())
    }

    /// Names of containers that completed setup, sorted.
    #[must_use]
    pub fn set_up_containers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.setups.iter().map(|e| e.key().clone()).collect();
        names.sort_unstable();
        names
    }

    /// Names of containers that were removed at least once, sorted.
    #[must_use]
    pub fn removed_containers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.removes.iter().map(|e| e.key().clone()).collect();
        names.sort_unstable();
        names
    }

    /// Build-scope setup calls seen.
    #[must_use]
    pub fn builds_setup(&self) -> usize {
        self.inner.builds_setup.load(Ordering::SeqCst)
    }

    /// Build-scope remove calls seen.
    #[must_use]
    pub fn builds_removed(&self) -> usize {
        self.inner.builds_removed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    fn driver(&self) -> &'static str {
        "mock"
    }

    async fn setup_build(&self, _pipeline: &Pipeline) -> RuntimeResult {
        self.inner.builds_setup.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn assemble_build(&self, _pipeline: &Pipeline) -> RuntimeResult {
        Ok(())
    }

    async fn remove_build(&self, _pipeline: &Pipeline) -> RuntimeResult {
        self.inner.builds_removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_volume(&self, _pipeline: &Pipeline) -> RuntimeResult {
        Ok(())
    }

    async fn inspect_volume(&self, pipeline: &Pipeline) -> RuntimeResult<Vec<u8>> {
        Ok(pipeline.volume_name().into_bytes())
    }

    async fn remove_volume(&self, _pipeline: &Pipeline) -> RuntimeResult {
        Ok(())
    }

    async fn create_network(&self, _pipeline: &Pipeline) -> RuntimeResult {
        Ok(())
    }

    async fn inspect_network(&self, pipeline: &Pipeline) -> RuntimeResult<Vec<u8>> {
        Ok(pipeline.network().into_bytes())
    }

    async fn remove_network(&self, _pipeline: &Pipeline) -> RuntimeResult {
        Ok(())
    }

    async fn setup_container(&self, ctn: &Container) -> RuntimeResult {
        if let Some(mut pending) = self.inner.pending_setup_failures.get_mut(&ctn.name) {
            if *pending.value() > 0 {
                *pending.value_mut() -= 1;
                return Err(RuntimeError::from(RuntimeErrorKind::Transient {
                    reason: format!("injected transient setup failure for '{}'", ctn.name),
                }));
            }
        }

        *self.inner.setups.entry(ctn.name.clone()).or_insert(0) += 1;
        self.inner
            .created
            .insert(ctn.name.clone(), Arc::new(Notify::new()));
        Ok(())
    }

    async fn run_container(&self, _pipeline: &Pipeline, ctn: &Container) -> RuntimeResult {
        if !self.inner.created.contains_key(&ctn.name) {
            return Err(RuntimeError::from(RuntimeErrorKind::NotFound {
                object: format!("container '{}'", ctn.name),
            }));
        }
        Ok(())
    }

    async fn tail_container(
        &self,
        ctn: &Container,
        token: CancellationToken,
    ) -> RuntimeResult<TailStream> {
        let removed = self
            .inner
            .created
            .get(&ctn.name)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| {
                RuntimeError::from(RuntimeErrorKind::NotFound {
                    object: format!("container '{}'", ctn.name),
                })
            })?;

        let plan = self.plan_for(&ctn.name);
        let (reader, mut writer) = tokio::io::duplex(64 * 1024);

        tokio::spawn(async move {
            let _ = writer.write_all(&plan.logs).await;
            if plan.tail_until_removed {
                tokio::select! {
                    _ = removed.notified() => {}
                    _ = token.cancelled() => {}
                }
            }
            // dropping the writer closes the tail
        });

        Ok(Box::new(reader))
    }

    async fn wait_container(&self, ctn: &Container) -> RuntimeResult {
        let plan = self.plan_for(&ctn.name);
        if !plan.run_duration.is_zero() {
            tokio::time::sleep(plan.run_duration).await;
        }
        Ok(())
    }

    async fn inspect_container(&self, ctn: &Container) -> RuntimeResult<ContainerInspection> {
        if !self.inner.created.contains_key(&ctn.name) {
            return Err(RuntimeError::from(RuntimeErrorKind::NotFound {
                object: format!("container '{}'", ctn.name),
            }));
        }
        let plan = self.plan_for(&ctn.name);
        Ok(ContainerInspection {
            exit_code: plan.exit_code,
            running: false,
        })
    }

    async fn remove_container(&self, ctn: &Container) -> RuntimeResult {
        // removing a container that was never created stays a no-op success
        if let Some((_, notify)) = self.inner.created.remove(&ctn.name) {
            notify.notify_waiters();
            *self.inner.removes.entry(ctn.name.clone()).or_insert(0) += 1;
        }
        Ok(())
    }
}
