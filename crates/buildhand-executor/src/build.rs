//! The build lifecycle.
//!
//! The outer worker loop invokes these five operations in order and owns
//! the guarantee that `destroy_build` runs on every exit path. Teardown
//! decouples from the build's cancellation token and bounds every call
//! with its own deadline so removal succeeds even for a cancelled build.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use buildhand_core::{Container, Status};

use crate::{Engine, ExecutorError, ExecutorErrorKind, ExecutorResult};

/// Deadline for each teardown call.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);
/// How long teardown waits for log streamers to finish their final flush.
const STREAMER_TIMEOUT: Duration = Duration::from_secs(10);

impl Engine {
    /// Initializes executor state and uploads the running build record.
    ///
    /// Fails iff the control plane rejects the initial update.
    pub async fn create_build(&self) -> ExecutorResult {
        info!(pipeline = %self.pipeline.id, "creating build");

        {
            let mut build = self.build.lock().await;
            build.status = Status::Running;
            build.started = Some(Utc::now());
            build.host = self.meta.hostname.clone();
        }

        self.reporter.upload_build(&self.build).await
    }

    /// Validates the pipeline, creates build-scoped resources, resolves
    /// secrets and uploads planned step skeletons.
    pub async fn plan_build(&self) -> ExecutorResult {
        info!(pipeline = %self.pipeline.id, "planning build");

        self.pipeline.validate()?;

        debug!("setting up build-scoped resources");
        crate::reporter::retry(
            "build setup",
            |e: &ExecutorError| {
                matches!(e.kind(), ExecutorErrorKind::Runtime { source } if source.is_transient())
            },
            move || {
                let runtime = self.runtime.clone();
                let pipeline = Arc::clone(&self.pipeline);
                async move { runtime.setup_build(&pipeline).await.map_err(ExecutorError::from) }
            },
        )
        .await?;

        debug!("resolving secrets");
        for spec in &self.pipeline.secrets {
            let api = self.reporter.api();
            let secret = crate::reporter::retry(
                "secret fetch",
                buildhand_client::ClientError::is_retriable,
                move || api.get_secret(spec),
            )
            .await?;
            self.secrets.insert(secret.name.clone(), secret);
        }

        let build_id = self.build.lock().await.id;

        debug!("uploading planned steps");
        for stage in &self.pipeline.stages {
            for ctn in &stage.steps {
                if ctn.is_init() {
                    continue;
                }

                let record = crate::step::planned_record(build_id, ctn);
                let handle = Arc::new(Mutex::new(record));
                self.reporter.upload_step(&handle).await?;
                self.steps.insert(ctn.id.clone(), handle);

                let api = self.reporter.api();
                let number = ctn.number;
                let log = crate::reporter::retry(
                    "step log fetch",
                    buildhand_client::ClientError::is_retriable,
                    move || api.get_step_log(build_id, number),
                )
                .await?;
                self.logs.insert(ctn.id.clone(), Arc::new(Mutex::new(log)));
            }
        }

        Ok(())
    }

    /// Prepares every container and finalizes build-scoped resources.
    /// Services must be reachable afterwards.
    pub async fn assemble_build(&self) -> ExecutorResult {
        info!(pipeline = %self.pipeline.id, "assembling build");

        for svc in &self.pipeline.services {
            let mut prepared = svc.clone();
            self.create_service(&mut prepared).await?;
            self.prepared.insert(prepared.id.clone(), prepared);
        }

        for stage in &self.pipeline.stages {
            for ctn in &stage.steps {
                let mut prepared = ctn.clone();
                self.create_step(&mut prepared).await?;
                self.prepared.insert(prepared.id.clone(), prepared);
            }
        }

        self.runtime.assemble_build(&self.pipeline).await?;
        Ok(())
    }

    /// Runs all services, then all stages per the dependency graph.
    pub async fn exec_build(&self) -> ExecutorResult {
        info!(pipeline = %self.pipeline.id, "executing build");

        for svc in &self.pipeline.services {
            let prepared = self
                .prepared
                .get(&svc.id)
                .map(|c| c.value().clone())
                .unwrap_or_else(|| svc.clone());
            self.plan_service(&prepared).await?;
            self.exec_service(&prepared).await?;
        }

        self.exec_stages().await?;

        // nothing failed if the gating status never regressed
        Ok(())
    }

    /// Tears the build down: streamers, step containers, service
    /// containers, build-scoped resources, then the terminal build record.
    ///
    /// Best-effort throughout: per-resource failures are collected, never
    /// short-circuiting later teardown, and surfaced in one aggregate
    /// error the caller treats as telemetry.
    pub async fn destroy_build(&self) -> ExecutorResult {
        info!(pipeline = %self.pipeline.id, "destroying build");
        let mut errors: Vec<String> = Vec::new();

        // reap tails that outlive their step, then let streamers land
        // their final flush
        self.stream_token.cancel();
        let streamers: Vec<_> = {
            let mut guard = self.streamers.lock().expect("streamer lock poisoned");
            guard.drain(..).collect()
        };
        for mut streamer in streamers {
            if timeout(STREAMER_TIMEOUT, &mut streamer).await.is_err() {
                warn!("log streamer did not finish in time, aborting it");
                streamer.abort();
            }
        }

        // steps, in declaration order
        for stage in &self.pipeline.stages {
            for ctn in &stage.steps {
                if ctn.is_init() {
                    continue;
                }
                let prepared = self.prepared_or(ctn);

                if let Err(e) = self.reconcile_step(&prepared).await {
                    errors.push(format!("step '{}' state: {e}", prepared.name));
                }
                match timeout(CLEANUP_TIMEOUT, self.destroy_step(&prepared)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => errors.push(format!("step '{}': {e}", prepared.name)),
                    Err(_) => errors.push(format!("step '{}': removal timed out", prepared.name)),
                }
            }
        }

        // services, torn down only here
        for svc in &self.pipeline.services {
            let prepared = self.prepared_or(svc);
            match timeout(CLEANUP_TIMEOUT, self.destroy_service(&prepared)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errors.push(format!("service '{}': {e}", prepared.name)),
                Err(_) => errors.push(format!("service '{}': removal timed out", prepared.name)),
            }
        }

        // network and volume
        match timeout(CLEANUP_TIMEOUT, self.runtime.remove_build(&self.pipeline)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.push(format!("build resources: {e}")),
            Err(_) => errors.push("build resources: removal timed out".to_string()),
        }

        // terminal build record, last
        if let Err(e) = self.finalize_build().await {
            errors.push(format!("build record: {e}"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ExecutorError::from(ExecutorErrorKind::Internal {
                reason: format!("teardown completed with errors: {}", errors.join("; ")),
            }))
        }
    }

    fn prepared_or(&self, ctn: &Container) -> Container {
        self.prepared
            .get(&ctn.id)
            .map(|c| c.value().clone())
            .unwrap_or_else(|| ctn.clone())
    }

    /// Drives a step record that never reached a terminal state to one:
    /// pending steps were skipped, running steps were killed.
    async fn reconcile_step(&self, ctn: &Container) -> ExecutorResult {
        let Some(handle) = self.steps.get(&ctn.id).map(|h| h.value().clone()) else {
            return Ok(());
        };

        let needs_upload = {
            let mut record = handle.lock().await;
            match record.status {
                Status::Pending => {
                    record.status = Status::Skipped;
                    record.finished = Some(Utc::now());
                    true
                }
                Status::Running => {
                    let exit_code = record.exit_code;
                    record.finish(Status::Killed, exit_code);
                    true
                }
                _ => false,
            }
        };

        if needs_upload {
            self.reporter.upload_step(&handle).await?;
        }
        Ok(())
    }

    /// Computes and uploads the terminal build record.
    async fn finalize_build(&self) -> ExecutorResult {
        let fatal = self.fatal.lock().expect("fatal lock poisoned").clone();

        let mut status = Status::Success;
        let step_handles: Vec<_> = self.steps.iter().map(|e| e.value().clone()).collect();
        for handle in step_handles {
            status = status.merge(handle.lock().await.status);
        }
        let service_handles: Vec<_> = self.services.iter().map(|e| e.value().clone()).collect();
        for handle in service_handles {
            status = status.merge(handle.lock().await.status);
        }
        if self.token.is_cancelled() {
            status = status.merge(Status::Killed);
        }

        let message = if let Some((fatal_status, message)) = fatal {
            status = status.merge(fatal_status);
            Some(message)
        } else {
            None
        };

        {
            let mut build = self.build.lock().await;
            if !build.status.is_terminal() {
                build.status = status;
            }
            build.finished = Some(Utc::now());
            if message.is_some() {
                build.message = message;
            }
        }

        self.reporter.upload_build(&self.build).await
    }
}
