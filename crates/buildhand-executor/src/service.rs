//! The per-service create/plan/exec/destroy quartet.
//!
//! Services are long-lived containers: they start before any step runs,
//! are never waited on, and are destroyed only at build teardown. Their
//! logs stream exactly like step logs until the container is removed.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use buildhand_core::{Container, ServiceRecord, Status};

use crate::stream::{self, LogKind};
use crate::{Engine, ExecutorResult};

impl Engine {
    /// Prepares a service container: well-known env, runtime setup,
    /// secrets and substitution, same as a step.
    pub(crate) async fn create_service(&self, ctn: &mut Container) -> ExecutorResult {
        self.inject_metadata_env(ctn);

        debug!(service = %ctn.name, "setting up container");
        self.runtime.setup_container(ctn).await?;

        debug!(service = %ctn.name, "injecting secrets");
        crate::secret::inject(ctn, &self.secrets)?;

        self.substitute_container(ctn)
    }

    /// Uploads the running service record and fetches its log handle.
    pub(crate) async fn plan_service(&self, ctn: &Container) -> ExecutorResult {
        let build_id = self.build.lock().await.id;

        let mut record = ServiceRecord::for_container(build_id, ctn);
        record.status = Status::Running;
        record.started = Some(Utc::now());
        record.host = self.meta.hostname.clone();
        record.runtime = self.runtime.driver().to_string();
        record.distribution = std::env::consts::OS.to_string();

        let handle = Arc::new(Mutex::new(record));
        debug!(service = %ctn.name, "uploading service state");
        self.reporter.upload_service(&handle).await?;
        self.services.insert(ctn.id.clone(), handle);

        let api = self.reporter.api();
        let number = ctn.number;
        let log = crate::reporter::retry(
            "service log fetch",
            buildhand_client::ClientError::is_retriable,
            move || api.get_service_log(build_id, number),
        )
        .await?;
        self.logs.insert(ctn.id.clone(), Arc::new(Mutex::new(log)));

        Ok(())
    }

    /// Starts the service and spawns its log streamer. Never waits.
    pub(crate) async fn exec_service(&self, ctn: &Container) -> ExecutorResult {
        let log = self.logs.get(&ctn.id).map(|h| h.value().clone()).ok_or_else(|| {
            crate::ExecutorError::from(crate::ExecutorErrorKind::Internal {
                reason: format!("no log handle for service '{}'", ctn.name),
            })
        })?;

        debug!(service = %ctn.name, "running container");
        self.runtime.run_container(&self.pipeline, ctn).await?;

        let streamer = tokio::spawn(stream::run(
            self.runtime.clone(),
            self.reporter.clone(),
            log,
            ctn.clone(),
            LogKind::Service,
            self.stream_token.clone(),
        ));
        self.spawn_streamer(streamer);

        Ok(())
    }

    /// Removes the service container and finalizes its record.
    pub(crate) async fn destroy_service(&self, ctn: &Container) -> ExecutorResult {
        debug!(service = %ctn.name, "removing container");
        self.runtime.remove_container(ctn).await?;

        if let Some(handle) = self.services.get(&ctn.id).map(|h| h.value().clone()) {
            {
                let mut record = handle.lock().await;
                if !record.status.is_terminal() {
                    let status = if self.token.is_cancelled() {
                        Status::Killed
                    } else {
                        Status::Success
                    };
                    record.finish(status, 0);
                }
            }
            self.reporter.upload_service(&handle).await?;
        }

        Ok(())
    }
}
