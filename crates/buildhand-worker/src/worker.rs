//! The operate loop.
//!
//! Claims one item at a time, builds a fresh [`Engine`] for it and drives
//! the lifecycle under the configured build timeout. Teardown always runs:
//! on success, on error, on timeout and on shutdown.

use std::sync::Arc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use buildhand_client::ControlPlane;
use buildhand_executor::{Engine, EngineMeta, ExecutorError, ExecutorErrorKind};
use buildhand_runtime::Runtime;

use crate::queue::{Queue, QueueItem};
use crate::{Config, WorkerError, WorkerErrorKind, WorkerResult};

/// A build worker bound to one queue, one runtime and one control plane.
pub struct Worker {
    config: Config,
    queue: Arc<dyn Queue>,
    runtime: Arc<dyn Runtime>,
    api: Arc<dyn ControlPlane>,
    shutdown: CancellationToken,
}

impl Worker {
    /// Creates a worker.
    #[must_use]
    pub fn new(
        config: Config,
        queue: Arc<dyn Queue>,
        runtime: Arc<dyn Runtime>,
        api: Arc<dyn ControlPlane>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            queue,
            runtime,
            api,
            shutdown,
        }
    }

    /// Polls the queue and executes claimed builds until shutdown.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            routes = ?self.config.routes,
            interval = ?self.config.poll_interval,
            "worker started, polling for builds"
        );

        loop {
            if self.shutdown.is_cancelled() {
                info!("worker shutting down");
                return Ok(());
            }

            match self.queue.pop(&self.config.routes).await {
                Ok(Some(item)) => {
                    let build_id = item.build.id;
                    if let Err(e) = self.execute(item).await {
                        error!(%build_id, %e, "build execution failed");
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                        () = self.shutdown.cancelled() => {}
                    }
                }
                Err(e) => {
                    warn!(%e, "queue poll failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    /// Executes one claimed build through the full engine lifecycle.
    ///
    /// The destroy phase runs regardless of how execution ended; its
    /// errors are telemetry, not failures.
    pub async fn execute(&self, item: QueueItem) -> WorkerResult<()> {
        let build_id = item.build.id;
        info!(%build_id, repo = %item.repo.full_name, "claimed build");

        let meta = EngineMeta {
            hostname: self.config.hostname.clone(),
            branch: item.repo.branch.clone(),
            event: item.event.clone(),
            repo: item.repo.full_name.clone(),
        };

        let build_token = self.shutdown.child_token();
        let engine = Engine::new(
            item.pipeline,
            item.build,
            Arc::clone(&self.runtime),
            Arc::clone(&self.api),
            meta,
            build_token.clone(),
        )
        .with_stage_concurrency(self.config.executor_threads);

        let lifecycle = async {
            engine.create_build().await?;
            engine.plan_build().await?;
            engine.assemble_build().await?;
            engine.exec_build().await
        };

        let result = match timeout(self.config.build_timeout, lifecycle).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%build_id, "build timed out, cancelling");
                build_token.cancel();
                Err(ExecutorError::from(ExecutorErrorKind::Cancelled))
            }
        };

        if let Err(e) = &result {
            engine.fail(e);
        }

        if let Err(e) = engine.destroy_build().await {
            warn!(%build_id, %e, "build teardown reported errors");
        }

        match result {
            Ok(()) => {
                info!(%build_id, "build finished");
                Ok(())
            }
            Err(e) => Err(WorkerError::from(WorkerErrorKind::ExecutionFailed {
                reason: e.to_string(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{InMemoryQueue, Repo};
    use buildhand_client::FakeControlPlane;
    use buildhand_core::{BuildRecord, Container, Pipeline, Stage, Status};
    use buildhand_runtime::MockRuntime;
    use uuid::Uuid;

    fn config() -> Config {
        Config {
            server_address: "http://localhost:8080".to_string(),
            shared_secret: "s3cr3t".to_string(),
            hostname: "worker-1".to_string(),
            routes: vec!["linux".to_string()],
            runtime_driver: "mock".to_string(),
            ..Config::default()
        }
    }

    fn simple_item() -> QueueItem {
        QueueItem {
            build: BuildRecord::new(Uuid::new_v4(), 7, "worker-1"),
            repo: Repo {
                full_name: "octo/spoon".to_string(),
                branch: "main".to_string(),
            },
            pipeline: Pipeline::new("p_worker")
                .with_stage(Stage::new("build").with_step(Container::new("step", "alpine:3", 1))),
            user: Some("octocat".to_string()),
            event: "push".to_string(),
            routes: vec!["linux".to_string()],
        }
    }

    #[tokio::test]
    async fn test_execute_runs_build_to_success() {
        let runtime = MockRuntime::new();
        let api = FakeControlPlane::new();
        let worker = Worker::new(
            config(),
            Arc::new(InMemoryQueue::new()),
            Arc::new(runtime.clone()),
            Arc::new(api.clone()),
            CancellationToken::new(),
        );

        worker.execute(simple_item()).await.unwrap();

        assert_eq!(api.last_build_status(), Some(Status::Success));
        assert_eq!(runtime.set_up_containers(), runtime.removed_containers());
    }

    #[tokio::test]
    async fn test_worker_drains_queue_then_shuts_down() {
        let runtime = MockRuntime::new();
        let api = FakeControlPlane::new();
        let queue = Arc::new(InMemoryQueue::new());
        queue.push(simple_item()).await.unwrap();

        let shutdown = CancellationToken::new();
        let worker = Arc::new(Worker::new(
            config(),
            Arc::clone(&queue) as Arc<dyn Queue>,
            Arc::new(runtime),
            Arc::new(api.clone()),
            shutdown.clone(),
        ));

        let handle = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.run().await })
        };

        // give the loop a moment to claim and finish the item
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert!(queue.is_empty());
        assert_eq!(api.last_build_status(), Some(Status::Success));
    }

    #[tokio::test]
    async fn test_build_timeout_kills_build() {
        let runtime = MockRuntime::new();
        runtime.plan(
            "step",
            buildhand_runtime::ContainerPlan::default()
                .with_run_duration(std::time::Duration::from_secs(60)),
        );
        let api = FakeControlPlane::new();

        let worker = Worker::new(
            Config {
                build_timeout: std::time::Duration::from_millis(200),
                ..config()
            },
            Arc::new(InMemoryQueue::new()),
            Arc::new(runtime.clone()),
            Arc::new(api.clone()),
            CancellationToken::new(),
        );

        let err = worker.execute(simple_item()).await.unwrap_err();
        assert!(matches!(err.kind(), WorkerErrorKind::ExecutionFailed { .. }));

        assert_eq!(api.last_build_status(), Some(Status::Killed));
        assert_eq!(runtime.set_up_containers(), runtime.removed_containers());
    }
}
