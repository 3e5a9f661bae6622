//! The per-step create/plan/exec/destroy quartet.
//!
//! The synthetic `init` step is a marker: create, exec and destroy skip it
//! and no record is kept for it.

use chrono::Utc;
use tracing::debug;

use buildhand_core::{substitute, Container, Status, StepRecord};

use crate::stream::{self, LogKind};
use crate::{Engine, ExecutorError, ExecutorErrorKind, ExecutorResult};

/// Environment variable carrying the worker host name.
pub const ENV_BUILD_HOST: &str = "BUILD_HOST";
/// Environment variable carrying the worker host name (platform form).
pub const ENV_HOST: &str = "VELA_HOST";
/// Environment variable carrying the worker version.
pub const ENV_VERSION: &str = "VELA_VERSION";
/// Environment variable carrying the runtime driver identifier.
pub const ENV_RUNTIME: &str = "VELA_RUNTIME";
/// Environment variable carrying the host distribution.
pub const ENV_DISTRIBUTION: &str = "VELA_DISTRIBUTION";

impl Engine {
    /// Injects the well-known environment every container receives.
    ///
    /// The runtime identifier comes from the driver and the distribution
    /// from the host rather than being hardcoded.
    pub(crate) fn inject_metadata_env(&self, ctn: &mut Container) {
        let env = &mut ctn.environment;
        env.insert(ENV_BUILD_HOST.to_string(), self.meta.hostname.clone());
        env.insert(ENV_HOST.to_string(), self.meta.hostname.clone());
        env.insert(ENV_VERSION.to_string(), buildhand_core::VERSION.to_string());
        env.insert(ENV_RUNTIME.to_string(), self.runtime.driver().to_string());
        env.insert(
            ENV_DISTRIBUTION.to_string(),
            std::env::consts::OS.to_string(),
        );
    }

    /// Prepares a step: well-known env, runtime setup, secrets, then
    /// environment substitution over the serialized configuration.
    pub(crate) async fn create_step(&self, ctn: &mut Container) -> ExecutorResult {
        self.inject_metadata_env(ctn);

        if ctn.is_init() {
            return Ok(());
        }

        debug!(step = %ctn.name, "setting up container");
        {
            let target: &Container = ctn;
            crate::reporter::retry(
                "container setup",
                |e: &ExecutorError| {
                    matches!(e.kind(), ExecutorErrorKind::Runtime { source } if source.is_transient())
                },
                move || {
                    let runtime = self.runtime.clone();
                    async move { runtime.setup_container(target).await.map_err(ExecutorError::from) }
                },
            )
            .await?;
        }

        debug!(step = %ctn.name, "injecting secrets");
        crate::secret::inject(ctn, &self.secrets)?;

        self.substitute_container(ctn)
    }

    /// Substitutes environment references across the fully-serialized
    /// container so later-added variables may reference earlier ones.
    /// Values containing newlines are quoted before reinjection.
    pub(crate) fn substitute_container(&self, ctn: &mut Container) -> ExecutorResult {
        debug!(step = %ctn.name, "substituting environment");

        let body = serde_json::to_string(ctn).map_err(|e| {
            ExecutorError::from(ExecutorErrorKind::Internal {
                reason: format!("unable to marshal configuration: {e}"),
            })
        })?;

        let env = ctn.environment.clone();
        let resolved = substitute(&body, |name| {
            let value = env.get(name).cloned().unwrap_or_default();
            if value.contains('\n') {
                json_quote(&value)
            } else {
                value
            }
        })?;

        *ctn = serde_json::from_str(&resolved).map_err(|e| {
            ExecutorError::from(ExecutorErrorKind::InvalidConfiguration {
                reason: format!("unable to unmarshal substituted configuration: {e}"),
            })
        })?;

        Ok(())
    }

    /// Transitions the planned step record to running and uploads it.
    pub(crate) async fn plan_step(&self, ctn: &Container) -> ExecutorResult {
        let handle = self.steps.get(&ctn.id).map(|h| h.value().clone()).ok_or_else(|| {
            ExecutorError::from(ExecutorErrorKind::Internal {
                reason: format!("no planned record for step '{}'", ctn.name),
            })
        })?;

        {
            let mut record = handle.lock().await;
            record.status = Status::Running;
            record.started = Some(Utc::now());
            record.host = env_or(ctn, ENV_BUILD_HOST, &self.meta.hostname);
            record.runtime = env_or(ctn, ENV_RUNTIME, self.runtime.driver());
            record.distribution = env_or(ctn, ENV_DISTRIBUTION, std::env::consts::OS);
        }

        debug!(step = %ctn.name, "uploading step state");
        self.reporter.upload_step(&handle).await
    }

    /// Runs the step container and spawns its log streamer.
    ///
    /// Returns the exit code, or `None` for detached steps which are not
    /// waited on. A non-zero exit code is an outcome, not an error.
    pub(crate) async fn exec_step(&self, ctn: &Container) -> ExecutorResult<Option<i64>> {
        if ctn.is_init() {
            return Ok(None);
        }

        let log = self.logs.get(&ctn.id).map(|h| h.value().clone()).ok_or_else(|| {
            ExecutorError::from(ExecutorErrorKind::Internal {
                reason: format!("no log handle for step '{}'", ctn.name),
            })
        })?;

        debug!(step = %ctn.name, "running container");
        self.runtime.run_container(&self.pipeline, ctn).await?;

        let streamer = tokio::spawn(stream::run(
            self.runtime.clone(),
            self.reporter.clone(),
            log,
            ctn.clone(),
            LogKind::Step,
            self.stream_token.clone(),
        ));
        self.spawn_streamer(streamer);

        // do not wait for detached containers
        if ctn.detach {
            return Ok(None);
        }

        debug!(step = %ctn.name, "waiting for container");
        tokio::select! {
            result = self.runtime.wait_container(ctn) => result?,
            () = self.token.cancelled() => {
                return Err(ExecutorError::from(ExecutorErrorKind::Cancelled));
            }
        }

        debug!(step = %ctn.name, "inspecting container");
        let state = self.runtime.inspect_container(ctn).await?;
        Ok(Some(state.exit_code))
    }

    /// Records a terminal step outcome and uploads it.
    pub(crate) async fn finish_step(&self, ctn: &Container, status: Status, exit_code: i64) -> ExecutorResult {
        let Some(handle) = self.steps.get(&ctn.id).map(|h| h.value().clone()) else {
            return Ok(());
        };

        {
            let mut record = handle.lock().await;
            if !record.status.can_transition(status) {
                return Err(ExecutorError::from(ExecutorErrorKind::Internal {
                    reason: format!(
                        "illegal step transition {} -> {status} for '{}'",
                        record.status, ctn.name
                    ),
                }));
            }
            record.finish(status, exit_code);
        }

        self.reporter.upload_step(&handle).await
    }

    /// Marks a never-run step skipped and uploads it.
    pub(crate) async fn skip_step(&self, ctn: &Container) -> ExecutorResult {
        let Some(handle) = self.steps.get(&ctn.id).map(|h| h.value().clone()) else {
            return Ok(());
        };

        {
            let mut record = handle.lock().await;
            if record.status != Status::Pending {
                return Ok(());
            }
            record.status = Status::Skipped;
            record.finished = Some(Utc::now());
        }

        self.reporter.upload_step(&handle).await
    }

    /// Removes the step container. Idempotent; missing containers are
    /// success.
    pub(crate) async fn destroy_step(&self, ctn: &Container) -> ExecutorResult {
        if ctn.is_init() {
            return Ok(());
        }

        debug!(step = %ctn.name, "removing container");
        self.runtime.remove_container(ctn).await?;
        Ok(())
    }
}

/// Wraps a newline-bearing value in quotes, escaped so the result can be
/// spliced into the serialized configuration and still parse.
fn json_quote(value: &str) -> String {
    let wrapped = format!("\"{value}\"");
    match serde_json::to_string(&wrapped) {
        Ok(escaped) => escaped[1..escaped.len() - 1].to_string(),
        Err(_) => wrapped,
    }
}

fn env_or(ctn: &Container, key: &str, fallback: &str) -> String {
    ctn.environment
        .get(key)
        .cloned()
        .unwrap_or_else(|| fallback.to_string())
}

/// Builds the pending record stored for a step at plan time.
pub(crate) fn planned_record(build_id: uuid::Uuid, ctn: &Container) -> StepRecord {
    StepRecord::for_container(build_id, ctn)
}
