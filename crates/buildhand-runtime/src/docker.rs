//! Docker driver.
//!
//! Drives the Docker Engine API through bollard. Build-scoped resources are
//! a user-defined bridge network and a named volume; every container joins
//! the network under its service name and mounts the volume at the
//! pipeline's workspace destination.
//!
//! One executor instance drives one build at a time, so the driver keeps
//! the current build scope (network and volume names) from `setup_build`
//! until `remove_build`.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogsOptions, NetworkingConfig,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{EndpointSettings, HostConfig};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use buildhand_core::{Container, Pipeline, PullPolicy};

use crate::{
    ContainerInspection, Runtime, RuntimeError, RuntimeErrorKind, RuntimeResult, TailStream,
};

/// Default workspace mount point when the pipeline does not name one.
const WORKSPACE: &str = "/workspace";

/// Docker Engine driver.
pub struct DockerRuntime {
    docker: Docker,
    scope: RwLock<Option<BuildScope>>,
}

#[derive(Debug, Clone)]
struct BuildScope {
    network: String,
    volume: String,
    destination: String,
}

impl DockerRuntime {
    /// Connects to the local Docker daemon and verifies it responds.
    pub async fn connect() -> RuntimeResult<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            RuntimeError::from(RuntimeErrorKind::Unavailable {
                reason: e.to_string(),
            })
        })?;

        docker.ping().await.map_err(|e| {
            RuntimeError::from(RuntimeErrorKind::Unavailable {
                reason: e.to_string(),
            })
        })?;

        Ok(Self {
            docker,
            scope: RwLock::new(None),
        })
    }

    fn current_scope(&self) -> RuntimeResult<BuildScope> {
        self.scope
            .read()
            .expect("scope lock poisoned")
            .clone()
            .ok_or_else(|| {
                RuntimeError::from(RuntimeErrorKind::PreconditionFailed {
                    reason: "no build scope; setup_build has not run".to_string(),
                })
            })
    }

    async fn pull_image(&self, image: &str) -> RuntimeResult {
        debug!(image, "pulling image");
        let options = CreateImageOptions::<String> {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(classify)?;
        }
        Ok(())
    }

    async fn image_present(&self, image: &str) -> RuntimeResult<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) => {
                let classified = classify(e);
                if classified.is_not_found() {
                    Ok(false)
                } else {
                    Err(classified)
                }
            }
        }
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    fn driver(&self) -> &'static str {
        "docker"
    }

    async fn setup_build(&self, pipeline: &Pipeline) -> RuntimeResult {
        let destination = if pipeline.volume.destination.is_empty() {
            WORKSPACE.to_string()
        } else {
            pipeline.volume.destination.clone()
        };

        *self.scope.write().expect("scope lock poisoned") = Some(BuildScope {
            network: pipeline.network(),
            volume: pipeline.volume_name(),
            destination,
        });

        self.create_network(pipeline).await?;
        self.create_volume(pipeline).await
    }

    async fn assemble_build(&self, _pipeline: &Pipeline) -> RuntimeResult {
        // containers join the network at creation time; nothing to finalize
        Ok(())
    }

    async fn remove_build(&self, pipeline: &Pipeline) -> RuntimeResult {
        self.remove_network(pipeline).await?;
        self.remove_volume(pipeline).await?;
        *self.scope.write().expect("scope lock poisoned") = None;
        Ok(())
    }

    async fn create_volume(&self, pipeline: &Pipeline) -> RuntimeResult {
        let name = pipeline.volume_name();
        if self.docker.inspect_volume(&name).await.is_ok() {
            return Ok(());
        }

        let options = CreateVolumeOptions::<String> {
            name,
            ..Default::default()
        };
        self.docker.create_volume(options).await.map_err(classify)?;
        Ok(())
    }

    async fn inspect_volume(&self, pipeline: &Pipeline) -> RuntimeResult<Vec<u8>> {
        let volume = self
            .docker
            .inspect_volume(&pipeline.volume_name())
            .await
            .map_err(classify)?;
        serde_json::to_vec(&volume).map_err(|e| {
            RuntimeError::from(RuntimeErrorKind::Internal {
                reason: e.to_string(),
            })
        })
    }

    async fn remove_volume(&self, pipeline: &Pipeline) -> RuntimeResult {
        let result = self
            .docker
            .remove_volume(&pipeline.volume_name(), Some(RemoveVolumeOptions { force: true }))
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                let classified = classify(e);
                if classified.is_not_found() {
                    Ok(())
                } else {
                    Err(classified)
                }
            }
        }
    }

    async fn create_network(&self, pipeline: &Pipeline) -> RuntimeResult {
        let name = pipeline.network();
        if self
            .docker
            .inspect_network(&name, None::<InspectNetworkOptions<String>>)
            .await
            .is_ok()
        {
            return Ok(());
        }

        let options = CreateNetworkOptions::<String> {
            name,
            driver: "bridge".to_string(),
            ..Default::default()
        };
        self.docker.create_network(options).await.map_err(classify)?;
        Ok(())
    }

    async fn inspect_network(&self, pipeline: &Pipeline) -> RuntimeResult<Vec<u8>> {
        let network = self
            .docker
            .inspect_network(&pipeline.network(), None::<InspectNetworkOptions<String>>)
            .await
            .map_err(classify)?;
        serde_json::to_vec(&network).map_err(|e| {
            RuntimeError::from(RuntimeErrorKind::Internal {
                reason: e.to_string(),
            })
        })
    }

    async fn remove_network(&self, pipeline: &Pipeline) -> RuntimeResult {
        match self.docker.remove_network(&pipeline.network()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let classified = classify(e);
                if classified.is_not_found() {
                    Ok(())
                } else {
                    Err(classified)
                }
            }
        }
    }

    async fn setup_container(&self, ctn: &Container) -> RuntimeResult {
        match ctn.pull {
            PullPolicy::Always => self.pull_image(&ctn.image).await?,
            PullPolicy::NotPresent => {
                if !self.image_present(&ctn.image).await? {
                    self.pull_image(&ctn.image).await?;
                }
            }
            PullPolicy::Never => {
                if !self.image_present(&ctn.image).await? {
                    return Err(RuntimeError::from(RuntimeErrorKind::PreconditionFailed {
                        reason: format!("image '{}' not present and pull policy is never", ctn.image),
                    }));
                }
            }
        }

        let scope = self.current_scope()?;

        let mut endpoints = HashMap::new();
        endpoints.insert(
            scope.network.clone(),
            EndpointSettings {
                aliases: Some(vec![ctn.name.clone()]),
                ..Default::default()
            },
        );

        let config = Config::<String> {
            image: Some(ctn.image.clone()),
            cmd: if ctn.commands.is_empty() {
                None
            } else {
                Some(ctn.commands.clone())
            },
            entrypoint: if ctn.entrypoint.is_empty() {
                None
            } else {
                Some(ctn.entrypoint.clone())
            },
            env: Some(env_list(ctn)),
            working_dir: Some(scope.destination.clone()),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:{}", scope.volume, scope.destination)]),
                privileged: Some(ctn.privileged),
                ..Default::default()
            }),
            networking_config: Some(NetworkingConfig {
                endpoints_config: endpoints,
            }),
            ..Default::default()
        };

        debug!(container = %ctn.id, image = %ctn.image, "creating container");
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: ctn.id.clone(),
                    ..Default::default()
                }),
                config,
            )
            .await
            .map_err(classify)?;

        Ok(())
    }

    async fn run_container(&self, _pipeline: &Pipeline, ctn: &Container) -> RuntimeResult {
        debug!(container = %ctn.id, "starting container");
        self.docker
            .start_container(&ctn.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(classify)
    }

    async fn tail_container(
        &self,
        ctn: &Container,
        token: CancellationToken,
    ) -> RuntimeResult<TailStream> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let stream = self
            .docker
            .logs(&ctn.id, Some(options))
            .map(|entry| {
                entry
                    .map(bollard::container::LogOutput::into_bytes)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            })
            .take_until(token.cancelled_owned())
            .boxed();

        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn wait_container(&self, ctn: &Container) -> RuntimeResult {
        let mut stream = self.docker.wait_container(
            &ctn.id,
            Some(WaitContainerOptions {
                condition: "not-running".to_string(),
            }),
        );

        match stream.next().await {
            // a non-zero exit code surfaces as a wait "error"; the exit
            // code itself is read by inspect_container
            Some(Err(bollard::errors::Error::DockerContainerWaitError { .. })) | Some(Ok(_)) => {
                Ok(())
            }
            Some(Err(e)) => Err(classify(e)),
            None => Err(RuntimeError::from(RuntimeErrorKind::Internal {
                reason: format!("wait stream for '{}' closed without a response", ctn.id),
            })),
        }
    }

    async fn inspect_container(&self, ctn: &Container) -> RuntimeResult<ContainerInspection> {
        let response = self
            .docker
            .inspect_container(&ctn.id, None::<InspectContainerOptions>)
            .await
            .map_err(classify)?;

        let state = response.state.unwrap_or_default();
        Ok(ContainerInspection {
            exit_code: state.exit_code.unwrap_or(0),
            running: state.running.unwrap_or(false),
        })
    }

    async fn remove_container(&self, ctn: &Container) -> RuntimeResult {
        let result = self
            .docker
            .remove_container(
                &ctn.id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                let classified = classify(e);
                if classified.is_not_found() {
                    Ok(())
                } else {
                    Err(classified)
                }
            }
        }
    }
}

/// Flattens a container environment into Docker's `KEY=value` list.
fn env_list(ctn: &Container) -> Vec<String> {
    let mut env: Vec<String> = ctn
        .environment
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    env.sort_unstable();
    env
}

/// Maps bollard failures onto the runtime error taxonomy.
fn classify(e: bollard::errors::Error) -> RuntimeError {
    use bollard::errors::Error;

    let kind = match e {
        Error::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 => RuntimeErrorKind::NotFound { object: message },
            401 | 403 => RuntimeErrorKind::PermissionDenied { reason: message },
            409 => RuntimeErrorKind::PreconditionFailed { reason: message },
            500..=599 => RuntimeErrorKind::Transient { reason: message },
            _ => RuntimeErrorKind::Internal { reason: message },
        },
        Error::IOError { err } => RuntimeErrorKind::Transient {
            reason: err.to_string(),
        },
        Error::RequestTimeoutError => RuntimeErrorKind::Transient {
            reason: "request timed out".to_string(),
        },
        other => RuntimeErrorKind::Internal {
            reason: other.to_string(),
        },
    };

    RuntimeError::from(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_list_is_sorted_key_value() {
        let ctn = Container::new("step", "alpine:3", 1)
            .with_env("B", "2")
            .with_env("A", "1");
        assert_eq!(env_list(&ctn), vec!["A=1".to_string(), "B=2".to_string()]);
    }

    #[test]
    fn test_classify_server_errors() {
        let not_found = classify(bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "no such container".to_string(),
        });
        assert!(not_found.is_not_found());

        let transient = classify(bollard::errors::Error::DockerResponseServerError {
            status_code: 503,
            message: "daemon busy".to_string(),
        });
        assert!(transient.is_transient());

        let denied = classify(bollard::errors::Error::DockerResponseServerError {
            status_code: 403,
            message: "nope".to_string(),
        });
        assert!(matches!(denied.kind(), RuntimeErrorKind::PermissionDenied { .. }));
    }

    #[test]
    fn test_classify_timeout_is_transient() {
        assert!(classify(bollard::errors::Error::RequestTimeoutError).is_transient());
    }
}
