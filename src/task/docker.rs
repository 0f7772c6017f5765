use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::secret::{HostConfig, PortMap, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use futures_util::stream::StreamExt;
use thiserror::Error;
use tracing::{debug, info};

use super::types::Config;

#[derive(Debug, Error)]
pub enum DockerError {
    #[error("docker client error: {0}")]
    Client(String),
    #[error("error pulling image {image}: {message}")]
    ImagePull { image: String, message: String },
    #[error("error creating container: {0}")]
    Create(String),
    #[error("error starting container: {0}")]
    Start(String),
    #[error("error stopping container: {0}")]
    Stop(String),
    #[error("error removing container: {0}")]
    Remove(String),
    #[error("error inspecting container: {0}")]
    Inspect(String),
}

/// What the worker needs to know about a container it asked about.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    /// Runtime status string, e.g. "running" or "exited".
    pub status: String,
    /// Container port -> host bindings.
    pub ports: PortMap,
}

/// The capability set the worker consumes from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull the image, create the container, start it. Returns the container id.
    async fn run(&self, config: &Config) -> Result<String, DockerError>;
    async fn stop(&self, container_id: &str) -> Result<(), DockerError>;
    async fn remove(&self, container_id: &str) -> Result<(), DockerError>;
    /// `Ok(None)` means the runtime no longer knows the container.
    async fn inspect(&self, container_id: &str) -> Result<Option<ContainerSummary>, DockerError>;
}

/// Production runtime driver backed by the Docker daemon.
#[derive(Debug, Clone)]
pub struct DockerApi {
    client: Docker,
}

impl DockerApi {
    pub fn new() -> Result<Self, DockerError> {
        let client =
            Docker::connect_with_local_defaults().map_err(|e| DockerError::Client(e.to_string()))?;
        Ok(DockerApi { client })
    }
}

fn restart_policy_name(policy: &str) -> RestartPolicyNameEnum {
    match policy {
        "always" => RestartPolicyNameEnum::ALWAYS,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        _ => RestartPolicyNameEnum::EMPTY,
    }
}

#[async_trait]
impl ContainerRuntime for DockerApi {
    async fn run(&self, config: &Config) -> Result<String, DockerError> {
        debug!(image = %config.image, "pulling image");
        let mut pull = self.client.create_image(
            Some(CreateImageOptions {
                from_image: config.image.clone(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            match progress {
                Ok(update) => {
                    if let Some(status) = update.status {
                        debug!(image = %config.image, %status, "pull progress");
                    }
                }
                Err(e) => {
                    return Err(DockerError::ImagePull {
                        image: config.image.clone(),
                        message: e.to_string(),
                    })
                }
            }
        }

        let restart_policy = RestartPolicy {
            name: Some(restart_policy_name(&config.restart_policy)),
            maximum_retry_count: None,
        };
        let host_config = HostConfig {
            restart_policy: Some(restart_policy),
            memory: Some(config.memory),
            nano_cpus: Some((config.cpu * 1_000_000_000.0) as i64),
            publish_all_ports: Some(true),
            ..Default::default()
        };
        let container_config = ContainerConfig {
            image: Some(config.image.clone()),
            tty: Some(false),
            env: Some(config.env.clone()),
            exposed_ports: Some(
                config
                    .exposed_ports
                    .iter()
                    .map(|port| (port.clone(), HashMap::new()))
                    .collect(),
            ),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name: config.name.clone(),
                    ..Default::default()
                }),
                container_config,
            )
            .await
            .map_err(|e| DockerError::Create(e.to_string()))?;

        self.client
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| DockerError::Start(e.to_string()))?;

        info!(container_id = %created.id, name = %config.name, "container started");
        Ok(created.id)
    }

    async fn stop(&self, container_id: &str) -> Result<(), DockerError> {
        debug!(%container_id, "stopping container");
        self.client
            .stop_container(container_id, None::<StopContainerOptions>)
            .await
            .map_err(|e| DockerError::Stop(e.to_string()))
    }

    async fn remove(&self, container_id: &str) -> Result<(), DockerError> {
        self.client
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| DockerError::Remove(e.to_string()))
    }

    async fn inspect(&self, container_id: &str) -> Result<Option<ContainerSummary>, DockerError> {
        match self
            .client
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => {
                let status = details
                    .state
                    .and_then(|s| s.status)
                    .map(|s| s.to_string())
                    .unwrap_or_default();
                let ports = details
                    .network_settings
                    .and_then(|n| n.ports)
                    .unwrap_or_default();
                Ok(Some(ContainerSummary { status, ports }))
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(DockerError::Inspect(e.to_string())),
        }
    }
}
