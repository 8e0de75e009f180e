//! Docker driver for container-backed servers.

use super::{CloudError, CloudStatus, Provider};
use async_trait::async_trait;
use bollard::container::{StartContainerOptions, StopContainerOptions};
use bollard::models::ContainerStateStatusEnum;
use bollard::Docker;

/// A container agent signals termination by creating this file in its
/// working directory. There is no preemption signal for local containers.
const SHUTDOWN_SENTINEL: &str = "shutdown.txt";

/// Docker daemon client.
pub struct DockerClient {
    client: Docker,
}

/// Map a container state onto the normalized lifecycle enum.
fn map_container_status(status: ContainerStateStatusEnum) -> CloudStatus {
    match status {
        ContainerStateStatusEnum::RUNNING => CloudStatus::Running,
        ContainerStateStatusEnum::CREATED => CloudStatus::Starting,
        ContainerStateStatusEnum::REMOVING => CloudStatus::Stopping,
        ContainerStateStatusEnum::EXITED | ContainerStateStatusEnum::DEAD => CloudStatus::Stopped,
        _ => CloudStatus::Unknown,
    }
}

impl DockerClient {
    /// Connect to the Docker daemon.
    ///
    /// `DOCKER_HOST` is honored when set (`unix://` or `tcp://`); otherwise
    /// the platform's default socket is used. The connection is verified
    /// with a ping so misconfiguration fails at startup, not at first login.
    pub async fn new() -> anyhow::Result<Self> {
        let client = match std::env::var("DOCKER_HOST") {
            Ok(host) if host.starts_with("unix://") => {
                let socket = host.trim_start_matches("unix://");
                Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION)?
            }
            Ok(host) if host.starts_with("tcp://") || host.starts_with("http://") => {
                Docker::connect_with_http(&host, 120, bollard::API_DEFAULT_VERSION)?
            }
            Ok(host) => {
                anyhow::bail!(
                    "unsupported DOCKER_HOST '{}': expected unix:// or tcp://",
                    host
                );
            }
            Err(_) => Docker::connect_with_socket_defaults()?,
        };

        client
            .ping()
            .await
            .map_err(|e| anyhow::anyhow!("docker daemon is not responding: {}", e))?;

        Ok(Self { client })
    }

    async fn container_state(
        &self,
        container_id: &str,
    ) -> Result<ContainerStateStatusEnum, CloudError> {
        let container = self
            .client
            .inspect_container(container_id, None)
            .await
            .map_err(anyhow::Error::from)?;

        Ok(container
            .state
            .and_then(|s| s.status)
            .unwrap_or(ContainerStateStatusEnum::EMPTY))
    }
}

#[async_trait]
impl Provider for DockerClient {
    async fn status(&self, container_id: &str) -> Result<CloudStatus, CloudError> {
        let state = self.container_state(container_id).await?;
        Ok(map_container_status(state))
    }

    async fn start(&self, container_id: &str) -> Result<(), CloudError> {
        let state = self.container_state(container_id).await?;
        if state != ContainerStateStatusEnum::EXITED {
            return Err(CloudError::NotStopped);
        }

        self.client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(anyhow::Error::from)?;
        Ok(())
    }

    async fn stop(&self, container_id: &str) -> Result<(), CloudError> {
        let state = self.container_state(container_id).await?;
        if state == ContainerStateStatusEnum::EXITED {
            return Err(CloudError::NotRunning);
        }

        self.client
            .stop_container(container_id, None::<StopContainerOptions>)
            .await
            .map_err(anyhow::Error::from)?;
        Ok(())
    }

    async fn should_terminate(&self) -> Result<bool, CloudError> {
        match tokio::fs::try_exists(SHUTDOWN_SENTINEL).await {
            Ok(exists) => Ok(exists),
            Err(e) => Err(CloudError::Provider(e.into())),
        }
    }
}
