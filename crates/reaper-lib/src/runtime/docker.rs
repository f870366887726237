//! Docker Engine API runtime built on bollard

use super::ContainerRuntime;
use crate::error::RuntimeError;
use crate::models::{ContainerHealth, ContainerRef, HealthStatus};
use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions, StopContainerOptions};
use bollard::models::{ContainerInspectResponse, ContainerSummary, HealthStatusEnum};
use bollard::{Docker, API_DEFAULT_VERSION};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Runtime backed by a Docker (or Docker-compatible) daemon
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the daemon at `endpoint`.
    ///
    /// `None` uses the local defaults (including `DOCKER_HOST`), `unix://`
    /// URLs and absolute paths use the unix socket, `tcp://` and `http://`
    /// URLs use plain HTTP. `request_timeout` is the client-side bound on
    /// every request and is independent of the engine's own deadlines.
    pub fn connect(endpoint: Option<&str>, request_timeout: Duration) -> Result<Self, RuntimeError> {
        let timeout_secs = request_timeout.as_secs().max(1);

        let docker = match endpoint {
            None => Docker::connect_with_local_defaults()?.with_timeout(request_timeout),
            Some(addr) if addr.starts_with("tcp://") || addr.starts_with("http://") => {
                Docker::connect_with_http(addr, timeout_secs, API_DEFAULT_VERSION)?
            }
            Some(addr) if addr.starts_with("unix://") || addr.starts_with('/') => {
                let path = addr.trim_start_matches("unix://");
                Docker::connect_with_socket(path, timeout_secs, API_DEFAULT_VERSION)?
            }
            Some(other) => {
                return Err(RuntimeError::Other(format!(
                    "unsupported docker endpoint '{}'",
                    other
                )))
            }
        };

        info!(endpoint = endpoint.unwrap_or("local defaults"), "Docker client configured");
        Ok(Self { docker })
    }

    /// Wrap an existing client
    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_running(&self) -> Result<Vec<ContainerRef>, RuntimeError> {
        let options = ListContainersOptions {
            filters: HashMap::from([("status", vec!["running"])]),
            ..Default::default()
        };

        let summaries = self.docker.list_containers(Some(options)).await?;
        let containers: Vec<ContainerRef> = summaries
            .iter()
            .filter_map(container_ref_from_summary)
            .collect();

        debug!(
            listed = summaries.len(),
            usable = containers.len(),
            "Listed running containers"
        );
        Ok(containers)
    }

    async fn inspect(&self, container_id: &str) -> Result<Option<ContainerHealth>, RuntimeError> {
        let response = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await?;
        Ok(health_from_inspect(&response))
    }

    async fn stop(&self, container_id: &str, grace_period: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: i64::try_from(grace_period.as_secs()).unwrap_or(i64::MAX),
        };
        self.docker.stop_container(container_id, Some(options)).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await?;
        Ok(())
    }
}

/// Convert a list entry into a container reference.
///
/// Entries without an id are dropped. The name is the first reported name
/// without its leading `/`.
pub fn container_ref_from_summary(summary: &ContainerSummary) -> Option<ContainerRef> {
    let id = summary.id.as_deref().filter(|id| !id.is_empty())?;
    let name = summary
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|name| name.trim_start_matches('/').to_string())
        .unwrap_or_default();

    Some(ContainerRef::new(id, name))
}

/// Extract the health section from an inspect response.
///
/// Returns `None` when state or health data is absent, or when the runtime
/// reports that no health check is configured.
pub fn health_from_inspect(response: &ContainerInspectResponse) -> Option<ContainerHealth> {
    let health = response.state.as_ref()?.health.as_ref()?;

    let status = match health.status.as_ref()? {
        HealthStatusEnum::STARTING => HealthStatus::Starting,
        HealthStatusEnum::HEALTHY => HealthStatus::Healthy,
        HealthStatusEnum::UNHEALTHY => HealthStatus::Unhealthy,
        HealthStatusEnum::NONE | HealthStatusEnum::EMPTY => return None,
    };

    // Negative streaks are clamped to zero
    let failing_streak = health
        .failing_streak
        .map(|streak| u32::try_from(streak.max(0)).unwrap_or(u32::MAX))
        .unwrap_or(0);

    Some(ContainerHealth::new(status, failing_streak))
}
