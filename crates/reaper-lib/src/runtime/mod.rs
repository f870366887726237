//! Container runtime access
//!
//! The engine talks to the runtime only through [`ContainerRuntime`], which
//! must be safe to share between concurrently running evaluations. The
//! Docker Engine API implementation lives in [`docker`].

mod docker;

pub use docker::{container_ref_from_summary, health_from_inspect, DockerRuntime};

use crate::error::RuntimeError;
use crate::models::{ContainerHealth, ContainerRef};
use std::time::Duration;

pub use async_trait::async_trait;

/// Operations the engine needs from a container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List the containers currently in the running state
    async fn list_running(&self) -> Result<Vec<ContainerRef>, RuntimeError>;

    /// Fetch the health state of a container.
    ///
    /// Returns `Ok(None)` when the runtime reports no state or no health
    /// section for the container, e.g. when no health check is configured.
    async fn inspect(&self, container_id: &str) -> Result<Option<ContainerHealth>, RuntimeError>;

    /// Stop a container, letting the runtime kill it after `grace_period`
    async fn stop(&self, container_id: &str, grace_period: Duration) -> Result<(), RuntimeError>;

    /// Connectivity check issued once at startup
    async fn ping(&self) -> Result<(), RuntimeError>;
}
