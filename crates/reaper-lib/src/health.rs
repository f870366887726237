//! Liveness and readiness state of the reaper process
//!
//! Not to be confused with the container health the engine evaluates: this
//! tracks whether the reaper itself can reach its runtime and keep cycling.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Still cycling, but the last enumeration failed
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        !matches!(self, ComponentStatus::Unhealthy)
    }
}

/// Status of the runtime connection or the observation loop
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Unix timestamp of the last status change
    pub since: i64,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            since: chrono::Utc::now().timestamp(),
        }
    }
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: ComponentStatus,
    pub runtime: ComponentHealth,
    pub scheduler: ComponentHealth,
    /// Unix timestamp of the last successful enumeration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cycle_at: Option<i64>,
    pub containers_observed: usize,
    pub consecutive_list_failures: u32,
}

/// Body of `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug)]
struct State {
    runtime: ComponentHealth,
    scheduler: ComponentHealth,
    last_cycle_at: Option<i64>,
    containers_observed: usize,
    consecutive_list_failures: u32,
    ready: bool,
}

/// Shared handle updated by the scheduler and read by the HTTP API
#[derive(Debug, Clone)]
pub struct ReaperHealth {
    state: Arc<RwLock<State>>,
}

impl Default for ReaperHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl ReaperHealth {
    pub fn new() -> Self {
        let state = State {
            runtime: ComponentHealth::new(ComponentStatus::Healthy, None),
            scheduler: ComponentHealth::new(ComponentStatus::Healthy, None),
            last_cycle_at: None,
            containers_observed: 0,
            consecutive_list_failures: 0,
            ready: false,
        };
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    /// Record a successful enumeration of `containers_observed` containers
    pub async fn record_cycle(&self, containers_observed: usize) {
        let mut state = self.state.write().await;
        if state.runtime.status != ComponentStatus::Healthy {
            state.runtime = ComponentHealth::new(ComponentStatus::Healthy, None);
        }
        state.last_cycle_at = Some(chrono::Utc::now().timestamp());
        state.containers_observed = containers_observed;
        state.consecutive_list_failures = 0;
    }

    /// Record a failed enumeration; the runtime is degraded until the next success
    pub async fn record_list_failure(&self, message: impl Into<String>, consecutive: u32) {
        let mut state = self.state.write().await;
        state.runtime = ComponentHealth::new(ComponentStatus::Degraded, Some(message.into()));
        state.consecutive_list_failures = consecutive;
    }

    /// Record that the observation loop ended on an error
    pub async fn record_loop_failure(&self, message: impl Into<String>) {
        let mut state = self.state.write().await;
        state.scheduler = ComponentHealth::new(ComponentStatus::Unhealthy, Some(message.into()));
    }

    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.ready = ready;
    }

    pub async fn report(&self) -> HealthReport {
        let state = self.state.read().await;
        let status = if !state.scheduler.status.is_operational()
            || !state.runtime.status.is_operational()
        {
            ComponentStatus::Unhealthy
        } else if state.runtime.status == ComponentStatus::Degraded {
            ComponentStatus::Degraded
        } else {
            ComponentStatus::Healthy
        };

        HealthReport {
            status,
            runtime: state.runtime.clone(),
            scheduler: state.scheduler.clone(),
            last_cycle_at: state.last_cycle_at,
            containers_observed: state.containers_observed,
            consecutive_list_failures: state.consecutive_list_failures,
        }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let (ready, scheduler) = {
            let state = self.state.read().await;
            (state.ready, state.scheduler.status)
        };

        let reason = if !ready {
            Some("Runtime connection not yet verified")
        } else if !scheduler.is_operational() {
            Some("Observation loop stopped")
        } else {
            None
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason: reason.map(str::to_string),
        }
    }
}
