//! Core data models for the reaper engine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Number of id characters shown in log lines
pub const SHORT_ID_LEN: usize = 10;

/// Identity of a running container as returned by enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRef {
    pub id: String,
    pub name: String,
}

impl ContainerRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Id prefix used to identify the container in logs
    pub fn short_id(&self) -> &str {
        match self.id.char_indices().nth(SHORT_ID_LEN) {
            Some((idx, _)) => &self.id[..idx],
            None => &self.id,
        }
    }
}

/// Health status as classified by the runtime's own health check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Starting,
    Healthy,
    Unhealthy,
    /// No health check configured
    None,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Starting => "starting",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::None => "none",
        };
        f.write_str(s)
    }
}

/// Health state fetched fresh for one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHealth {
    pub status: HealthStatus,
    /// Consecutive failed checks, maintained by the runtime
    pub failing_streak: u32,
}

impl ContainerHealth {
    pub fn new(status: HealthStatus, failing_streak: u32) -> Self {
        Self {
            status,
            failing_streak,
        }
    }
}

/// Result of evaluating one container in one cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Healthy,
    BelowThreshold {
        failing_streak: u32,
    },
    DryRunSkipped {
        failing_streak: u32,
    },
    Stopped {
        attempts: u32,
        elapsed: Duration,
    },
    StopFailed {
        attempts: u32,
        last_error: String,
    },
    InspectError(String),
    NoHealthData,
    TimedOut(Duration),
}

impl Outcome {
    /// Stable label used for metrics and log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Healthy => "healthy",
            Outcome::BelowThreshold { .. } => "below_threshold",
            Outcome::DryRunSkipped { .. } => "dry_run_skipped",
            Outcome::Stopped { .. } => "stopped",
            Outcome::StopFailed { .. } => "stop_failed",
            Outcome::InspectError(_) => "inspect_error",
            Outcome::NoHealthData => "no_health_data",
            Outcome::TimedOut(_) => "timed_out",
        }
    }

    /// Returns true for outcomes that represent a local failure
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Outcome::StopFailed { .. } | Outcome::InspectError(_) | Outcome::TimedOut(_)
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
