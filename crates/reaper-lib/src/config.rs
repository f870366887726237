//! Reaping policy configuration
//!
//! A `PolicyConfig` is built once at startup, validated, and then shared
//! read-only with every component of the engine.

use crate::error::ReaperError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Semaphore;

/// What the scheduler does when listing running containers fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListFailurePolicy {
    /// Terminate the scheduler loop with an enumeration error
    #[default]
    Exit,
    /// Log, skip the cycle and back off before the next attempt
    Skip,
}

/// How an evaluation that overruns its deadline is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelPolicy {
    /// Stop waiting but let the evaluation run to completion in the background
    #[default]
    Detach,
    /// Drop the in-flight evaluation, aborting its pending runtime request
    Abort,
}

impl ListFailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListFailurePolicy::Skip => "skip",
            ListFailurePolicy::Exit => "exit",
        }
    }
}

impl fmt::Display for ListFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListFailurePolicy {
    type Err = ReaperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skip" => Ok(ListFailurePolicy::Skip),
            "exit" => Ok(ListFailurePolicy::Exit),
            other => Err(ReaperError::Config(format!(
                "unknown list failure policy '{}'",
                other
            ))),
        }
    }
}

impl CancelPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelPolicy::Abort => "abort",
            CancelPolicy::Detach => "detach",
        }
    }
}

impl fmt::Display for CancelPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CancelPolicy {
    type Err = ReaperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "abort" => Ok(CancelPolicy::Abort),
            "detach" => Ok(CancelPolicy::Detach),
            other => Err(ReaperError::Config(format!(
                "unknown cancel policy '{}'",
                other
            ))),
        }
    }
}

/// Tunables consumed by every component of the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Duration between observation cycles (default: 30 seconds)
    #[serde(with = "humantime_serde")]
    pub observe_interval: Duration,
    /// Deadline for enumeration and for each container evaluation (default: 25 seconds)
    #[serde(with = "humantime_serde")]
    pub check_timeout: Duration,
    /// Minimum failing streak before a container is reaped (default: 5)
    pub failing_streak_threshold: u32,
    /// Attempts made to stop a container (default: 3)
    pub max_stop_retries: u32,
    /// Log reaping decisions without stopping anything
    pub dry_run: bool,
    /// Grace period handed to the runtime before it kills the container (default: 5 seconds)
    #[serde(with = "humantime_serde")]
    pub stop_grace_period: Duration,
    /// Upper bound on evaluations running at once, across all cycles.
    /// `None` leaves fan-out unbounded.
    #[serde(default)]
    pub max_concurrent_checks: Option<usize>,
    pub list_failure_policy: ListFailurePolicy,
    /// Cap for the backoff applied after consecutive enumeration failures (default: 5 minutes)
    #[serde(with = "humantime_serde")]
    pub max_list_backoff: Duration,
    pub cancel_policy: CancelPolicy,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            observe_interval: Duration::from_secs(30),
            check_timeout: Duration::from_secs(25),
            failing_streak_threshold: 5,
            max_stop_retries: 3,
            dry_run: false,
            stop_grace_period: Duration::from_secs(5),
            max_concurrent_checks: None,
            list_failure_policy: ListFailurePolicy::Exit,
            max_list_backoff: Duration::from_secs(300),
            cancel_policy: CancelPolicy::Detach,
        }
    }
}

impl PolicyConfig {
    /// Check the invariants the engine relies on
    pub fn validate(&self) -> Result<(), ReaperError> {
        let durations = [
            ("observe_interval", self.observe_interval),
            ("check_timeout", self.check_timeout),
            ("max_list_backoff", self.max_list_backoff),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ReaperError::Config(format!("{} must be positive", name)));
            }
        }

        if self.failing_streak_threshold < 1 {
            return Err(ReaperError::Config(
                "failing_streak_threshold must be at least 1".to_string(),
            ));
        }
        if self.max_stop_retries < 1 {
            return Err(ReaperError::Config(
                "max_stop_retries must be at least 1".to_string(),
            ));
        }
        if let Some(limit) = self.max_concurrent_checks {
            if limit < 1 || limit > Semaphore::MAX_PERMITS {
                return Err(ReaperError::Config(format!(
                    "max_concurrent_checks must be between 1 and {}",
                    Semaphore::MAX_PERMITS
                )));
            }
        }

        Ok(())
    }

    /// Validate and return the config, consuming it
    pub fn validated(self) -> Result<Self, ReaperError> {
        self.validate()?;
        Ok(self)
    }
}
