//! Bounded-retry stop procedure

use crate::config::PolicyConfig;
use crate::models::{ContainerRef, Outcome};
use crate::observability::ReaperMetrics;
use crate::runtime::ContainerRuntime;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Stops containers, retrying failed stop calls without backoff
#[derive(Clone)]
pub struct Reaper {
    runtime: Arc<dyn ContainerRuntime>,
    max_attempts: u32,
    grace_period: Duration,
    metrics: ReaperMetrics,
}

impl Reaper {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, policy: &PolicyConfig, metrics: ReaperMetrics) -> Self {
        Self {
            runtime,
            max_attempts: policy.max_stop_retries.max(1),
            grace_period: policy.stop_grace_period,
            metrics,
        }
    }

    /// Stop `container`, returning on the first successful attempt.
    ///
    /// Produces `Stopped` with the wall time spent across attempts, or
    /// `StopFailed` carrying the error of the last attempt.
    pub async fn reap(&self, container: &ContainerRef) -> Outcome {
        let start = Instant::now();
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            self.metrics.inc_stop_attempts();
            debug!(attempt = attempt, max_attempts = self.max_attempts, "Stopping container");

            match self.runtime.stop(&container.id, self.grace_period).await {
                Ok(()) => {
                    return Outcome::Stopped {
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    };
                }
                Err(e) => {
                    warn!(
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Stop attempt failed"
                    );
                    last_error = e.to_string();
                }
            }
        }

        Outcome::StopFailed {
            attempts: self.max_attempts,
            last_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;
    use crate::models::ContainerHealth;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Runtime whose stop call fails until a given attempt number
    struct FlakyStopRuntime {
        succeed_on: Option<u32>,
        stop_calls: AtomicU32,
    }

    impl FlakyStopRuntime {
        fn new(succeed_on: Option<u32>) -> Self {
            Self {
                succeed_on,
                stop_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for FlakyStopRuntime {
        async fn list_running(&self) -> Result<Vec<ContainerRef>, RuntimeError> {
            Ok(vec![])
        }

        async fn inspect(&self, _id: &str) -> Result<Option<ContainerHealth>, RuntimeError> {
            Ok(None)
        }

        async fn stop(&self, _id: &str, _grace: Duration) -> Result<(), RuntimeError> {
            let call = self.stop_calls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.succeed_on {
                Some(n) if call >= n => Ok(()),
                _ => Err(RuntimeError::Other(format!("stop failed on attempt {}", call))),
            }
        }

        async fn ping(&self) -> Result<(), RuntimeError> {
            Ok(())
        }
    }

    fn reaper_for(runtime: Arc<FlakyStopRuntime>, retries: u32) -> Reaper {
        let policy = PolicyConfig {
            max_stop_retries: retries,
            ..PolicyConfig::default()
        };
        Reaper::new(runtime, &policy, ReaperMetrics::new())
    }

    #[tokio::test]
    async fn test_reap_succeeds_first_attempt() {
        let runtime = Arc::new(FlakyStopRuntime::new(Some(1)));
        let reaper = reaper_for(runtime.clone(), 3);

        let outcome = reaper.reap(&ContainerRef::new("c1", "web")).await;

        assert!(matches!(outcome, Outcome::Stopped { attempts: 1, .. }));
        assert_eq!(runtime.stop_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reap_retries_until_success() {
        let runtime = Arc::new(FlakyStopRuntime::new(Some(3)));
        let reaper = reaper_for(runtime.clone(), 3);

        let outcome = reaper.reap(&ContainerRef::new("c1", "web")).await;

        assert!(matches!(outcome, Outcome::Stopped { attempts: 3, .. }));
        assert_eq!(runtime.stop_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_reap_reports_last_error() {
        let runtime = Arc::new(FlakyStopRuntime::new(None));
        let reaper = reaper_for(runtime.clone(), 4);

        let outcome = reaper.reap(&ContainerRef::new("c1", "web")).await;

        assert_eq!(
            outcome,
            Outcome::StopFailed {
                attempts: 4,
                last_error: "stop failed on attempt 4".to_string(),
            }
        );
        assert_eq!(runtime.stop_calls.load(Ordering::SeqCst), 4);
    }
}
