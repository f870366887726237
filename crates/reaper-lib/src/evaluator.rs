//! Per-container health evaluation
//!
//! Each evaluation inspects one container, applies the reaping decision
//! table and, when indicated, hands the container to the [`Reaper`]. The
//! whole evaluation, including any wait for a concurrency permit, races
//! against `check_timeout`; it always produces exactly one [`Outcome`] and
//! never returns an error.

use crate::config::{CancelPolicy, PolicyConfig};
use crate::models::{ContainerHealth, ContainerRef, HealthStatus, Outcome};
use crate::observability::{ReaperMetrics, StructuredLogger};
use crate::reaper::Reaper;
use crate::runtime::ContainerRuntime;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout, Instant};
use tracing::{debug, info_span, Instrument};

/// Decision reached from a container's health data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    NoHealthData,
    Healthy,
    BelowThreshold(u32),
    DryRun(u32),
    Reap(u32),
}

/// Apply the decision table to freshly inspected health data.
///
/// Rules are evaluated in order and the first match wins: missing data,
/// healthy, streak below threshold, dry run, reap.
pub fn decide(health: Option<ContainerHealth>, policy: &PolicyConfig) -> Verdict {
    let health = match health {
        Some(h) if h.status != HealthStatus::None => h,
        _ => return Verdict::NoHealthData,
    };

    if health.status == HealthStatus::Healthy {
        return Verdict::Healthy;
    }

    let streak = health.failing_streak;
    if streak < policy.failing_streak_threshold {
        Verdict::BelowThreshold(streak)
    } else if policy.dry_run {
        Verdict::DryRun(streak)
    } else {
        Verdict::Reap(streak)
    }
}

/// Evaluates container health and reaps containers past the threshold
#[derive(Clone)]
pub struct HealthEvaluator {
    runtime: Arc<dyn ContainerRuntime>,
    policy: Arc<PolicyConfig>,
    reaper: Reaper,
    /// Shared by every clone; `None` when fan-out is unbounded
    permits: Option<Arc<Semaphore>>,
    logger: StructuredLogger,
    metrics: ReaperMetrics,
}

impl HealthEvaluator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        policy: Arc<PolicyConfig>,
        logger: StructuredLogger,
        metrics: ReaperMetrics,
    ) -> Self {
        let reaper = Reaper::new(runtime.clone(), &policy, metrics.clone());
        let permits = policy
            .max_concurrent_checks
            .map(|limit| Arc::new(Semaphore::new(limit)));
        Self {
            runtime,
            policy,
            reaper,
            permits,
            logger,
            metrics,
        }
    }

    /// Run one deadline-bounded evaluation, then log and record its outcome
    pub async fn check(&self, container: ContainerRef) -> Outcome {
        let span = info_span!(
            "check",
            container_id = %container.short_id(),
            container_name = %container.name
        );

        async move {
            debug!("Checking container");
            self.metrics.check_started();
            let start = Instant::now();

            let outcome = self.evaluate_with_deadline(&container).await;

            self.metrics.check_finished();
            self.metrics.observe_outcome(&outcome, start.elapsed());
            self.logger
                .log_outcome(&container, &outcome, self.policy.failing_streak_threshold);
            outcome
        }
        .instrument(span)
        .await
    }

    /// Apply the decision table with no deadline
    pub async fn evaluate(&self, container: &ContainerRef) -> Outcome {
        let health = match self.runtime.inspect(&container.id).await {
            Ok(health) => health,
            Err(e) => return Outcome::InspectError(e.to_string()),
        };

        match decide(health, &self.policy) {
            Verdict::NoHealthData => Outcome::NoHealthData,
            Verdict::Healthy => Outcome::Healthy,
            Verdict::BelowThreshold(failing_streak) => Outcome::BelowThreshold { failing_streak },
            Verdict::DryRun(failing_streak) => Outcome::DryRunSkipped { failing_streak },
            Verdict::Reap(failing_streak) => {
                debug!(failing_streak = failing_streak, "Failing streak past threshold");
                self.reaper.reap(container).await
            }
        }
    }

    async fn acquire_permit(&self) -> Option<OwnedSemaphorePermit> {
        match &self.permits {
            // The semaphore is never closed
            Some(permits) => permits.clone().acquire_owned().await.ok(),
            None => None,
        }
    }

    async fn evaluate_with_deadline(&self, container: &ContainerRef) -> Outcome {
        let deadline = self.policy.check_timeout;

        let result = match self.policy.cancel_policy {
            CancelPolicy::Abort => {
                timeout(deadline, async {
                    let _permit = self.acquire_permit().await;
                    self.evaluate(container).await
                })
                .await
            }
            CancelPolicy::Detach => {
                timeout(deadline, async {
                    let permit = self.acquire_permit().await;
                    let evaluator = self.clone();
                    let container = container.clone();
                    // The detached task keeps its permit until it finishes
                    let handle = tokio::spawn(
                        async move {
                            let _permit = permit;
                            evaluator.evaluate(&container).await
                        }
                        .in_current_span(),
                    );

                    match handle.await {
                        Ok(outcome) => outcome,
                        Err(e) => Outcome::InspectError(format!("evaluation task failed: {}", e)),
                    }
                })
                .await
            }
        };

        result.unwrap_or_else(|_| {
            debug!(
                cancel_policy = %self.policy.cancel_policy,
                "Deadline passed, result will be discarded"
            );
            Outcome::TimedOut(deadline)
        })
    }
}
