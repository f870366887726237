//! Observation loop
//!
//! Drives fixed-interval cycles: on every tick the running containers are
//! listed and one evaluation per container is dispatched. Dispatch is
//! fire-and-forget and cycles are not serialized against each other; each
//! evaluation's own deadline bounds how long it is waited on.

use crate::config::{ListFailurePolicy, PolicyConfig};
use crate::error::{ReaperError, Result, RuntimeError};
use crate::evaluator::HealthEvaluator;
use crate::health::ReaperHealth;
use crate::models::{ContainerRef, Outcome};
use crate::observability::{ReaperMetrics, StructuredLogger};
use crate::runtime::ContainerRuntime;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// Scheduler that lists containers and fans out evaluations every interval
pub struct Scheduler {
    runtime: Arc<dyn ContainerRuntime>,
    policy: Arc<PolicyConfig>,
    evaluator: HealthEvaluator,
    health: ReaperHealth,
    logger: StructuredLogger,
    metrics: ReaperMetrics,
    consecutive_failures: u32,
    /// Ticks before this instant are skipped while backing off
    resume_at: Option<Instant>,
}

impl Scheduler {
    /// Create a new scheduler
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        policy: Arc<PolicyConfig>,
        health: ReaperHealth,
        logger: StructuredLogger,
        metrics: ReaperMetrics,
    ) -> Self {
        let evaluator =
            HealthEvaluator::new(runtime.clone(), policy.clone(), logger.clone(), metrics.clone());

        Self {
            runtime,
            policy,
            evaluator,
            health,
            logger,
            metrics,
            consecutive_failures: 0,
            resume_at: None,
        }
    }

    /// Run the observation loop until `shutdown` fires.
    ///
    /// Under the default [`ListFailurePolicy::Exit`] the first failed
    /// enumeration ends the loop with [`ReaperError::Enumeration`].
    /// [`ListFailurePolicy::Skip`] logs the failure and backs off instead.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!(
            interval_ms = self.policy.observe_interval.as_millis() as u64,
            check_timeout_ms = self.policy.check_timeout.as_millis() as u64,
            max_concurrent_checks = ?self.policy.max_concurrent_checks,
            list_failure_policy = %self.policy.list_failure_policy,
            cancel_policy = %self.policy.cancel_policy,
            dry_run = self.policy.dry_run,
            "Starting observation loop"
        );

        let mut ticker = interval(self.policy.observe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                tick_at = ticker.tick() => {
                    if let Err(e) = self.tick(tick_at).await {
                        error!(error = %e, "Observation loop terminated");
                        return Err(e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down observation loop");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Handle one timer tick scheduled at `tick_at`
    pub async fn tick(&mut self, tick_at: Instant) -> Result<()> {
        if let Some(resume_at) = self.resume_at {
            if tick_at < resume_at {
                debug!(
                    remaining_ms = (resume_at - tick_at).as_millis() as u64,
                    "Backing off after list failure, skipping cycle"
                );
                return Ok(());
            }
        }

        match self.cycle().await {
            // Evaluations keep running after their handles are dropped
            Ok(_handles) => Ok(()),
            Err(e) => self.on_list_failure(e, tick_at).await,
        }
    }

    /// List running containers and dispatch one evaluation per container.
    ///
    /// Returns the handles of the dispatched evaluations without waiting on them.
    pub async fn cycle(&mut self) -> Result<Vec<JoinHandle<Outcome>>> {
        let start = Instant::now();
        let containers = self.list_running().await?;

        self.consecutive_failures = 0;
        self.resume_at = None;
        self.health.record_cycle(containers.len()).await;
        self.metrics.inc_cycles();
        self.metrics.set_containers_observed(containers.len());

        let count = containers.len();
        let handles = containers
            .into_iter()
            .map(|container| self.dispatch(container))
            .collect();

        self.logger.log_cycle(count, start.elapsed());
        Ok(handles)
    }

    async fn list_running(&self) -> Result<Vec<ContainerRef>> {
        let deadline = self.policy.check_timeout;
        match timeout(deadline, self.runtime.list_running()).await {
            Ok(Ok(containers)) => Ok(containers),
            Ok(Err(e)) => Err(ReaperError::Enumeration(e)),
            Err(_) => Err(ReaperError::Enumeration(RuntimeError::DeadlineExceeded(
                deadline,
            ))),
        }
    }

    fn dispatch(&self, container: ContainerRef) -> JoinHandle<Outcome> {
        let evaluator = self.evaluator.clone();
        tokio::spawn(async move { evaluator.check(container).await })
    }

    async fn on_list_failure(&mut self, err: ReaperError, tick_at: Instant) -> Result<()> {
        self.metrics.inc_cycle_errors();
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let message = err.to_string();
        self.health
            .record_list_failure(message.clone(), self.consecutive_failures)
            .await;

        match self.policy.list_failure_policy {
            ListFailurePolicy::Exit => {
                self.health.record_loop_failure(message).await;
                Err(err)
            }
            ListFailurePolicy::Skip => {
                let backoff = backoff_delay(
                    self.policy.observe_interval,
                    self.consecutive_failures,
                    self.policy.max_list_backoff,
                );
                self.resume_at = Some(tick_at + backoff);
                self.logger
                    .log_list_failure(&message, self.consecutive_failures, backoff);
                Ok(())
            }
        }
    }

    /// Consecutive enumeration failures since the last successful cycle
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Delay before the next enumeration attempt after `consecutive_failures`
/// failures in a row: `interval * 2^(n-1)`, capped at `cap`.
pub fn backoff_delay(interval: Duration, consecutive_failures: u32, cap: Duration) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(31);
    interval
        .checked_mul(1u32 << exponent)
        .unwrap_or(cap)
        .min(cap)
}

/// Builder for creating the scheduler
pub struct SchedulerBuilder {
    runtime: Option<Arc<dyn ContainerRuntime>>,
    policy: PolicyConfig,
    health: Option<ReaperHealth>,
    logger: Option<StructuredLogger>,
    metrics: Option<ReaperMetrics>,
}

impl SchedulerBuilder {
    /// Create a new builder with the default policy
    pub fn new() -> Self {
        Self {
            runtime: None,
            policy: PolicyConfig::default(),
            health: None,
            logger: None,
            metrics: None,
        }
    }

    /// Set the container runtime
    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Set the reaping policy
    pub fn policy(mut self, policy: PolicyConfig) -> Self {
        self.policy = policy;
        self
    }

    /// Set the health state updated by the loop
    pub fn health(mut self, health: ReaperHealth) -> Self {
        self.health = Some(health);
        self
    }

    /// Set the structured logger
    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Set the metrics handle
    pub fn metrics(mut self, metrics: ReaperMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the policy and build the scheduler
    pub fn build(self) -> Result<Scheduler> {
        let runtime = self
            .runtime
            .ok_or_else(|| ReaperError::Config("container runtime is required".to_string()))?;
        let policy = self.policy.validated()?;

        Ok(Scheduler::new(
            runtime,
            Arc::new(policy),
            self.health.unwrap_or_default(),
            self.logger
                .unwrap_or_else(|| StructuredLogger::new("unknown")),
            self.metrics.unwrap_or_default(),
        ))
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ComponentStatus;
    use crate::models::ContainerHealth;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Runtime whose list call can be switched between failing and succeeding
    struct ToggleRuntime {
        list_fails: AtomicBool,
        list_calls: AtomicU32,
    }

    impl ToggleRuntime {
        fn new(list_fails: bool) -> Self {
            Self {
                list_fails: AtomicBool::new(list_fails),
                list_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ContainerRuntime for ToggleRuntime {
        async fn list_running(&self) -> std::result::Result<Vec<ContainerRef>, RuntimeError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.list_fails.load(Ordering::SeqCst) {
                Err(RuntimeError::Other("connection refused".to_string()))
            } else {
                Ok(vec![ContainerRef::new("c1", "web")])
            }
        }

        async fn inspect(
            &self,
            _id: &str,
        ) -> std::result::Result<Option<ContainerHealth>, RuntimeError> {
            Ok(None)
        }

        async fn stop(&self, _id: &str, _grace: Duration) -> std::result::Result<(), RuntimeError> {
            Ok(())
        }

        async fn ping(&self) -> std::result::Result<(), RuntimeError> {
            Ok(())
        }
    }

    fn scheduler(runtime: Arc<ToggleRuntime>, policy: PolicyConfig) -> (Scheduler, ReaperHealth) {
        let health = ReaperHealth::new();
        let scheduler = SchedulerBuilder::new()
            .runtime(runtime)
            .policy(policy)
            .health(health.clone())
            .build()
            .unwrap();
        (scheduler, health)
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let interval = Duration::from_secs(10);
        let cap = Duration::from_secs(60);

        assert_eq!(backoff_delay(interval, 1, cap), Duration::from_secs(10));
        assert_eq!(backoff_delay(interval, 2, cap), Duration::from_secs(20));
        assert_eq!(backoff_delay(interval, 3, cap), Duration::from_secs(40));
        assert_eq!(backoff_delay(interval, 4, cap), cap);
        assert_eq!(backoff_delay(interval, u32::MAX, cap), cap);
    }

    #[test]
    fn test_builder_requires_runtime() {
        let result = SchedulerBuilder::new().build();
        assert!(matches!(result, Err(ReaperError::Config(_))));
    }

    #[test]
    fn test_builder_validates_policy() {
        let result = SchedulerBuilder::new()
            .runtime(Arc::new(ToggleRuntime::new(false)))
            .policy(PolicyConfig {
                max_stop_retries: 0,
                ..PolicyConfig::default()
            })
            .build();
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_policy_backs_off_and_recovers() {
        let runtime = Arc::new(ToggleRuntime::new(true));
        let interval = Duration::from_secs(10);
        let (mut scheduler, health) = scheduler(
            runtime.clone(),
            PolicyConfig {
                observe_interval: interval,
                list_failure_policy: ListFailurePolicy::Skip,
                ..PolicyConfig::default()
            },
        );

        let t0 = Instant::now();
        assert!(scheduler.tick(t0).await.is_ok());
        assert_eq!(scheduler.consecutive_failures(), 1);
        let report = health.report().await;
        assert_eq!(report.runtime.status, ComponentStatus::Degraded);
        assert_eq!(report.consecutive_list_failures, 1);

        // First failure: the very next tick retries
        assert!(scheduler.tick(t0 + interval).await.is_ok());
        assert_eq!(runtime.list_calls.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.consecutive_failures(), 2);

        // Second failure: one tick is skipped
        scheduler.tick(t0 + interval * 2).await.unwrap();
        assert_eq!(runtime.list_calls.load(Ordering::SeqCst), 2);

        runtime.list_fails.store(false, Ordering::SeqCst);
        scheduler.tick(t0 + interval * 3).await.unwrap();
        assert_eq!(runtime.list_calls.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.consecutive_failures(), 0);
        let report = health.report().await;
        assert_eq!(report.status, ComponentStatus::Healthy);
        assert_eq!(report.containers_observed, 1);
    }

    #[tokio::test]
    async fn test_exit_policy_propagates_enumeration_error() {
        let runtime = Arc::new(ToggleRuntime::new(true));
        let (mut scheduler, health) = scheduler(
            runtime,
            PolicyConfig {
                list_failure_policy: ListFailurePolicy::Exit,
                ..PolicyConfig::default()
            },
        );

        let result = scheduler.tick(Instant::now()).await;
        assert!(matches!(result, Err(ReaperError::Enumeration(_))));
        assert_eq!(health.report().await.scheduler.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_policy_ends_run_on_list_failure() {
        let runtime = Arc::new(ToggleRuntime::new(true));
        let (scheduler, health) = scheduler(runtime.clone(), PolicyConfig::default());

        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(scheduler.run(shutdown_rx));

        let result = timeout(Duration::from_secs(120), handle).await.unwrap().unwrap();
        assert!(matches!(result, Err(ReaperError::Enumeration(_))));
        assert_eq!(runtime.list_calls.load(Ordering::SeqCst), 1);
        assert_eq!(health.report().await.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_cycle_dispatches_one_check_per_container() {
        let runtime = Arc::new(ToggleRuntime::new(false));
        let (mut scheduler, _health) = scheduler(runtime, PolicyConfig::default());

        let handles = scheduler.cycle().await.unwrap();
        assert_eq!(handles.len(), 1);

        let outcome = handles.into_iter().next().unwrap().await.unwrap();
        assert_eq!(outcome, Outcome::NoHealthData);
    }
}
