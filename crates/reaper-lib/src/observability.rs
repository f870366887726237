//! Observability infrastructure for the reaper
//!
//! Provides:
//! - Prometheus metrics (cycles, outcomes, stop attempts, check latency)
//! - Structured logging with tracing, one event per outcome

use crate::models::{ContainerRef, Outcome};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{error, info, warn};

/// Histogram buckets for per-container check latency (in seconds)
const CHECK_LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ReaperMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct ReaperMetricsInner {
    cycles: IntCounter,
    cycle_errors: IntCounter,
    containers_observed: IntGauge,
    checks_in_flight: IntGauge,
    outcomes: IntCounterVec,
    stop_attempts: IntCounter,
    check_latency_seconds: Histogram,
}

impl ReaperMetricsInner {
    fn new() -> Self {
        Self {
            cycles: register_int_counter!(
                "reaper_cycles_total",
                "Observation cycles that listed containers successfully"
            )
            .expect("Failed to register cycles_total"),

            cycle_errors: register_int_counter!(
                "reaper_cycle_errors_total",
                "Observation cycles skipped because listing containers failed"
            )
            .expect("Failed to register cycle_errors_total"),

            containers_observed: register_int_gauge!(
                "reaper_containers_observed",
                "Running containers found by the most recent cycle"
            )
            .expect("Failed to register containers_observed"),

            checks_in_flight: register_int_gauge!(
                "reaper_checks_in_flight",
                "Container evaluations currently running"
            )
            .expect("Failed to register checks_in_flight"),

            outcomes: register_int_counter_vec!(
                "reaper_outcomes_total",
                "Container evaluation outcomes by kind",
                &["outcome"]
            )
            .expect("Failed to register outcomes_total"),

            stop_attempts: register_int_counter!(
                "reaper_stop_attempts_total",
                "Stop calls issued to the container runtime"
            )
            .expect("Failed to register stop_attempts_total"),

            check_latency_seconds: register_histogram!(
                "reaper_check_latency_seconds",
                "Time from the start of a container evaluation to its outcome",
                CHECK_LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register check_latency_seconds"),
        }
    }
}

/// Reaper metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct ReaperMetrics {
    _private: (),
}

impl Default for ReaperMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ReaperMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ReaperMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ReaperMetricsInner {
        GLOBAL_METRICS.get_or_init(ReaperMetricsInner::new)
    }

    pub fn inc_cycles(&self) {
        self.inner().cycles.inc();
    }

    pub fn inc_cycle_errors(&self) {
        self.inner().cycle_errors.inc();
    }

    pub fn set_containers_observed(&self, count: usize) {
        self.inner()
            .containers_observed
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn check_started(&self) {
        self.inner().checks_in_flight.inc();
    }

    pub fn check_finished(&self) {
        self.inner().checks_in_flight.dec();
    }

    pub fn inc_stop_attempts(&self) {
        self.inner().stop_attempts.inc();
    }

    /// Record an outcome and the time it took to produce
    pub fn observe_outcome(&self, outcome: &Outcome, elapsed: Duration) {
        self.inner()
            .outcomes
            .with_label_values(&[outcome.as_str()])
            .inc();
        self.inner()
            .check_latency_seconds
            .observe(elapsed.as_secs_f64());
    }

    /// Current count for an outcome label
    pub fn outcome_count(&self, outcome: &str) -> u64 {
        self.inner().outcomes.with_label_values(&[outcome]).get()
    }
}

/// Structured logger for reaper events
///
/// Every per-container event carries the container id prefix and name as
/// explicit fields.
#[derive(Clone)]
pub struct StructuredLogger {
    runtime: String,
}

impl StructuredLogger {
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
        }
    }

    /// Log the outcome of one container evaluation
    pub fn log_outcome(&self, container: &ContainerRef, outcome: &Outcome, threshold: u32) {
        let container_id = container.short_id();
        let container_name = container.name.as_str();

        match outcome {
            Outcome::Healthy => info!(
                event = "check_outcome",
                outcome = outcome.as_str(),
                container_id = %container_id,
                container_name = %container_name,
                "Container healthy"
            ),
            Outcome::BelowThreshold { failing_streak } => info!(
                event = "check_outcome",
                outcome = outcome.as_str(),
                container_id = %container_id,
                container_name = %container_name,
                failing_streak = failing_streak,
                threshold = threshold,
                "Container not healthy, failing streak below threshold"
            ),
            Outcome::NoHealthData => info!(
                event = "check_outcome",
                outcome = outcome.as_str(),
                container_id = %container_id,
                container_name = %container_name,
                "No health data reported, skipping"
            ),
            Outcome::DryRunSkipped { failing_streak } => warn!(
                event = "check_outcome",
                outcome = outcome.as_str(),
                container_id = %container_id,
                container_name = %container_name,
                failing_streak = failing_streak,
                threshold = threshold,
                "Dry run: would stop unhealthy container"
            ),
            Outcome::Stopped { attempts, elapsed } => warn!(
                event = "check_outcome",
                outcome = outcome.as_str(),
                container_id = %container_id,
                container_name = %container_name,
                attempts = attempts,
                elapsed_ms = elapsed.as_millis() as u64,
                "Stopped unhealthy container"
            ),
            Outcome::StopFailed {
                attempts,
                last_error,
            } => error!(
                event = "check_outcome",
                outcome = outcome.as_str(),
                container_id = %container_id,
                container_name = %container_name,
                attempts = attempts,
                error = %last_error,
                "Failed to stop unhealthy container"
            ),
            Outcome::InspectError(err) => warn!(
                event = "check_outcome",
                outcome = outcome.as_str(),
                container_id = %container_id,
                container_name = %container_name,
                error = %err,
                "Failed to inspect container"
            ),
            Outcome::TimedOut(deadline) => warn!(
                event = "check_outcome",
                outcome = outcome.as_str(),
                container_id = %container_id,
                container_name = %container_name,
                deadline_ms = deadline.as_millis() as u64,
                "Container check timed out"
            ),
        }
    }

    /// Log a completed enumeration and dispatch
    pub fn log_cycle(&self, containers: usize, elapsed: Duration) {
        info!(
            event = "cycle_dispatched",
            runtime = %self.runtime,
            containers = containers,
            elapsed_ms = elapsed.as_millis() as u64,
            "Dispatched container checks"
        );
    }

    /// Log a failed enumeration
    pub fn log_list_failure(&self, error: &str, consecutive_failures: u32, backoff: Duration) {
        warn!(
            event = "list_failed",
            runtime = %self.runtime,
            error = %error,
            consecutive_failures = consecutive_failures,
            backoff_ms = backoff.as_millis() as u64,
            "Failed to list running containers, skipping cycle"
        );
    }

    /// Log reaper startup
    pub fn log_startup(&self, version: &str, dry_run: bool) {
        info!(
            event = "reaper_started",
            runtime = %self.runtime,
            reaper_version = %version,
            dry_run = dry_run,
            "Unhealthy container reaper started"
        );
    }

    /// Log reaper shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "reaper_shutdown",
            runtime = %self.runtime,
            reason = %reason,
            "Unhealthy container reaper shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reaper_metrics_observations() {
        let metrics = ReaperMetrics::new();

        let before = metrics.outcome_count("stopped");
        metrics.observe_outcome(
            &Outcome::Stopped {
                attempts: 1,
                elapsed: Duration::from_millis(20),
            },
            Duration::from_millis(25),
        );
        assert!(metrics.outcome_count("stopped") > before);

        metrics.inc_cycles();
        metrics.inc_cycle_errors();
        metrics.set_containers_observed(3);
        metrics.check_started();
        metrics.check_finished();
        metrics.inc_stop_attempts();
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("unix:///var/run/docker.sock");
        assert_eq!(logger.runtime, "unix:///var/run/docker.sock");
    }

    #[test]
    fn test_log_outcome_covers_every_variant() {
        let logger = StructuredLogger::new("test");
        let container = ContainerRef::new("0123456789abcdef", "web");
        let outcomes = [
            Outcome::Healthy,
            Outcome::BelowThreshold { failing_streak: 2 },
            Outcome::NoHealthData,
            Outcome::DryRunSkipped { failing_streak: 7 },
            Outcome::Stopped {
                attempts: 2,
                elapsed: Duration::from_millis(10),
            },
            Outcome::StopFailed {
                attempts: 3,
                last_error: "conflict".to_string(),
            },
            Outcome::InspectError("no such container".to_string()),
            Outcome::TimedOut(Duration::from_secs(1)),
        ];
        for outcome in &outcomes {
            logger.log_outcome(&container, outcome, 5);
        }
    }
}
