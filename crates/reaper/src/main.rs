//! Unhealthy Reaper - stops persistently unhealthy containers
//!
//! This binary runs next to a container runtime, periodically inspecting
//! the health status of running containers and stopping those whose
//! failing streak has reached the configured threshold.

use anyhow::Result;
use clap::Parser;
use reaper_lib::{
    observability::{ReaperMetrics, StructuredLogger},
    ContainerRuntime, DockerRuntime, PolicyConfig, ReaperError, ReaperHealth, RuntimeError,
    SchedulerBuilder,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

use config::{Cli, LogFormat, ReaperConfig};

const REAPER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    if let Err(e) = run(cli).await {
        error!(error = %format!("{:#}", e), "Fatal error, exiting");
        return Err(e);
    }

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }
}

async fn run(cli: Cli) -> Result<()> {
    info!("Starting unhealthy-reaper");

    // Load configuration
    let config = ReaperConfig::load(&cli)?;
    let policy = config.policy()?;
    info!(
        runtime = %config.runtime_label(),
        interval_ms = policy.observe_interval.as_millis() as u64,
        check_timeout_ms = policy.check_timeout.as_millis() as u64,
        dry_run = policy.dry_run,
        "Reaper configured"
    );

    // Connect to the runtime and verify it answers
    let runtime = DockerRuntime::connect(
        config.docker.as_deref(),
        policy.check_timeout + policy.stop_grace_period,
    )
    .map_err(ReaperError::Connection)?;
    ping(&runtime, &policy).await?;

    let health = ReaperHealth::new();

    let metrics = ReaperMetrics::new();
    let logger = StructuredLogger::new(config.runtime_label());
    logger.log_startup(REAPER_VERSION, policy.dry_run);

    // Start health and metrics server
    if config.api_port != 0 {
        let app_state = Arc::new(api::AppState::new(health.clone()));
        let port = config.api_port;
        tokio::spawn(async move {
            if let Err(e) = api::serve(port, app_state).await {
                error!(error = %e, "API server stopped");
            }
        });
    }

    let scheduler = SchedulerBuilder::new()
        .runtime(Arc::new(runtime))
        .policy(policy)
        .health(health.clone())
        .logger(logger.clone())
        .metrics(metrics)
        .build()?;

    health.set_ready(true).await;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let mut loop_handle = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::select! {
        result = &mut loop_handle => {
            result??;
        }
        _ = shutdown_signal() => {
            logger.log_shutdown("signal received");
            signal_shutdown(&shutdown_tx);
            loop_handle.await??;
        }
    }

    info!("Shutting down");
    Ok(())
}

/// Startup connectivity check, bounded by the check timeout
async fn ping(runtime: &DockerRuntime, policy: &PolicyConfig) -> Result<(), ReaperError> {
    match tokio::time::timeout(policy.check_timeout, runtime.ping()).await {
        Ok(Ok(())) => {
            info!("Container runtime reachable");
            Ok(())
        }
        Ok(Err(e)) => Err(ReaperError::Connection(e)),
        Err(_) => Err(ReaperError::Connection(RuntimeError::DeadlineExceeded(
            policy.check_timeout,
        ))),
    }
}

/// Ask the observation loop to stop; returns false if it had already exited
fn signal_shutdown(shutdown_tx: &broadcast::Sender<()>) -> bool {
    if shutdown_tx.send(()).is_err() {
        debug!("Observation loop already stopped");
        return false;
    }
    true
}

/// Resolves on Ctrl-C, or on SIGTERM where available
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_shutdown_reports_stopped_loop() {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        assert!(signal_shutdown(&shutdown_tx));

        drop(shutdown_rx);
        assert!(!signal_shutdown(&shutdown_tx));
    }
}
