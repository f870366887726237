//! Engine library for the unhealthy container reaper
//!
//! This crate provides the core functionality for:
//! - Enumerating running containers from the container runtime
//! - Evaluating each container's health against a reaping policy
//! - Stopping persistently unhealthy containers with bounded retries
//! - Driving fixed-interval observation cycles
//! - Health checks and observability

pub mod config;
pub mod error;
pub mod evaluator;
pub mod health;
pub mod models;
pub mod observability;
pub mod reaper;
pub mod runtime;
pub mod scheduler;

pub use config::{CancelPolicy, ListFailurePolicy, PolicyConfig};
pub use error::{ReaperError, RuntimeError};
pub use evaluator::{HealthEvaluator, Verdict};
pub use health::{ComponentHealth, ComponentStatus, HealthReport, ReadinessResponse, ReaperHealth};
pub use models::*;
pub use observability::{ReaperMetrics, StructuredLogger};
pub use reaper::Reaper;
pub use runtime::{ContainerRuntime, DockerRuntime};
pub use scheduler::{Scheduler, SchedulerBuilder};
