//! Reaper configuration
//!
//! Values are layered, later sources winning: built-in defaults, an
//! optional config file, `REAPER_*` environment variables, then flags.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use reaper_lib::{CancelPolicy, ListFailurePolicy, PolicyConfig, ReaperError};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable prefix, e.g. `REAPER_INTERVAL=10s`
const ENV_PREFIX: &str = "REAPER";

/// Default port for the health/metrics API
const DEFAULT_API_PORT: u16 = 8080;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

/// Stops containers whose health check keeps failing
#[derive(Debug, Parser)]
#[command(name = "unhealthy-reaper")]
#[command(author, version, about = "Stops persistently unhealthy containers", long_about = None)]
pub struct Cli {
    /// Docker URL or socket (defaults to DOCKER_HOST or the local socket)
    #[arg(long)]
    pub docker: Option<String>,

    /// Time between observation cycles, e.g. "30s"
    #[arg(long, value_parser = humantime::parse_duration)]
    pub interval: Option<Duration>,

    /// Deadline for listing containers and for each container check
    #[arg(long, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,

    /// Log reaping decisions without stopping containers
    #[arg(long)]
    pub dry_run: bool,

    /// Failing streak at which a container is stopped
    #[arg(long)]
    pub failing_streak_threshold: Option<u32>,

    /// Stop attempts before giving up on a container
    #[arg(long)]
    pub max_stop_retries: Option<u32>,

    /// Grace period before the runtime kills a stopping container
    #[arg(long, value_parser = humantime::parse_duration)]
    pub stop_grace_period: Option<Duration>,

    /// Maximum number of container checks running at once (unbounded when unset)
    #[arg(long)]
    pub max_concurrent_checks: Option<usize>,

    /// What to do when listing containers fails
    #[arg(long, value_parser = ["skip", "exit"])]
    pub list_failure_policy: Option<String>,

    /// Upper bound on the retry backoff after listing failures
    #[arg(long, value_parser = humantime::parse_duration)]
    pub max_list_backoff: Option<Duration>,

    /// What to do with a check that overruns its deadline
    #[arg(long, value_parser = ["abort", "detach"])]
    pub cancel_policy: Option<String>,

    /// Port for /healthz, /readyz and /metrics (0 disables the API)
    #[arg(long)]
    pub api_port: Option<u16>,

    /// Log output format
    #[arg(long, value_enum, default_value = "json")]
    pub log_format: LogFormat,

    /// Config file (TOML, YAML or JSON)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Fully resolved configuration
///
/// Keys match the `PolicyConfig` field names, so the file key and the
/// environment variable for `--timeout` are `check_timeout` and
/// `REAPER_CHECK_TIMEOUT`.
#[derive(Debug, Clone, Deserialize)]
pub struct ReaperConfig {
    /// Docker endpoint; `None` uses the local defaults
    pub docker: Option<String>,

    #[serde(with = "humantime_serde")]
    pub observe_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub check_timeout: Duration,

    pub dry_run: bool,
    pub failing_streak_threshold: u32,
    pub max_stop_retries: u32,

    #[serde(with = "humantime_serde")]
    pub stop_grace_period: Duration,

    /// Unset leaves fan-out unbounded
    #[serde(default)]
    pub max_concurrent_checks: Option<usize>,
    pub list_failure_policy: ListFailurePolicy,

    #[serde(with = "humantime_serde")]
    pub max_list_backoff: Duration,

    pub cancel_policy: CancelPolicy,
    pub api_port: u16,
}

fn format_duration(duration: Duration) -> String {
    humantime::format_duration(duration).to_string()
}

impl ReaperConfig {
    /// Load configuration from defaults, file, process environment and flags
    pub fn load(cli: &Cli) -> Result<Self> {
        Self::load_with_env(cli, None)
    }

    /// Same as [`load`](Self::load), reading `REAPER_*` variables from `env`
    /// instead of the process environment when given
    pub fn load_with_env(cli: &Cli, env: Option<::config::Map<String, String>>) -> Result<Self> {
        let defaults = PolicyConfig::default();

        let mut builder = ::config::Config::builder()
            .set_default("observe_interval", format_duration(defaults.observe_interval))?
            .set_default("check_timeout", format_duration(defaults.check_timeout))?
            .set_default("dry_run", defaults.dry_run)?
            .set_default(
                "failing_streak_threshold",
                i64::from(defaults.failing_streak_threshold),
            )?
            .set_default("max_stop_retries", i64::from(defaults.max_stop_retries))?
            .set_default("stop_grace_period", format_duration(defaults.stop_grace_period))?
            .set_default("list_failure_policy", defaults.list_failure_policy.as_str())?
            .set_default("max_list_backoff", format_duration(defaults.max_list_backoff))?
            .set_default("cancel_policy", defaults.cancel_policy.as_str())?
            .set_default("api_port", i64::from(DEFAULT_API_PORT))?;

        if let Some(path) = &cli.config {
            builder = builder.add_source(::config::File::from(path.as_path()));
        }

        builder = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .source(env),
            )
            .set_override_option("docker", cli.docker.clone())?
            .set_override_option("observe_interval", cli.interval.map(format_duration))?
            .set_override_option("check_timeout", cli.timeout.map(format_duration))?
            .set_override_option("dry_run", cli.dry_run.then_some(true))?
            .set_override_option(
                "failing_streak_threshold",
                cli.failing_streak_threshold.map(i64::from),
            )?
            .set_override_option("max_stop_retries", cli.max_stop_retries.map(i64::from))?
            .set_override_option(
                "stop_grace_period",
                cli.stop_grace_period.map(format_duration),
            )?
            .set_override_option(
                "max_concurrent_checks",
                cli.max_concurrent_checks.map(|n| n as i64),
            )?
            .set_override_option("list_failure_policy", cli.list_failure_policy.clone())?
            .set_override_option("max_list_backoff", cli.max_list_backoff.map(format_duration))?
            .set_override_option("cancel_policy", cli.cancel_policy.clone())?
            .set_override_option("api_port", cli.api_port.map(i64::from))?;

        builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Build the validated reaping policy
    pub fn policy(&self) -> Result<PolicyConfig, ReaperError> {
        PolicyConfig {
            observe_interval: self.observe_interval,
            check_timeout: self.check_timeout,
            failing_streak_threshold: self.failing_streak_threshold,
            max_stop_retries: self.max_stop_retries,
            dry_run: self.dry_run,
            stop_grace_period: self.stop_grace_period,
            max_concurrent_checks: self.max_concurrent_checks,
            list_failure_policy: self.list_failure_policy,
            max_list_backoff: self.max_list_backoff,
            cancel_policy: self.cancel_policy,
        }
        .validated()
    }

    /// Label identifying the runtime endpoint in logs
    pub fn runtime_label(&self) -> String {
        self.docker
            .clone()
            .unwrap_or_else(|| "local defaults".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["unhealthy-reaper"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn test_defaults_match_policy_defaults() {
        let config = ReaperConfig::load(&cli(&[])).unwrap();
        let policy = config.policy().unwrap();

        assert_eq!(policy, PolicyConfig::default());
        assert_eq!(config.api_port, DEFAULT_API_PORT);
        assert!(config.docker.is_none());
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = ReaperConfig::load(&cli(&[
            "--docker",
            "unix:///run/docker.sock",
            "--interval",
            "10s",
            "--timeout",
            "1m30s",
            "--dry-run",
            "--max-stop-retries",
            "7",
            "--cancel-policy",
            "detach",
        ]))
        .unwrap();

        assert_eq!(config.docker.as_deref(), Some("unix:///run/docker.sock"));
        assert_eq!(config.observe_interval, Duration::from_secs(10));
        assert_eq!(config.check_timeout, Duration::from_secs(90));
        assert!(config.dry_run);
        assert_eq!(config.max_stop_retries, 7);
        assert_eq!(config.cancel_policy, CancelPolicy::Detach);
    }

    #[test]
    fn test_file_is_overridden_by_flags() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "observe_interval = \"45s\"\nfailing_streak_threshold = 2\nlist_failure_policy = \"skip\""
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = ReaperConfig::load(&cli(&[
            "--config",
            &path,
            "--failing-streak-threshold",
            "9",
        ]))
        .unwrap();

        assert_eq!(config.observe_interval, Duration::from_secs(45));
        assert_eq!(config.failing_streak_threshold, 9);
        assert_eq!(config.list_failure_policy, ListFailurePolicy::Skip);
    }

    #[test]
    fn test_invalid_duration_flag_is_rejected() {
        let result = Cli::try_parse_from(["unhealthy-reaper", "--interval", "soon"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_duration_in_file_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "check_timeout = \"forever\"").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        assert!(ReaperConfig::load(&cli(&["--config", &path])).is_err());
    }

    #[test]
    fn test_zero_threshold_fails_validation() {
        let config = ReaperConfig::load(&cli(&["--failing-streak-threshold", "0"])).unwrap();
        assert!(matches!(config.policy(), Err(ReaperError::Config(_))));
    }

    fn env(vars: &[(&str, &str)]) -> Option<::config::Map<String, String>> {
        Some(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_environment_overrides_defaults() {
        let config = ReaperConfig::load_with_env(
            &cli(&[]),
            env(&[
                ("REAPER_CHECK_TIMEOUT", "10s"),
                ("REAPER_OBSERVE_INTERVAL", "1m"),
                ("REAPER_MAX_CONCURRENT_CHECKS", "4"),
                ("REAPER_CANCEL_POLICY", "abort"),
            ]),
        )
        .unwrap();

        assert_eq!(config.check_timeout, Duration::from_secs(10));
        assert_eq!(config.observe_interval, Duration::from_secs(60));
        assert_eq!(config.max_concurrent_checks, Some(4));
        assert_eq!(config.cancel_policy, CancelPolicy::Abort);
    }

    #[test]
    fn test_flags_override_environment() {
        let config = ReaperConfig::load_with_env(
            &cli(&["--timeout", "3s"]),
            env(&[("REAPER_CHECK_TIMEOUT", "10s")]),
        )
        .unwrap();

        assert_eq!(config.check_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_concurrency_cap_is_opt_in() {
        let config = ReaperConfig::load_with_env(&cli(&[]), env(&[])).unwrap();
        assert_eq!(config.max_concurrent_checks, None);

        let config = ReaperConfig::load(&cli(&["--max-concurrent-checks", "2"])).unwrap();
        assert_eq!(config.policy().unwrap().max_concurrent_checks, Some(2));
    }
}
