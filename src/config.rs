//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Health monitor tunables.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HealthConfig {
    /// Seconds between health poll cycles.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// Per-worker probe timeout; an answer slower than this is `Unresponsive`.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,
    /// Heartbeat file older than this marks the worker `Unresponsive`.
    #[serde(default = "default_heartbeat_stale")]
    pub heartbeat_stale_seconds: u64,
    /// Consecutive failures before a restart is requested.
    #[serde(default = "default_restart_threshold")]
    pub restart_threshold: u32,
    /// Rolling window for counting restarts toward chronic failure.
    #[serde(default = "default_chronic_window")]
    pub chronic_window_seconds: u64,
    /// Restarts within the rolling window before `ChronicFailure`.
    #[serde(default = "default_chronic_max_restarts")]
    pub chronic_max_restarts: u32,
}

fn default_poll_interval() -> u64 {
    300
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_heartbeat_stale() -> u64 {
    120
}

fn default_restart_threshold() -> u32 {
    3
}

fn default_chronic_window() -> u64 {
    3600
}

fn default_chronic_max_restarts() -> u32 {
    3
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
            probe_timeout_seconds: default_probe_timeout(),
            heartbeat_stale_seconds: default_heartbeat_stale(),
            restart_threshold: default_restart_threshold(),
            chronic_window_seconds: default_chronic_window(),
            chronic_max_restarts: default_chronic_max_restarts(),
        }
    }
}

/// Billing cadence and warning tier timing.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BillingConfig {
    /// Seconds between fee debits for an instance (one billing period).
    #[serde(default = "default_billing_period")]
    pub period_seconds: u64,
    /// Seconds after the first warning before the final warning fires.
    #[serde(default = "default_final_warning_after")]
    pub final_warning_after_seconds: u64,
    /// Seconds after the first warning before suspension.
    #[serde(default = "default_suspend_after")]
    pub suspend_after_seconds: u64,
    /// Seconds between billing tick sweeps.
    #[serde(default = "default_billing_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

fn default_billing_period() -> u64 {
    86_400
}

fn default_final_warning_after() -> u64 {
    // First warning three days before suspension, final warning one day
    // before: the gap between tiers is two days.
    172_800
}

fn default_suspend_after() -> u64 {
    259_200
}

fn default_billing_sweep_interval() -> u64 {
    3600
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            period_seconds: default_billing_period(),
            final_warning_after_seconds: default_final_warning_after(),
            suspend_after_seconds: default_suspend_after(),
            sweep_interval_seconds: default_billing_sweep_interval(),
        }
    }
}

/// Cleanup sweep tunables.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CleanupConfig {
    /// Seconds between cleanup sweeps.
    #[serde(default = "default_cleanup_sweep_interval")]
    pub sweep_interval_seconds: u64,
    /// Grace window: seconds a suspended instance is retained before
    /// irreversible resource cleanup.
    #[serde(default = "default_grace_retention")]
    pub grace_retention_seconds: u64,
}

fn default_cleanup_sweep_interval() -> u64 {
    21_600
}

fn default_grace_retention() -> u64 {
    // 15 days.
    1_296_000
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            sweep_interval_seconds: default_cleanup_sweep_interval(),
            grace_retention_seconds: default_grace_retention(),
        }
    }
}

/// Launch retry backoff parameters for the reconciliation loop.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LaunchConfig {
    /// Base delay for exponential backoff between launch retries.
    #[serde(default = "default_retry_base")]
    pub retry_base_seconds: u64,
    /// Launch attempts before the instance is marked `LaunchFailed`.
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
}

fn default_retry_base() -> u64 {
    10
}

fn default_retry_max_attempts() -> u32 {
    5
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            retry_base_seconds: default_retry_base(),
            retry_max_attempts: default_retry_max_attempts(),
        }
    }
}

/// Process supervisor tunables.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SupervisorConfig {
    /// Seconds to wait for graceful worker exit before force-kill.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_seconds: u64,
    /// CPU ceiling requested for each worker, percent of one core.
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit_percent: u32,
    /// Memory ceiling requested for each worker, in megabytes.
    #[serde(default = "default_memory_limit")]
    pub memory_limit_mb: u32,
}

fn default_stop_timeout() -> u64 {
    5
}

fn default_cpu_limit() -> u32 {
    50
}

fn default_memory_limit() -> u32 {
    256
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_timeout_seconds: default_stop_timeout(),
            cpu_limit_percent: default_cpu_limit(),
            memory_limit_mb: default_memory_limit(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./running_bots")
}

fn default_max_live_workers() -> u32 {
    200
}

fn default_max_instances_per_account() -> u32 {
    10
}

fn default_creation_fee() -> i64 {
    50_000
}

fn default_daily_fee() -> i64 {
    1000
}

fn default_reconcile_interval() -> u64 {
    30
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Root directory under which per-instance working directories live.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    /// Worker runtime binary executed for every instance.
    pub worker_command: String,
    /// Default arguments for the worker runtime.
    #[serde(default)]
    pub worker_args: Vec<String>,
    /// System-wide ceiling on concurrently live workers.
    #[serde(default = "default_max_live_workers")]
    pub max_live_workers: u32,
    /// Maximum non-deleted instances a single account may own.
    #[serde(default = "default_max_instances_per_account")]
    pub max_instances_per_account: u32,
    /// One-time fee debited when an instance is deployed (minor units).
    #[serde(default = "default_creation_fee")]
    pub creation_fee: i64,
    /// Daily fee applied when a template does not set its own (minor units).
    #[serde(default = "default_daily_fee")]
    pub default_daily_fee: i64,
    /// Seconds between reconciliation passes.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_seconds: u64,
    /// Health monitor tunables.
    #[serde(default)]
    pub health: HealthConfig,
    /// Billing cadence and warning tiers.
    #[serde(default)]
    pub billing: BillingConfig,
    /// Cleanup sweep and grace retention.
    #[serde(default)]
    pub cleanup: CleanupConfig,
    /// Launch retry backoff parameters.
    #[serde(default)]
    pub launch: LaunchConfig,
    /// Process supervisor tunables.
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Derived path for the `SQLite` database file.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.storage_root.join("botfoundry.db")
    }

    /// Per-instance working directory under the storage root.
    #[must_use]
    pub fn instance_dir(&self, instance_id: &str) -> PathBuf {
        self.storage_root.join("instances").join(instance_id)
    }

    /// Probe timeout as a [`Duration`].
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.health.probe_timeout_seconds)
    }

    /// Graceful stop timeout as a [`Duration`].
    #[must_use]
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.supervisor.stop_timeout_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.worker_command.is_empty() {
            return Err(AppError::Config("worker_command must not be empty".into()));
        }

        if self.max_live_workers == 0 {
            return Err(AppError::Config(
                "max_live_workers must be greater than zero".into(),
            ));
        }

        if self.max_instances_per_account == 0 {
            return Err(AppError::Config(
                "max_instances_per_account must be greater than zero".into(),
            ));
        }

        if self.creation_fee < 0 || self.default_daily_fee < 0 {
            return Err(AppError::Config("fees must not be negative".into()));
        }

        if self.launch.retry_max_attempts == 0 {
            return Err(AppError::Config(
                "launch.retry_max_attempts must be greater than zero".into(),
            ));
        }

        if self.billing.suspend_after_seconds <= self.billing.final_warning_after_seconds {
            return Err(AppError::Config(
                "billing.suspend_after_seconds must exceed final_warning_after_seconds".into(),
            ));
        }

        Ok(())
    }
}
