//! Configuration module
//!
//! Handles loading and validating agent configuration from TOML files.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::connection::retry::RetryPolicy;
use crate::runtime::chunker::Thresholds;

/// Main configuration structure for the Converge Agent
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Unique identifier for this agent, sent as `x-agent-id` on every request
    #[serde(default = "default_agent_id")]
    pub agent_id: String,

    /// Server/host identifier, sent as `x-server-id` on every request
    #[serde(default = "default_server_id")]
    pub server_id: String,

    /// Control service connection settings
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,

    /// Cycle scheduling
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// On-disk locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// Backoff for reporting calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Output chunking thresholds
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Policy execution command
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Control service connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ControlPlaneConfig {
    /// Base URL of the control service API
    #[serde(default = "default_control_plane_url")]
    pub url: String,

    /// API key for authentication
    #[serde(default)]
    pub api_key: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Cycle scheduling configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Seconds between cycles (0 or negative selects the default)
    #[serde(default = "default_interval")]
    pub interval_secs: i64,

    /// Upper bound (exclusive) of the one-time startup jitter
    #[serde(default = "default_max_jitter_minutes")]
    pub max_jitter_minutes: u64,
}

/// Filesystem layout
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Agent-owned working directory; anything unexpected in it is removed
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,

    /// PID file used by `start` and `stop`
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
}

/// Retry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Retry 4xx responses instead of treating them as permanent
    #[serde(default = "default_true")]
    pub retry_client_errors: bool,
}

/// Chunking configuration; zero disables a dimension
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_lines")]
    pub max_lines: usize,

    #[serde(default = "default_max_elapsed_ms")]
    pub max_elapsed_ms: u64,

    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
}

/// Policy command configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    /// Program to run for each policy
    #[serde(default = "default_command")]
    pub command: String,

    /// Arguments; `{attributes}` and `{policy_dir}` are substituted
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Extra environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_agent_id() -> String {
    Uuid::new_v4().to_string()
}

fn default_server_id() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn default_control_plane_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

pub(crate) fn default_interval() -> i64 {
    600
}

fn default_max_jitter_minutes() -> u64 {
    6
}

fn default_workdir() -> PathBuf {
    std::env::temp_dir().join("converge-agent")
}

fn default_pid_file() -> PathBuf {
    std::env::temp_dir().join("converge-agent.pid")
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_backoff_factor() -> f64 {
    3.0
}

fn default_true() -> bool {
    true
}

fn default_max_lines() -> usize {
    100
}

fn default_max_elapsed_ms() -> u64 {
    10_000
}

fn default_max_bytes() -> usize {
    32 * 1024
}

fn default_command() -> String {
    "chef-client".to_string()
}

fn default_args() -> Vec<String> {
    vec!["-z".to_string(), "-j".to_string(), "{attributes}".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            url: default_control_plane_url(),
            api_key: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            max_jitter_minutes: default_max_jitter_minutes(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            workdir: default_workdir(),
            pid_file: default_pid_file(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_factor: default_backoff_factor(),
            retry_client_errors: default_true(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_lines: default_max_lines(),
            max_elapsed_ms: default_max_elapsed_ms(),
            max_bytes: default_max_bytes(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            env: BTreeMap::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            backoff_factor: self.backoff_factor,
            retry_client_errors: self.retry_client_errors,
        }
    }
}

impl ChunkingConfig {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            max_lines: self.max_lines,
            max_elapsed: Duration::from_millis(self.max_elapsed_ms),
            max_bytes: self.max_bytes,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    /// Reject settings the agent cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.paths.pid_file.starts_with(&self.paths.workdir) {
            bail!(
                "pid_file {} must not live inside workdir {}",
                self.paths.pid_file.display(),
                self.paths.workdir.display()
            );
        }
        if !self.retry.backoff_factor.is_finite() || self.retry.backoff_factor < 1.0 {
            bail!("retry.backoff_factor must be a finite number >= 1.0");
        }
        if self.executor.command.trim().is_empty() {
            bail!("executor.command must not be empty");
        }
        Ok(())
    }
}
