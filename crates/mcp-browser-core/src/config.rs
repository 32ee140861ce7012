//! Configuration loading, environment overrides, and validation.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ErrorKind};
use crate::retry::DEFAULT_RETRYABLE_KINDS;

/// Top-level MCP Browser configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Browser pool sizing and reclamation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum concurrent browser instances (default: 5).
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,

    /// Seconds a free, context-free instance may sit idle before it is
    /// reclaimed (default: 300).
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: f64,

    /// Seconds between reclamation sweeps (default: 60).
    #[serde(default = "default_reclaim_interval")]
    pub reclaim_interval_secs: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: default_max_instances(),
            idle_timeout_secs: default_idle_timeout(),
            reclaim_interval_secs: default_reclaim_interval(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        secs_to_duration(self.idle_timeout_secs)
    }

    pub fn reclaim_interval(&self) -> Duration {
        secs_to_duration(self.reclaim_interval_secs)
    }
}

fn default_max_instances() -> usize {
    5
}

fn default_idle_timeout() -> f64 {
    300.0
}

fn default_reclaim_interval() -> f64 {
    60.0
}

/// Retry behaviour for pool operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, in seconds (default: 0.5).
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: f64,

    /// Upper bound on any single delay, in seconds (default: 5.0).
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: f64,

    /// Multiplier applied per attempt (default: 2.0).
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Error kinds worth retrying (default: TIMEOUT, NETWORK_ERROR, RATE_LIMITED).
    #[serde(default = "default_retryable_kinds")]
    pub retryable_kinds: Vec<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_secs: default_initial_delay(),
            max_delay_secs: default_max_delay(),
            backoff_factor: default_backoff_factor(),
            retryable_kinds: default_retryable_kinds(),
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        secs_to_duration(self.initial_delay_secs)
    }

    pub fn max_delay(&self) -> Duration {
        secs_to_duration(self.max_delay_secs)
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> f64 {
    0.5
}

fn default_max_delay() -> f64 {
    5.0
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_retryable_kinds() -> Vec<ErrorKind> {
    DEFAULT_RETRYABLE_KINDS.to_vec()
}

/// Structured logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "mcp_browser_pool=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        }
    }
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Environment variables that override file settings.
pub const ENV_MAX_INSTANCES: &str = "MCP_BROWSER_MAX_INSTANCES";
pub const ENV_IDLE_TIMEOUT: &str = "MCP_BROWSER_IDLE_TIMEOUT";
pub const ENV_RECLAIM_INTERVAL: &str = "MCP_BROWSER_RECLAIM_INTERVAL";
pub const ENV_RETRY_MAX_ATTEMPTS: &str = "MCP_BROWSER_RETRY_MAX_ATTEMPTS";
pub const ENV_RETRY_INITIAL_DELAY: &str = "MCP_BROWSER_RETRY_INITIAL_DELAY";
pub const ENV_RETRY_MAX_DELAY: &str = "MCP_BROWSER_RETRY_MAX_DELAY";
pub const ENV_RETRY_BACKOFF_FACTOR: &str = "MCP_BROWSER_RETRY_BACKOFF_FACTOR";

static ENV_REF: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex"));

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    ENV_REF
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}

fn parse_env<T: std::str::FromStr>(var: &str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env {
            var: var.to_string(),
            value,
        })
}

impl Config {
    /// Load config from a JSON5 file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;

        // Substitute ${ENV_VAR} references before parsing
        let substituted = substitute_env_vars(&raw);

        json5::from_str(&substituted).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from `path`, then apply `MCP_BROWSER_*` environment overrides.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_MAX_INSTANCES) {
            self.pool_mut().max_instances = parse_env(ENV_MAX_INSTANCES, v)?;
        }
        if let Some(v) = lookup(ENV_IDLE_TIMEOUT) {
            self.pool_mut().idle_timeout_secs = parse_env(ENV_IDLE_TIMEOUT, v)?;
        }
        if let Some(v) = lookup(ENV_RECLAIM_INTERVAL) {
            self.pool_mut().reclaim_interval_secs = parse_env(ENV_RECLAIM_INTERVAL, v)?;
        }
        if let Some(v) = lookup(ENV_RETRY_MAX_ATTEMPTS) {
            self.retry_mut().max_attempts = parse_env(ENV_RETRY_MAX_ATTEMPTS, v)?;
        }
        if let Some(v) = lookup(ENV_RETRY_INITIAL_DELAY) {
            self.retry_mut().initial_delay_secs = parse_env(ENV_RETRY_INITIAL_DELAY, v)?;
        }
        if let Some(v) = lookup(ENV_RETRY_MAX_DELAY) {
            self.retry_mut().max_delay_secs = parse_env(ENV_RETRY_MAX_DELAY, v)?;
        }
        if let Some(v) = lookup(ENV_RETRY_BACKOFF_FACTOR) {
            self.retry_mut().backoff_factor = parse_env(ENV_RETRY_BACKOFF_FACTOR, v)?;
        }
        Ok(())
    }

    fn pool_mut(&mut self) -> &mut PoolConfig {
        self.pool.get_or_insert_with(PoolConfig::default)
    }

    fn retry_mut(&mut self) -> &mut RetryConfig {
        self.retry.get_or_insert_with(RetryConfig::default)
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Effective pool settings.
    pub fn pool_config(&self) -> PoolConfig {
        self.pool.clone().unwrap_or_default()
    }

    /// Effective retry settings.
    pub fn retry_config(&self) -> RetryConfig {
        self.retry.clone().unwrap_or_default()
    }

    /// Effective logging settings.
    pub fn logging_config(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }

    /// Validate the configuration, returning `(warnings, errors)`.
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let pool = self.pool_config();
        if pool.max_instances == 0 {
            errors.push("pool.max_instances must be at least 1".to_string());
        }
        if !(pool.idle_timeout_secs >= 0.0) {
            errors.push(format!(
                "pool.idle_timeout_secs must be >= 0 (got {})",
                pool.idle_timeout_secs
            ));
        }
        if !(pool.reclaim_interval_secs > 0.0) {
            errors.push(format!(
                "pool.reclaim_interval_secs must be > 0 (got {})",
                pool.reclaim_interval_secs
            ));
        } else if pool.reclaim_interval_secs > pool.idle_timeout_secs && pool.idle_timeout_secs > 0.0
        {
            warnings.push(format!(
                "pool.reclaim_interval_secs ({}) exceeds idle_timeout_secs ({}); idle instances will linger",
                pool.reclaim_interval_secs, pool.idle_timeout_secs
            ));
        }

        let retry = self.retry_config();
        if retry.max_attempts == 0 {
            errors.push("retry.max_attempts must be at least 1".to_string());
        }
        if !(retry.initial_delay_secs >= 0.0) {
            errors.push(format!(
                "retry.initial_delay_secs must be >= 0 (got {})",
                retry.initial_delay_secs
            ));
        }
        if !(retry.max_delay_secs >= 0.0) {
            errors.push(format!(
                "retry.max_delay_secs must be >= 0 (got {})",
                retry.max_delay_secs
            ));
        } else if retry.max_delay_secs < retry.initial_delay_secs {
            warnings.push(format!(
                "retry.max_delay_secs ({}) is below initial_delay_secs ({}); every delay is capped",
                retry.max_delay_secs, retry.initial_delay_secs
            ));
        }
        if !(retry.backoff_factor >= 1.0) {
            warnings.push(format!(
                "retry.backoff_factor below 1.0 shrinks delays (got {})",
                retry.backoff_factor
            ));
        }
        if retry.retryable_kinds.is_empty() && retry.max_attempts > 1 {
            warnings.push("retry.retryable_kinds is empty; nothing will be retried".to_string());
        }

        if let Some(logging) = &self.logging {
            if !matches!(logging.format.as_str(), "plain" | "json") {
                errors.push(format!(
                    "logging.format must be \"plain\" or \"json\" (got \"{}\")",
                    logging.format
                ));
            }
            if !matches!(logging.output.as_str(), "stderr" | "stdout") {
                errors.push(format!(
                    "logging.output must be \"stderr\" or \"stdout\" (got \"{}\")",
                    logging.output
                ));
            }
        }

        (warnings, errors)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Base directory for MCP Browser data: `~/.mcp-browser/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-browser")
}
