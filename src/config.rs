//! Configuration module for extscript.

use serde::Deserialize;
use std::path::Path;

use crate::{Result, ScriptError};

/// Twelve hours, the default idle period for cached artifacts and pools.
const DEFAULT_IDLE_TTL_SECS: u64 = 12 * 60 * 60;

/// Compiled-artifact cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Seconds without access before a compiled script is dropped.
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,
    /// Optional upper bound on cached scripts.
    #[serde(default)]
    pub max_entries: Option<u64>,
}

fn default_idle_ttl() -> u64 {
    DEFAULT_IDLE_TTL_SECS
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl(),
            max_entries: None,
        }
    }
}

/// Per-path worker pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Seconds without use before a path's pool is shut down.
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,
    /// Optional upper bound on live pools.
    #[serde(default)]
    pub max_entries: Option<u64>,
    /// Threads available to each pool.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Prefix of worker thread names; the path is appended.
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

fn default_worker_threads() -> usize {
    4
}

fn default_thread_name_prefix() -> String {
    "extscript-worker".to_string()
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl(),
            max_entries: None,
            worker_threads: default_worker_threads(),
            thread_name_prefix: default_thread_name_prefix(),
        }
    }
}

/// Script resource limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Maximum Lua instructions per run (0 = unlimited).
    #[serde(default = "default_max_instructions")]
    pub max_instructions: u64,
    /// Maximum Lua memory per run in bytes (0 = unlimited).
    #[serde(default = "default_max_memory")]
    pub max_memory_bytes: usize,
}

fn default_max_instructions() -> u64 {
    1_000_000
}

fn default_max_memory() -> usize {
    10 * 1024 * 1024 // 10MB
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_instructions: default_max_instructions(),
            max_memory_bytes: default_max_memory(),
        }
    }
}

/// Outbound HTTP configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Total request timeout in seconds.
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
    /// User-Agent header sent by scripts.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_http_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("extscript/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file, written in addition to stdout.
    #[serde(default)]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pools: PoolConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(ScriptError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| ScriptError::Configuration(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `EXTSCRIPT_LOG_LEVEL`: Override the log level
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("EXTSCRIPT_LOG_LEVEL") {
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
    }

    /// Validate the configuration.
    ///
    /// Returns an error if an idle period or the pool thread count is zero.
    pub fn validate(&self) -> Result<()> {
        if self.cache.idle_ttl_secs == 0 {
            return Err(ScriptError::Configuration(
                "cache.idle_ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.pools.idle_ttl_secs == 0 {
            return Err(ScriptError::Configuration(
                "pools.idle_ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.pools.worker_threads == 0 {
            return Err(ScriptError::Configuration(
                "pools.worker_threads must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
