//! Application configuration types
//!
//! Every section defaults independently so partial files are accepted.

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_DISTRIBUTE_INTERVAL_SECS, DEFAULT_LIVE_TRANSPORT_WINDOW_SECS, DEFAULT_LOCK_TTL_SECS,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_MISSING_CODES, DEFAULT_PENDING_DELAY_SECS, DEFAULT_PURGE_CRON,
    DEFAULT_QUEUE_DELAY_SECS, DEFAULT_RESTART_CODES, DEFAULT_TRANSPORT_TIMEOUT_SECS,
    DEFAULT_WARNING_CODES,
};

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub operation: OperationConfig,
    pub worker: WorkerConfig,
    pub registry: RegistryConfig,
    pub logging: LoggingConfig,
}

/// Encrypted database settings
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub pool_size: u32,
    /// SQLCipher key. Startup fails without one.
    pub encryption_key: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: "regsync.db".to_string(), pool_size: 8, encryption_key: None }
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("path", &self.path)
            .field("pool_size", &self.pool_size)
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Export queue settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Delay between enqueue and eligibility when the caller gives none.
    pub default_delay_secs: u64,
    /// `0` deletes consumed entries right away; otherwise they are kept
    /// (invisible to distribution) for this long.
    pub retention_secs: u64,
    pub distribute_interval_secs: u64,
    pub purge_cron: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_delay_secs: DEFAULT_QUEUE_DELAY_SECS,
            retention_secs: 0,
            distribute_interval_secs: DEFAULT_DISTRIBUTE_INTERVAL_SECS,
            purge_cron: DEFAULT_PURGE_CRON.to_string(),
        }
    }
}

/// Operation state machine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationConfig {
    /// Re-queue objects the registry reports as unknown.
    pub export_missing: bool,
    pub pending_delay_secs: u64,
    /// Retries allowed after a retryable failure before the operation is
    /// flagged as needing attention.
    pub max_attempts: u32,
    pub live_transport_window_secs: u64,
    pub lock_ttl_secs: u64,
    pub transport_timeout_secs: u64,
    pub warning_codes: Vec<String>,
    pub missing_codes: Vec<String>,
    pub restart_codes: Vec<String>,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            export_missing: true,
            pending_delay_secs: DEFAULT_PENDING_DELAY_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            live_transport_window_secs: DEFAULT_LIVE_TRANSPORT_WINDOW_SECS,
            lock_ttl_secs: DEFAULT_LOCK_TTL_SECS,
            transport_timeout_secs: DEFAULT_TRANSPORT_TIMEOUT_SECS,
            warning_codes: to_owned(DEFAULT_WARNING_CODES),
            missing_codes: to_owned(DEFAULT_MISSING_CODES),
            restart_codes: to_owned(DEFAULT_RESTART_CODES),
        }
    }
}

impl OperationConfig {
    pub fn is_warning_code(&self, code: &str) -> bool {
        self.warning_codes.iter().any(|c| c == code)
    }

    pub fn is_missing_code(&self, code: &str) -> bool {
        self.missing_codes.iter().any(|c| c == code)
    }

    pub fn is_restart_code(&self, code: &str) -> bool {
        self.restart_codes.iter().any(|c| c == code)
    }
}

/// Background worker settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub poll_interval_secs: u64,
    pub batch_size: usize,
    pub processing_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { poll_interval_secs: 5, batch_size: 10, processing_timeout_secs: 300 }
    }
}

/// Registry HTTP endpoint settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_attempts: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            timeout_secs: 30,
            max_attempts: 3,
        }
    }
}

/// Tracing subscriber settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive; `RUST_LOG` wins when set.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), json: false }
    }
}

fn to_owned(codes: &[&str]) -> Vec<String> {
    codes.iter().map(|c| (*c).to_string()).collect()
}
