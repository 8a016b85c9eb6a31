//! Configuration loader
//!
//! Loads application configuration from environment variables or files.
//!
//! ## Loading Strategy
//! 1. First, attempts to load from environment variables
//! 2. If the required ones are missing, falls back to loading from file
//! 3. Probes multiple paths for config files
//! 4. Supports JSON and TOML formats
//!
//! ## Environment Variables
//! Required:
//! - `REGSYNC_DB_PATH`: Database file path
//! - `REGSYNC_REGISTRY_URL`: Registry base url
//!
//! Optional (section defaults apply when unset):
//! - `REGSYNC_DB_POOL_SIZE`, `REGSYNC_DB_ENCRYPTION_KEY`
//! - `REGSYNC_QUEUE_DELAY_SECS`, `REGSYNC_QUEUE_RETENTION_SECS`,
//!   `REGSYNC_QUEUE_DISTRIBUTE_INTERVAL_SECS`, `REGSYNC_QUEUE_PURGE_CRON`
//! - `REGSYNC_OPERATION_EXPORT_MISSING`, `REGSYNC_OPERATION_PENDING_DELAY_SECS`,
//!   `REGSYNC_OPERATION_MAX_ATTEMPTS`, `REGSYNC_OPERATION_LOCK_TTL_SECS`
//! - `REGSYNC_WORKER_POLL_INTERVAL_SECS`, `REGSYNC_WORKER_BATCH_SIZE`,
//!   `REGSYNC_WORKER_PROCESSING_TIMEOUT_SECS`
//! - `REGSYNC_REGISTRY_TIMEOUT_SECS`, `REGSYNC_REGISTRY_MAX_ATTEMPTS`
//! - `REGSYNC_LOG_LEVEL`, `REGSYNC_LOG_JSON`
//!
//! ## File Locations
//! The loader probes the following paths (in order):
//! 1. `./config.{json,toml}` then `./regsync.{json,toml}`
//! 2. The same names in the parent and grandparent directories
//! 3. The same names relative to the executable location

use std::path::{Path, PathBuf};
use std::str::FromStr;

use regsync_domain::{Config, RegSyncError, Result};

const FILE_NAMES: [&str; 4] = ["config.json", "config.toml", "regsync.json", "regsync.toml"];

/// Load configuration with automatic fallback strategy
///
/// First attempts to load from environment variables. If a required
/// variable is missing or invalid, falls back to loading from a config file.
///
/// # Errors
/// Returns `RegSyncError::Config` if neither source yields a configuration.
pub fn load() -> Result<Config> {
    match load_from_env() {
        Ok(config) => {
            tracing::info!("Configuration loaded from environment variables");
            Ok(config)
        }
        Err(e) => {
            tracing::debug!(error = ?e, "Failed to load from environment, trying file");
            load_from_file(None)
        }
    }
}

/// Load configuration from environment variables
///
/// # Errors
/// Returns `RegSyncError::Config` if a required variable is missing or any
/// variable has an invalid value.
pub fn load_from_env() -> Result<Config> {
    let mut config = Config::default();

    config.database.path = env_var("REGSYNC_DB_PATH")?;
    config.registry.base_url = env_var("REGSYNC_REGISTRY_URL")?;

    if let Some(pool_size) = env_parse("REGSYNC_DB_POOL_SIZE")? {
        config.database.pool_size = pool_size;
    }
    config.database.encryption_key = std::env::var("REGSYNC_DB_ENCRYPTION_KEY").ok();

    if let Some(delay) = env_parse("REGSYNC_QUEUE_DELAY_SECS")? {
        config.queue.default_delay_secs = delay;
    }
    if let Some(retention) = env_parse("REGSYNC_QUEUE_RETENTION_SECS")? {
        config.queue.retention_secs = retention;
    }
    if let Some(interval) = env_parse("REGSYNC_QUEUE_DISTRIBUTE_INTERVAL_SECS")? {
        config.queue.distribute_interval_secs = interval;
    }
    if let Ok(cron) = std::env::var("REGSYNC_QUEUE_PURGE_CRON") {
        config.queue.purge_cron = cron;
    }

    config.operation.export_missing =
        env_bool("REGSYNC_OPERATION_EXPORT_MISSING", config.operation.export_missing);
    if let Some(delay) = env_parse("REGSYNC_OPERATION_PENDING_DELAY_SECS")? {
        config.operation.pending_delay_secs = delay;
    }
    if let Some(attempts) = env_parse("REGSYNC_OPERATION_MAX_ATTEMPTS")? {
        config.operation.max_attempts = attempts;
    }
    if let Some(ttl) = env_parse("REGSYNC_OPERATION_LOCK_TTL_SECS")? {
        config.operation.lock_ttl_secs = ttl;
    }

    if let Some(interval) = env_parse("REGSYNC_WORKER_POLL_INTERVAL_SECS")? {
        config.worker.poll_interval_secs = interval;
    }
    if let Some(batch_size) = env_parse("REGSYNC_WORKER_BATCH_SIZE")? {
        config.worker.batch_size = batch_size;
    }
    if let Some(timeout) = env_parse("REGSYNC_WORKER_PROCESSING_TIMEOUT_SECS")? {
        config.worker.processing_timeout_secs = timeout;
    }

    if let Some(timeout) = env_parse("REGSYNC_REGISTRY_TIMEOUT_SECS")? {
        config.registry.timeout_secs = timeout;
    }
    if let Some(attempts) = env_parse("REGSYNC_REGISTRY_MAX_ATTEMPTS")? {
        config.registry.max_attempts = attempts;
    }

    if let Ok(level) = std::env::var("REGSYNC_LOG_LEVEL") {
        config.logging.level = level;
    }
    config.logging.json = env_bool("REGSYNC_LOG_JSON", config.logging.json);

    Ok(config)
}

/// Load configuration from a file
///
/// If `path` is `None`, probes the standard locations. Format is detected
/// by file extension.
///
/// # Errors
/// Returns `RegSyncError::Config` if the file is missing, unreadable or
/// malformed.
pub fn load_from_file(path: Option<PathBuf>) -> Result<Config> {
    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                return Err(RegSyncError::Config(format!("Config file not found: {}", p.display())));
            }
            p
        }
        None => probe_config_paths().ok_or_else(|| {
            RegSyncError::Config(
                "No config file found in any of the standard locations".to_string(),
            )
        })?,
    };

    tracing::info!(path = %config_path.display(), "Loading configuration from file");

    let contents = std::fs::read_to_string(&config_path)
        .map_err(|e| RegSyncError::Config(format!("Failed to read config file: {e}")))?;

    parse_config(&contents, &config_path)
}

fn parse_config(contents: &str, path: &Path) -> Result<Config> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("json");

    match extension {
        "toml" => toml::from_str(contents)
            .map_err(|e| RegSyncError::Config(format!("Invalid TOML format: {e}"))),
        "json" => serde_json::from_str(contents)
            .map_err(|e| RegSyncError::Config(format!("Invalid JSON format: {e}"))),
        _ => Err(RegSyncError::Config(format!("Unsupported config format: {extension}"))),
    }
}

/// First existing config file in the standard locations.
pub fn probe_config_paths() -> Option<PathBuf> {
    let mut roots = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        roots.extend(cwd.ancestors().take(3).map(Path::to_path_buf));
    }
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            roots.extend(exe_dir.ancestors().take(3).map(Path::to_path_buf));
        }
    }

    candidate_paths(&roots).into_iter().find(|path| path.exists())
}

fn candidate_paths(roots: &[PathBuf]) -> Vec<PathBuf> {
    roots.iter().flat_map(|root| FILE_NAMES.iter().map(move |name| root.join(name))).collect()
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key)
        .map_err(|_| RegSyncError::Config(format!("Missing required environment variable: {key}")))
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| RegSyncError::Config(format!("Invalid value for {key}: {e}"))),
        Err(_) => Ok(None),
    }
}

/// Accepts `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off` (case-insensitive)
fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|s| matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}
