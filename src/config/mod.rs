//! Configuration loading for the mirrorsync service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `MIRRORSYNC_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scheduler section of the application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between dispatcher ticks.
    #[serde(default = "default_tick_interval_seconds")]
    pub tick_interval_seconds: u64,
    /// Whether the cron dispatcher runs at all.
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: default_tick_interval_seconds(),
            enabled: default_scheduler_enabled(),
        }
    }
}

/// Engine tuning section of the application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Milliseconds a single batch may run before it persists and yields.
    #[serde(default = "default_batch_deadline_ms")]
    pub batch_deadline_ms: u64,
    /// Hard ceiling on source keys materialized during delete detection.
    #[serde(default = "default_delete_scan_max_keys")]
    pub delete_scan_max_keys: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_deadline_ms: default_batch_deadline_ms(),
            delete_scan_max_keys: default_delete_scan_max_keys(),
        }
    }
}

/// Application configuration derived from `MIRRORSYNC_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    /// Bearer secret guarding the admin surface.
    #[serde(default)]
    pub admin_api_key: String,
    /// Service-account credential JSON, or a path to a file containing it.
    #[serde(default)]
    pub google_service_account: String,
    /// Base URL of the warehouse REST API.
    #[serde(default = "default_warehouse_base_url")]
    pub warehouse_base_url: String,
    /// Base URL of the spreadsheet REST API.
    #[serde(default = "default_sheets_base_url")]
    pub sheets_base_url: String,
    /// Base URL of the sink (PostgREST-compatible) API.
    #[serde(default)]
    pub sink_url: String,
    /// Service key for the sink API.
    #[serde(default)]
    pub sink_service_key: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            admin_api_key: String::new(),
            google_service_account: String::new(),
            warehouse_base_url: default_warehouse_base_url(),
            sheets_base_url: default_sheets_base_url(),
            sink_url: String::new(),
            sink_service_key: String::new(),
            scheduler: SchedulerConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Returns a redacted JSON representation safe for logs.
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut clone = self.clone();
        if !clone.admin_api_key.is_empty() {
            clone.admin_api_key = "[redacted]".to_string();
        }
        if !clone.sink_service_key.is_empty() {
            clone.sink_service_key = "[redacted]".to_string();
        }
        if !clone.google_service_account.is_empty() {
            clone.google_service_account = "[redacted]".to_string();
        }
        serde_json::to_string_pretty(&clone)
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_database_url() -> String {
    "sqlite://mirrorsync.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_warehouse_base_url() -> String {
    "https://bigquery.googleapis.com".to_string()
}

fn default_sheets_base_url() -> String {
    "https://sheets.googleapis.com".to_string()
}

fn default_tick_interval_seconds() -> u64 {
    60
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_batch_deadline_ms() -> u64 {
    25_000
}

fn default_delete_scan_max_keys() -> usize {
    2_000_000
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
}

/// Environment prefix recognized in both `.env` files and process vars.
const ENV_PREFIX: &str = "MIRRORSYNC_";

/// Loads configuration using layered `.env` files and `MIRRORSYNC_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads configuration from layered env files plus process environment.
    ///
    /// Precedence, lowest to highest: `.env`, `.env.local`, the
    /// profile-specific pair, then process variables.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut layered = BTreeMap::new();

        for name in [".env", ".env.local"] {
            apply_env_file(self.base_dir.join(name), &mut layered)?;
        }

        // The profile decides which extra files participate, so it is
        // resolved before the profile layers load.
        let profile_hint = env::var("MIRRORSYNC_PROFILE")
            .ok()
            .or_else(|| layered.get("PROFILE").cloned())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_profile);

        for name in [
            format!(".env.{profile_hint}"),
            format!(".env.{profile_hint}.local"),
        ] {
            apply_env_file(self.base_dir.join(name), &mut layered)?;
        }

        // Process environment wins over every file layer.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        fn take(layered: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
            layered.remove(key).filter(|v| !v.is_empty())
        }

        let profile = take(&mut layered, "PROFILE").unwrap_or(profile_hint);
        let api_bind_addr =
            take(&mut layered, "API_BIND_ADDR").unwrap_or_else(default_api_bind_addr);
        let log_level = take(&mut layered, "LOG_LEVEL").unwrap_or_else(default_log_level);
        let database_url = take(&mut layered, "DATABASE_URL").unwrap_or_else(default_database_url);
        let db_max_connections = take(&mut layered, "DB_MAX_CONNECTIONS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = take(&mut layered, "DB_ACQUIRE_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_acquire_timeout_ms);
        let admin_api_key = take(&mut layered, "ADMIN_API_KEY").unwrap_or_default();
        let google_service_account =
            take(&mut layered, "GOOGLE_SERVICE_ACCOUNT").unwrap_or_default();
        let warehouse_base_url =
            take(&mut layered, "WAREHOUSE_BASE_URL").unwrap_or_else(default_warehouse_base_url);
        let sheets_base_url =
            take(&mut layered, "SHEETS_BASE_URL").unwrap_or_else(default_sheets_base_url);
        let sink_url = take(&mut layered, "SINK_URL").unwrap_or_default();
        let sink_service_key = take(&mut layered, "SINK_SERVICE_KEY").unwrap_or_default();

        let scheduler = SchedulerConfig {
            tick_interval_seconds: take(&mut layered, "SCHEDULER_TICK_INTERVAL_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_tick_interval_seconds),
            enabled: take(&mut layered, "SCHEDULER_ENABLED")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_scheduler_enabled),
        };

        let engine = EngineConfig {
            batch_deadline_ms: take(&mut layered, "ENGINE_BATCH_DEADLINE_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_batch_deadline_ms),
            delete_scan_max_keys: take(&mut layered, "ENGINE_DELETE_SCAN_MAX_KEYS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_delete_scan_max_keys),
        };

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            admin_api_key,
            google_service_account,
            warehouse_base_url,
            sheets_base_url,
            sink_url,
            sink_service_key,
            scheduler,
            engine,
        };

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Folds one `.env` file into the layered map, keeping only prefixed keys
/// with the prefix stripped. A missing file is not an error.
fn apply_env_file(
    path: PathBuf,
    values: &mut BTreeMap<String, String>,
) -> Result<(), ConfigError> {
    let entries = match dotenvy::from_path_iter(&path) {
        Ok(iter) => iter,
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(());
        }
        Err(source) => return Err(ConfigError::EnvFile { path, source }),
    };

    for entry in entries {
        let (key, value) = entry.map_err(|source| ConfigError::EnvFile {
            path: path.clone(),
            source,
        })?;
        if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
            values.insert(stripped.to_string(), value);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn defaults_apply_without_env_files() {
        let dir = tempdir().unwrap();
        let config = ConfigLoader::with_base_dir(dir.path().to_path_buf())
            .load()
            .unwrap();

        assert_eq!(config.api_bind_addr, "0.0.0.0:8080");
        assert_eq!(config.scheduler.tick_interval_seconds, 60);
        assert_eq!(config.engine.delete_scan_max_keys, 2_000_000);
    }

    #[test]
    fn env_file_values_are_loaded() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(".env"),
            "MIRRORSYNC_ADMIN_API_KEY=topsecret\nMIRRORSYNC_ENGINE_BATCH_DEADLINE_MS=9000\n",
        )
        .unwrap();

        let config = ConfigLoader::with_base_dir(dir.path().to_path_buf())
            .load()
            .unwrap();

        assert_eq!(config.admin_api_key, "topsecret");
        assert_eq!(config.engine.batch_deadline_ms, 9000);
    }

    #[test]
    fn redacted_json_hides_secrets() {
        let config = AppConfig {
            admin_api_key: "topsecret".to_string(),
            sink_service_key: "svc".to_string(),
            ..Default::default()
        };

        let json = config.redacted_json().unwrap();
        assert!(!json.contains("topsecret"));
        assert!(!json.contains("\"svc\""));
    }

    #[test]
    fn invalid_bind_addr_is_rejected() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(".env"),
            "MIRRORSYNC_API_BIND_ADDR=nonsense\n",
        )
        .unwrap();

        let result = ConfigLoader::with_base_dir(dir.path().to_path_buf()).load();
        assert!(matches!(result, Err(ConfigError::InvalidBindAddr { .. })));
    }
}
