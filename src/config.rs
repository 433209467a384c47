//! Configuration module for filehost.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::file::UploadLimits;
use crate::{FileHostError, Result};

const MB: u64 = 1024 * 1024;

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "data/filehost.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Content storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the local storage backend.
    #[serde(default = "default_storage_path")]
    pub path: String,
}

fn default_storage_path() -> String {
    "data/storage".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

/// Upload limits and lifetimes.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadsConfig {
    /// Maximum size of a stored file in megabytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size_mb: u64,
    /// Maximum chunk size a session may declare, in megabytes.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size_mb: u64,
    /// Maximum number of chunks per session.
    #[serde(default = "default_max_chunk_count")]
    pub max_chunk_count: u64,
    /// Lifetime of an upload session when the client does not pick one.
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    /// Lifetime of a stored file when the client does not pick one (0 = never expires).
    #[serde(default = "default_file_ttl")]
    pub default_file_ttl_secs: u64,
}

fn default_max_file_size() -> u64 {
    1024 // 1GB
}

fn default_max_chunk_size() -> u64 {
    64
}

fn default_max_chunk_count() -> u64 {
    10_000
}

fn default_session_ttl() -> u64 {
    86400 // 24 hours
}

fn default_file_ttl() -> u64 {
    7 * 86400 // 7 days
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: default_max_file_size(),
            max_chunk_size_mb: default_max_chunk_size(),
            max_chunk_count: default_max_chunk_count(),
            session_ttl_secs: default_session_ttl(),
            default_file_ttl_secs: default_file_ttl(),
        }
    }
}

impl UploadsConfig {
    /// Limits handed to the file service and upload manager.
    pub fn limits(&self) -> UploadLimits {
        UploadLimits {
            max_file_size: self.max_file_size_mb.saturating_mul(MB),
            max_chunk_size: self.max_chunk_size_mb.saturating_mul(MB),
            max_chunk_count: self.max_chunk_count,
            session_ttl: Duration::from_secs(self.session_ttl_secs),
            default_file_ttl: match self.default_file_ttl_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }
}

/// Expiration sweeper configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SweeperConfig {
    /// Whether the periodic sweep is scheduled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sweep interval in seconds.
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
    /// Maximum expired files and sessions handled per sweep.
    #[serde(default = "default_sweep_batch")]
    pub batch_size: u32,
}

fn default_true() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    3600 // 1 hour
}

fn default_sweep_batch() -> u32 {
    500
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_sweep_interval(),
            batch_size: default_sweep_batch(),
        }
    }
}

/// Storage optimizer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OptimizerConfig {
    /// Whether the periodic optimizer runs are scheduled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Interval between light runs in seconds.
    #[serde(default = "default_light_interval")]
    pub light_interval_secs: u64,
    /// Interval between aggressive runs in seconds.
    #[serde(default = "default_aggressive_interval")]
    pub aggressive_interval_secs: u64,
    /// Unreferenced data younger than this is left alone.
    #[serde(default = "default_safety_margin")]
    pub safety_margin_secs: u64,
    /// Number of stored files re-hashed by each aggressive run.
    #[serde(default = "default_verify_sample")]
    pub verify_sample: u32,
    /// Disk usage (percent) above which the monitor logs a warning.
    #[serde(default = "default_disk_usage_warn")]
    pub disk_usage_warn_percent: f64,
}

fn default_light_interval() -> u64 {
    4 * 3600
}

fn default_aggressive_interval() -> u64 {
    86400
}

fn default_safety_margin() -> u64 {
    3600
}

fn default_verify_sample() -> u32 {
    20
}

fn default_disk_usage_warn() -> f64 {
    90.0
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            light_interval_secs: default_light_interval(),
            aggressive_interval_secs: default_aggressive_interval(),
            safety_margin_secs: default_safety_margin(),
            verify_sample: default_verify_sample(),
            disk_usage_warn_percent: default_disk_usage_warn(),
        }
    }
}

/// Per-client upload quotas.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Whether quotas are enforced.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Upload sessions a client may open per minute.
    #[serde(default = "default_sessions_per_minute")]
    pub sessions_per_minute: u32,
    /// Chunks a client may send per minute.
    #[serde(default = "default_chunks_per_minute")]
    pub chunks_per_minute: u32,
    /// Single-shot uploads a client may make per minute.
    #[serde(default = "default_uploads_per_minute")]
    pub uploads_per_minute: u32,
}

fn default_sessions_per_minute() -> u32 {
    30
}

fn default_chunks_per_minute() -> u32 {
    600
}

fn default_uploads_per_minute() -> u32 {
    30
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sessions_per_minute: default_sessions_per_minute(),
            chunks_per_minute: default_chunks_per_minute(),
            uploads_per_minute: default_uploads_per_minute(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file. Empty disables file output.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/filehost.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Upload limits.
    #[serde(default)]
    pub uploads: UploadsConfig,
    /// Expiration sweeper.
    #[serde(default)]
    pub sweeper: SweeperConfig,
    /// Storage optimizer.
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    /// Upload quotas.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
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
        toml::from_str(s).map_err(|e| FileHostError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `FILEHOST_DATABASE_PATH`: database file
    /// - `FILEHOST_STORAGE_PATH`: storage root
    /// - `FILEHOST_LOG_LEVEL`: log level
    pub fn apply_env_overrides(&mut self) {
        if let Some(path) = env_non_empty("FILEHOST_DATABASE_PATH") {
            self.database.path = path;
        }
        if let Some(path) = env_non_empty("FILEHOST_STORAGE_PATH") {
            self.storage.path = path;
        }
        if let Some(level) = env_non_empty("FILEHOST_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(FileHostError::Config("database.path is empty".to_string()));
        }
        if self.storage.path.trim().is_empty() {
            return Err(FileHostError::Config("storage.path is empty".to_string()));
        }
        if self.uploads.max_file_size_mb == 0 {
            return Err(FileHostError::Config(
                "uploads.max_file_size_mb must be positive".to_string(),
            ));
        }
        if self.uploads.max_chunk_size_mb == 0 || self.uploads.max_chunk_count == 0 {
            return Err(FileHostError::Config(
                "uploads.max_chunk_size_mb and uploads.max_chunk_count must be positive"
                    .to_string(),
            ));
        }
        if self.uploads.session_ttl_secs == 0 {
            return Err(FileHostError::Config(
                "uploads.session_ttl_secs must be positive".to_string(),
            ));
        }
        if self.sweeper.interval_secs == 0 || self.sweeper.batch_size == 0 {
            return Err(FileHostError::Config(
                "sweeper.interval_secs and sweeper.batch_size must be positive".to_string(),
            ));
        }
        if self.optimizer.light_interval_secs == 0 || self.optimizer.aggressive_interval_secs == 0
        {
            return Err(FileHostError::Config(
                "optimizer intervals must be positive".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.optimizer.disk_usage_warn_percent) {
            return Err(FileHostError::Config(
                "optimizer.disk_usage_warn_percent must be between 0 and 100".to_string(),
            ));
        }
        let rl = &self.rate_limit;
        if rl.enabled
            && (rl.sessions_per_minute == 0
                || rl.chunks_per_minute == 0
                || rl.uploads_per_minute == 0)
        {
            return Err(FileHostError::Config(
                "rate limits must be positive when rate_limit.enabled is set".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.database.path, "data/filehost.db");
        assert_eq!(config.storage.path, "data/storage");

        assert_eq!(config.uploads.max_file_size_mb, 1024);
        assert_eq!(config.uploads.max_chunk_size_mb, 64);
        assert_eq!(config.uploads.max_chunk_count, 10_000);
        assert_eq!(config.uploads.session_ttl_secs, 86400);
        assert_eq!(config.uploads.default_file_ttl_secs, 604800);

        assert!(config.sweeper.enabled);
        assert_eq!(config.sweeper.interval_secs, 3600);
        assert_eq!(config.sweeper.batch_size, 500);

        assert!(config.optimizer.enabled);
        assert_eq!(config.optimizer.light_interval_secs, 14400);
        assert_eq!(config.optimizer.aggressive_interval_secs, 86400);
        assert_eq!(config.optimizer.safety_margin_secs, 3600);
        assert_eq!(config.optimizer.verify_sample, 20);

        assert!(config.rate_limit.enabled);
        assert_eq!(config.rate_limit.chunks_per_minute, 600);

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.file, "logs/filehost.log");

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[database]
path = "custom/meta.db"

[storage]
path = "custom/blobs"

[uploads]
max_file_size_mb = 50
max_chunk_size_mb = 8
max_chunk_count = 100
session_ttl_secs = 600
default_file_ttl_secs = 0

[sweeper]
enabled = false
interval_secs = 60
batch_size = 10

[optimizer]
enabled = true
light_interval_secs = 300
aggressive_interval_secs = 3600
safety_margin_secs = 120
verify_sample = 5
disk_usage_warn_percent = 75.5

[rate_limit]
enabled = false
sessions_per_minute = 1
chunks_per_minute = 2
uploads_per_minute = 3

[logging]
level = "debug"
file = "custom/logs/app.log"
"#;

        let config = Config::parse(toml).unwrap();

        assert_eq!(config.database.path, "custom/meta.db");
        assert_eq!(config.storage.path, "custom/blobs");

        assert_eq!(config.uploads.max_file_size_mb, 50);
        assert_eq!(config.uploads.max_chunk_size_mb, 8);
        assert_eq!(config.uploads.max_chunk_count, 100);
        assert_eq!(config.uploads.session_ttl_secs, 600);
        assert_eq!(config.uploads.default_file_ttl_secs, 0);

        assert!(!config.sweeper.enabled);
        assert_eq!(config.sweeper.interval_secs, 60);
        assert_eq!(config.sweeper.batch_size, 10);

        assert_eq!(config.optimizer.light_interval_secs, 300);
        assert_eq!(config.optimizer.safety_margin_secs, 120);
        assert_eq!(config.optimizer.verify_sample, 5);
        assert!((config.optimizer.disk_usage_warn_percent - 75.5).abs() < f64::EPSILON);

        assert!(!config.rate_limit.enabled);
        assert_eq!(config.rate_limit.uploads_per_minute, 3);

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.file, "custom/logs/app.log");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[uploads]
max_chunk_count = 42

[sweeper]
batch_size = 7
"#;

        let config = Config::parse(toml).unwrap();

        assert_eq!(config.uploads.max_chunk_count, 42);
        assert_eq!(config.sweeper.batch_size, 7);

        // Untouched values fall back to defaults
        assert_eq!(config.uploads.max_file_size_mb, 1024);
        assert!(config.sweeper.enabled);
        assert_eq!(config.database.path, "data/filehost.db");
    }

    #[test]
    fn test_parse_empty_config() {
        let config = Config::parse("").unwrap();

        assert_eq!(config.storage.path, "data/storage");
        assert_eq!(config.sweeper.interval_secs, 3600);
    }

    #[test]
    fn test_parse_invalid_config() {
        let result = Config::parse("this is not valid toml [[[");

        match result {
            Err(FileHostError::Config(msg)) => assert!(msg.contains("config parse error")),
            other => panic!("Expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = Config::load("nonexistent.toml");
        assert!(matches!(result, Err(FileHostError::Io(_))));
    }

    #[test]
    fn test_limits_conversion() {
        let mut uploads = UploadsConfig {
            max_file_size_mb: 2,
            max_chunk_size_mb: 1,
            ..UploadsConfig::default()
        };
        let limits = uploads.limits();
        assert_eq!(limits.max_file_size, 2 * 1024 * 1024);
        assert_eq!(limits.max_chunk_size, 1024 * 1024);
        assert_eq!(limits.session_ttl, Duration::from_secs(86400));
        assert_eq!(limits.default_file_ttl, Some(Duration::from_secs(604800)));

        uploads.default_file_ttl_secs = 0;
        assert_eq!(uploads.limits().default_file_ttl, None);
    }

    #[test]
    fn test_apply_env_overrides_paths() {
        let original_db = std::env::var("FILEHOST_DATABASE_PATH").ok();
        let original_storage = std::env::var("FILEHOST_STORAGE_PATH").ok();

        std::env::set_var("FILEHOST_DATABASE_PATH", "/var/lib/filehost/meta.db");
        std::env::set_var("FILEHOST_STORAGE_PATH", "   ");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.database.path, "/var/lib/filehost/meta.db");
        // Blank values are ignored
        assert_eq!(config.storage.path, "data/storage");

        match original_db {
            Some(val) => std::env::set_var("FILEHOST_DATABASE_PATH", val),
            None => std::env::remove_var("FILEHOST_DATABASE_PATH"),
        }
        match original_storage {
            Some(val) => std::env::set_var("FILEHOST_STORAGE_PATH", val),
            None => std::env::remove_var("FILEHOST_STORAGE_PATH"),
        }
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = Config::default();
        config.uploads.max_chunk_count = 0;
        assert!(matches!(config.validate(), Err(FileHostError::Config(_))));

        let mut config = Config::default();
        config.sweeper.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.optimizer.disk_usage_warn_percent = 120.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rate_limit_disabled_allows_zero() {
        let mut config = Config::default();
        config.rate_limit.enabled = false;
        config.rate_limit.chunks_per_minute = 0;
        assert!(config.validate().is_ok());

        config.rate_limit.enabled = true;
        assert!(config.validate().is_err());
    }
}
