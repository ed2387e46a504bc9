//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use strata_db::PoolConfig;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Token settings, consumed by the auth layer.
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database pool and migration configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite path or `file:` URI.
    #[serde(default = "default_db_url")]
    pub url: String,

    /// Maximum open connections.
    #[serde(default = "default_max_open")]
    pub max_open: u32,

    /// Idle connections kept warm.
    #[serde(default = "default_max_idle")]
    pub max_idle: u32,

    /// Maximum connection lifetime, in seconds.
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,

    /// Idle time before surplus connections close, in seconds.
    #[serde(default = "default_max_idle_time_secs")]
    pub max_idle_time_secs: u64,

    /// Pool checkout timeout, in milliseconds.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// SQLite busy timeout, in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Directory holding `{version}_{name}.up.sql` / `.down.sql` scripts.
    #[serde(default = "default_migrations_path")]
    pub migrations_path: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "strata_db=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Token signing settings.
#[derive(Clone, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for issued tokens.
    #[serde(default)]
    pub jwt_secret: String,

    /// Token lifetime in seconds. Default: 3600 (1 hour).
    #[serde(default = "default_jwt_ttl_secs")]
    pub jwt_ttl_secs: u64,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_db_url() -> String {
    "strata.db".to_string()
}

fn default_max_open() -> u32 {
    10
}

fn default_max_idle() -> u32 {
    5
}

fn default_max_lifetime_secs() -> u64 {
    30 * 60
}

fn default_max_idle_time_secs() -> u64 {
    5 * 60
}

fn default_acquire_timeout_ms() -> u64 {
    10_000
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_migrations_path() -> String {
    "migrations".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_jwt_ttl_secs() -> u64 {
    3600
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_db_url(),
            max_open: default_max_open(),
            max_idle: default_max_idle(),
            max_lifetime_secs: default_max_lifetime_secs(),
            max_idle_time_secs: default_max_idle_time_secs(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            migrations_path: default_migrations_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            jwt_ttl_secs: default_jwt_ttl_secs(),
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &"[REDACTED]")
            .field("jwt_ttl_secs", &self.jwt_ttl_secs)
            .finish()
    }
}

impl DatabaseConfig {
    /// Converts to the pool settings consumed by `strata-db`.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            url: self.url.clone(),
            max_open: self.max_open,
            max_idle: self.max_idle,
            max_lifetime: Duration::from_secs(self.max_lifetime_secs),
            max_idle_time: Duration::from_secs(self.max_idle_time_secs),
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
        }
    }
}

impl Config {
    /// Checks cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.database
            .pool_config()
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("database: {e}")))?;
        if self.database.migrations_path.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "database: migrations_path must not be empty".into(),
            ));
        }
        if self.auth.jwt_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "auth: jwt_ttl_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration violates an invariant.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Loads configuration from a TOML file, falling back to defaults, then
/// applies environment overrides and validates the result.
///
/// Environment variable overrides:
/// - `STRATA_HOST` overrides `server.host`
/// - `STRATA_PORT` overrides `server.port`
/// - `STRATA_DATABASE_URL` overrides `database.url`
/// - `STRATA_DB_MAX_OPEN` overrides `database.max_open`
/// - `STRATA_DB_MAX_IDLE` overrides `database.max_idle`
/// - `STRATA_MIGRATIONS_PATH` overrides `database.migrations_path`
/// - `STRATA_LOG_LEVEL` overrides `logging.level`
/// - `STRATA_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `STRATA_JWT_SECRET` overrides `auth.jwt_secret`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed,
/// or if the merged configuration is invalid.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(host) = var("STRATA_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = var("STRATA_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(url) = var("STRATA_DATABASE_URL") {
        config.database.url = url;
    }
    if let Some(max_open) = var("STRATA_DB_MAX_OPEN") {
        if let Ok(parsed) = max_open.parse() {
            config.database.max_open = parsed;
        }
    }
    if let Some(max_idle) = var("STRATA_DB_MAX_IDLE") {
        if let Ok(parsed) = max_idle.parse() {
            config.database.max_idle = parsed;
        }
    }
    if let Some(path) = var("STRATA_MIGRATIONS_PATH") {
        config.database.migrations_path = path;
    }
    if let Some(level) = var("STRATA_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("STRATA_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(secret) = var("STRATA_JWT_SECRET") {
        config.auth.jwt_secret = secret;
    }
}
