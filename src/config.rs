//! Configuration types.
//!
//! The same [`StoreConfig`] drives the live engine and the migration tool so
//! operators can point both at one target.

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;
use crate::store::schema::validate_schema_name;

/// Which relational backend to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Postgres,
    #[serde(alias = "sqlite")]
    Libsql,
}

impl std::str::FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Backend::Postgres),
            "libsql" | "sqlite" => Ok(Backend::Libsql),
            other => Err(ConfigError::InvalidValue {
                key: "backend".into(),
                message: format!("unknown backend '{other}' (expected postgres or libsql)"),
            }),
        }
    }
}

/// Backoff settings for transient database failures.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

/// Connection and behavior settings for a state store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    #[serde(alias = "type")]
    pub backend: Backend,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(deserialize_with = "deserialize_secret")]
    pub password: SecretString,
    /// Tenancy boundary. Every table lives under this name.
    pub schema: String,
    /// Full connection URL. Takes precedence over the discrete fields.
    pub url: Option<String>,
    /// Database file for the libSQL backend (`:memory:` for a throwaway one).
    pub path: PathBuf,
    /// Treat empty values as "nothing to write".
    pub skip_null: bool,
    /// Track `created_at` / `updated_at` on every row.
    pub timestamp: bool,
    /// Buffer writes in memory until `flush()`.
    pub on_flush: bool,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub operation_timeout_secs: Option<u64>,
    pub retry: RetryConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Postgres,
            host: "localhost".to_string(),
            port: 5432,
            database: "telegres".to_string(),
            username: "telegres".to_string(),
            password: SecretString::from("password123"),
            schema: "default_schema".to_string(),
            url: None,
            path: PathBuf::from("./data/chatstate.db"),
            skip_null: false,
            timestamp: true,
            on_flush: false,
            max_connections: 5,
            acquire_timeout_secs: 30,
            operation_timeout_secs: None,
            retry: RetryConfig::default(),
        }
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(SecretString::from(raw))
}

/// On-disk layout of the migration tool's config file.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    database: StoreConfig,
}

impl StoreConfig {
    /// Build a config from `CHATSTATE_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`StoreConfig::from_env`] but reading from an arbitrary source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(backend) = lookup("CHATSTATE_BACKEND") {
            config.backend = backend.parse()?;
        }
        if let Some(host) = lookup("CHATSTATE_PG_HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("CHATSTATE_PG_PORT") {
            config.port = parse_value("CHATSTATE_PG_PORT", &port)?;
        }
        if let Some(database) = lookup("CHATSTATE_PG_DATABASE") {
            config.database = database;
        }
        if let Some(username) = lookup("CHATSTATE_PG_USERNAME") {
            config.username = username;
        }
        if let Some(password) = lookup("CHATSTATE_PG_PASSWORD") {
            config.password = SecretString::from(password);
        }
        if let Some(schema) = lookup("CHATSTATE_SCHEMA") {
            config.schema = schema;
        }
        config.url = lookup("CHATSTATE_DATABASE_URL").filter(|u| !u.is_empty());
        if let Some(path) = lookup("CHATSTATE_DB_PATH") {
            config.path = PathBuf::from(path);
        }
        if let Some(v) = lookup("CHATSTATE_SKIP_NULL") {
            config.skip_null = parse_bool("CHATSTATE_SKIP_NULL", &v)?;
        }
        if let Some(v) = lookup("CHATSTATE_TIMESTAMP") {
            config.timestamp = parse_bool("CHATSTATE_TIMESTAMP", &v)?;
        }
        if let Some(v) = lookup("CHATSTATE_ON_FLUSH") {
            config.on_flush = parse_bool("CHATSTATE_ON_FLUSH", &v)?;
        }
        if let Some(v) = lookup("CHATSTATE_MAX_CONNECTIONS") {
            config.max_connections = parse_value("CHATSTATE_MAX_CONNECTIONS", &v)?;
        }
        if let Some(v) = lookup("CHATSTATE_OPERATION_TIMEOUT_SECS") {
            config.operation_timeout_secs =
                Some(parse_value("CHATSTATE_OPERATION_TIMEOUT_SECS", &v)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load the `{"database": {...}}` JSON file used by the migration tool.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::MissingRequired {
                key: "config".into(),
                hint: format!("config file {} not found", path.display()),
            });
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile =
            serde_json::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        file.database.validate()?;
        Ok(file.database)
    }

    /// Reject settings no backend could work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_schema_name(&self.schema).map_err(|e| ConfigError::InvalidValue {
            key: "schema".into(),
            message: e.to_string(),
        })?;
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "retry.max_attempts".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_connections".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.backend == Backend::Postgres && self.url.is_none() && self.port == 0 {
            return Err(ConfigError::InvalidValue {
                key: "port".into(),
                message: "must be non-zero".into(),
            });
        }
        Ok(())
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_secs.map(Duration::from_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got '{other}'"),
        }),
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}
