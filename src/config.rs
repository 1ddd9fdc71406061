//! Pool configuration module
//!
//! Loads the global Redis connection parameters plus an optional map of
//! per-shard overrides. Sources, lowest priority first: built-in defaults,
//! an optional config file, then `ARRAKIS_*` environment variables.

use crate::error::PoolError;
use redis::{ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;

/// Environment variable naming the config file (extension optional)
pub const CONFIG_PATH_VAR: &str = "ARRAKIS_CONFIG";

/// Config file looked up when `ARRAKIS_CONFIG` is unset
pub const DEFAULT_CONFIG_PATH: &str = "arrakis";

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Health/metrics HTTP port
    pub http_port: u16,

    /// Connection parameters for the global shard
    pub redis: RedisConnectionConfig,

    /// Non-global shards keyed by shard id
    pub shards: BTreeMap<String, ShardConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            http_port: 9090,
            redis: RedisConnectionConfig::default(),
            shards: BTreeMap::new(),
        }
    }
}

/// Per-shard configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ShardConfig {
    pub redis: RedisConnectionConfig,
}

/// Connection parameters for one Redis instance
///
/// Credentials are passed through to the client untouched.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct RedisConnectionConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for RedisConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            username: None,
            password: None,
        }
    }
}

// Hand-written so the password never reaches a log line.
impl std::fmt::Debug for RedisConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db", &self.db)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl RedisConnectionConfig {
    /// Build the client connection info, rejecting unusable addresses
    pub fn connection_info(&self) -> Result<ConnectionInfo, PoolError> {
        if self.host.trim().is_empty() {
            return Err(PoolError::Config("redis.host must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(PoolError::Config(format!(
                "redis.port must be non-zero for host {}",
                self.host
            )));
        }

        Ok(ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: RedisConnectionInfo {
                db: self.db,
                username: self.username.clone(),
                password: self.password.clone(),
                ..Default::default()
            },
        })
    }
}

impl ServerConfig {
    /// Load configuration from `.env`, the optional config file and the
    /// environment
    ///
    /// Nested keys use `__`, e.g. `ARRAKIS_REDIS__HOST` or
    /// `ARRAKIS_SHARDS__EAST__REDIS__PORT`.
    pub fn load() -> Result<Self, PoolError> {
        dotenvy::dotenv().ok();

        let path = env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        Self::from_source(config::File::with_name(&path).required(false))
    }

    /// Layer `source` under the `ARRAKIS_*` environment and deserialize
    pub fn from_source<S>(source: S) -> Result<Self, PoolError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        config::Config::builder()
            .add_source(source)
            .add_source(
                config::Environment::with_prefix("ARRAKIS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| PoolError::Config(e.to_string()))
    }
}
