//! Domain error types for the Redis shard pool
//!
//! main.rs is the ONLY module allowed to use anyhow::Result (process boundary).
//! All library code returns Result<T, PoolError>.

use thiserror::Error;
use uuid::Uuid;

/// Redis pool domain errors
///
/// Every variant carries structured context fields for diagnostics.
/// Callers can pattern-match on the variant to tell a lifecycle mistake
/// (`NotInitialized`) apart from a broker failure (`Command`).
///
/// Example log output:
/// ```text
/// PoolError::ConnectionClosed { shard_id: "east" }
/// → "redis connection for shard 'east' is closed"
/// ```
#[derive(Error, Debug)]
pub enum PoolError {
    /// Accessor called before `initialize`, after `shutdown`, or with an
    /// unregistered shard id
    #[error("redis not initialized")]
    NotInitialized,

    /// Command failed after the reconnect policy ran
    #[error("redis command failed on shard '{shard_id}'")]
    Command {
        shard_id: String,
        #[source]
        source: redis::RedisError,
    },

    /// Command issued on a handle that was closed by shutdown
    #[error("redis connection for shard '{shard_id}' is closed")]
    ConnectionClosed { shard_id: String },

    /// Operation on a subscriber that has already ended
    #[error("redis subscriber {subscriber_id} has ended")]
    SubscriberClosed { subscriber_id: Uuid },

    /// Pub/sub connection or subscription command failed
    #[error("redis subscriber {subscriber_id} failed")]
    Subscriber {
        subscriber_id: Uuid,
        #[source]
        source: redis::RedisError,
    },

    /// Configuration error (file, environment variable missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),

    /// Prometheus recorder could not be installed
    #[error("metrics recorder error: {0}")]
    MetricsRecorder(String),
}

impl PoolError {
    /// Returns a static label string suitable for Prometheus metrics.
    ///
    /// Used as the `error_type` label on the `redis_errors_total` counter.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::NotInitialized => "not_initialized",
            Self::Command { .. } => "command",
            Self::ConnectionClosed { .. } => "connection_closed",
            Self::SubscriberClosed { .. } => "subscriber_closed",
            Self::Subscriber { .. } => "subscriber",
            Self::Config(_) => "config",
            Self::MetricsRecorder(_) => "metrics_recorder",
        }
    }
}
