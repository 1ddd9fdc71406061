//! Arrakis Redis - sharded Redis connection pool
//!
//! - One command connection per configured shard, plus the implicit
//!   `global` shard
//! - Failover-aware reconnect policy on every command connection
//! - Pub/sub subscribers duplicated from the global shard
//! - Ordered shutdown: subscribers first, then graceful shard closes
//!
//! ```rust,ignore
//! let registry = Arc::new(ShardRegistry::new());
//! registry.initialize(&ServerConfig::load()?)?;
//!
//! let global = registry.acquire_shard_connection(None)?;
//! global.publish("events", "hello").await?;
//!
//! let mut subscriber = registry.acquire_subscriber_connection()?;
//! subscriber.subscribe("events").await?;
//!
//! registry.shutdown().await;
//! ```

pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod shard;
pub mod subscriber;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{RedisConnectionConfig, ServerConfig, ShardConfig};
pub use error::PoolError;
pub use shard::{
    CommandConnection, ConnectionFactory, ReconnectDecision, ReconnectPolicy, ShardRegistry,
    GLOBAL_SHARD_ID,
};
pub use subscriber::{SubscriberConnection, SubscriberPool};
