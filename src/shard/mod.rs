//! Shard connection management
//!
//! Command connections per shard, the failover reconnect policy, and the
//! registry that owns their lifecycle.

mod connection;
mod policy;
mod registry;
mod shutdown;

pub use connection::{CommandConnection, ConnectionFactory};
pub use policy::{
    failure_text, ReconnectDecision, ReconnectPolicy, FAILOVER_RETRY_LIMIT, READONLY_MARKER,
};
pub use registry::{ShardRegistry, GLOBAL_SHARD_ID, PLACEHOLDER_SHARD_PREFIX};
pub use shutdown::SHUTDOWN_GRACE_PERIOD;
