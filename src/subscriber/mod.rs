//! Pub/sub subscriber management
//!
//! Subscribers are always duplicated from the global shard and torn down
//! with an immediate disconnect.

mod connection;
mod pool;

pub use connection::SubscriberConnection;
pub(crate) use connection::SubscriberLink;
pub use pool::SubscriberPool;
