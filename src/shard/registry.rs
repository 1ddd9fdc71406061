//! Shard registry
//!
//! Owns the shard id → command connection map, the subscriber pool seeded
//! from the global shard, and the lifecycle tying them together:
//! `Uninitialized → Initialized → Closed → Initialized`.

use crate::config::ServerConfig;
use crate::error::PoolError;
use crate::metrics;
use crate::shard::connection::{CommandConnection, ConnectionFactory};
use crate::shard::shutdown::ShutdownCoordinator;
use crate::subscriber::{SubscriberConnection, SubscriberPool};

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

/// Reserved id of the default shard
pub const GLOBAL_SHARD_ID: &str = "global";

/// Prefix of placeholder ids used by callers that are not shard-aware yet;
/// they resolve to the global shard.
pub const PLACEHOLDER_SHARD_PREFIX: &str = "TODO";

/// Registry of Redis connections for one process
///
/// Construct once, share behind an `Arc`.
#[derive(Default)]
pub struct ShardRegistry {
    shards: RwLock<HashMap<String, CommandConnection>>,
    subscribers: SubscriberPool,
    factory: ConnectionFactory,
}

impl ShardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_factory(factory: ConnectionFactory) -> Self {
        Self {
            factory,
            ..Self::default()
        }
    }

    fn read_shards(&self) -> RwLockReadGuard<'_, HashMap<String, CommandConnection>> {
        self.shards.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_shards(&self) -> RwLockWriteGuard<'_, HashMap<String, CommandConnection>> {
        self.shards.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build the global connection plus one per configured shard
    ///
    /// Every handle is built before any is registered, so a bad shard entry
    /// leaves the registry as it was. Re-initializing without `shutdown`
    /// replaces existing handles without closing them.
    pub fn initialize(&self, config: &ServerConfig) -> Result<(), PoolError> {
        let mut built = HashMap::with_capacity(config.shards.len() + 1);
        built.insert(
            GLOBAL_SHARD_ID.to_string(),
            self.factory.build(GLOBAL_SHARD_ID, &config.redis)?,
        );

        for (shard_id, shard) in &config.shards {
            if shard_id == GLOBAL_SHARD_ID {
                continue;
            }
            built.insert(shard_id.clone(), self.factory.build(shard_id, &shard.redis)?);
        }

        let mut shards = self.write_shards();
        if !shards.is_empty() {
            warn!(
                existing = shards.len(),
                "Redis re-initialized without shutdown; replaced connections stay open"
            );
        }
        shards.extend(built);
        metrics::set_shards_registered(shards.len());

        info!(
            shard_count = shards.len(),
            host = %config.redis.host,
            port = config.redis.port,
            "Redis shards initialized"
        );
        Ok(())
    }

    /// Handle for `shard_id`; `None` or a placeholder id means the global
    /// shard
    pub fn acquire_shard_connection(&self, shard_id: Option<&str>) -> Result<CommandConnection, PoolError> {
        let shard_id = resolve_shard_id(shard_id);
        self.read_shards().get(shard_id).cloned().ok_or_else(|| {
            debug!(shard_id, "Redis shard not registered");
            PoolError::NotInitialized
        })
    }

    /// New subscriber duplicated from the global shard
    pub fn acquire_subscriber_connection(&self) -> Result<SubscriberConnection, PoolError> {
        // Held across the insert so shutdown cannot capture in between.
        let shards = self.read_shards();
        let global = shards.get(GLOBAL_SHARD_ID).ok_or(PoolError::NotInitialized)?;
        Ok(self.subscribers.acquire(global))
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.count()
    }

    pub fn shard_count(&self) -> usize {
        self.read_shards().len()
    }

    /// Registered shard ids, sorted
    pub fn shard_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.read_shards().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_initialized(&self) -> bool {
        self.read_shards().contains_key(GLOBAL_SHARD_ID)
    }

    /// Disconnect subscribers, gracefully close every shard, then wait out
    /// the grace period
    ///
    /// A second call finds nothing to tear down and returns immediately.
    pub async fn shutdown(&self) {
        let coordinator = {
            let mut shards = self.write_shards();
            let captured = std::mem::take(&mut *shards);
            metrics::set_shards_registered(0);

            if !captured.contains_key(GLOBAL_SHARD_ID) {
                None
            } else {
                let subscribers = self.subscribers.drain();
                Some(ShutdownCoordinator::new(captured.into_values().collect(), subscribers))
            }
        };

        match coordinator {
            Some(coordinator) => coordinator.run().await,
            None => debug!("Redis already shut down"),
        }
    }
}

fn resolve_shard_id(shard_id: Option<&str>) -> &str {
    match shard_id {
        Some(id) if !id.starts_with(PLACEHOLDER_SHARD_PREFIX) => id,
        _ => GLOBAL_SHARD_ID,
    }
}
