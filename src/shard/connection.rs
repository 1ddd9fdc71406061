//! Command connections and the factory that builds them
//!
//! A [`CommandConnection`] is cheap to clone; every clone shares one
//! multiplexed socket, opened on the first command. Graceful close is
//! crate-private so that only the registry that created a handle can
//! retire it.

use crate::config::RedisConnectionConfig;
use crate::error::PoolError;
use crate::metrics;
use crate::shard::policy::{AttemptError, ReconnectPolicy};

use redis::aio::MultiplexedConnection;
use redis::{Client, Cmd, FromRedisValue, RedisResult, ToRedisArgs};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// Builds command connections with the reconnect policy attached
#[derive(Debug, Clone, Default)]
pub struct ConnectionFactory {
    policy: ReconnectPolicy,
}

impl ConnectionFactory {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy }
    }

    /// Build a handle for `shard_id`
    ///
    /// No I/O happens here; the socket is dialled on first use.
    pub fn build(
        &self,
        shard_id: &str,
        config: &RedisConnectionConfig,
    ) -> Result<CommandConnection, PoolError> {
        let info = config.connection_info()?;
        let client = Client::open(info).map_err(|e| {
            PoolError::Config(format!("invalid redis settings for shard '{shard_id}': {e}"))
        })?;

        debug!(shard_id, host = %config.host, port = config.port, "Built Redis command connection");

        Ok(CommandConnection {
            inner: Arc::new(CommandInner {
                shard_id: shard_id.to_string(),
                client,
                policy: self.policy,
                link: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        })
    }
}

/// Request/response handle to one shard
#[derive(Clone)]
pub struct CommandConnection {
    inner: Arc<CommandInner>,
}

struct CommandInner {
    shard_id: String,
    client: Client,
    policy: ReconnectPolicy,
    link: Mutex<Option<MultiplexedConnection>>,
    closed: AtomicBool,
}

impl CommandInner {
    fn cached(&self) -> Option<MultiplexedConnection> {
        self.link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_link(&self) -> Option<MultiplexedConnection> {
        self.link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Current connection, dialling one if none is cached
    async fn link(&self) -> Result<MultiplexedConnection, AttemptError> {
        if self.is_closed() {
            return Err(AttemptError::Closed);
        }
        if let Some(conn) = self.cached() {
            return Ok(conn);
        }

        let conn = self.client.get_multiplexed_async_connection().await?;

        // `close` may have run while dialling. It sets the flag before taking
        // the slot, so checking under the slot lock cannot miss it.
        let mut slot = self.link.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            drop(slot);
            drop(conn);
            debug!(shard_id = %self.shard_id, "Dropped Redis connection dialled after close");
            return Err(AttemptError::Closed);
        }
        debug!(shard_id = %self.shard_id, "Redis connection established");

        // A concurrent caller may have won the race; keep whichever landed first.
        Ok(slot.get_or_insert(conn).clone())
    }

    fn reset_link(&self) {
        if self.take_link().is_some() {
            debug!(shard_id = %self.shard_id, "Discarded Redis connection");
        }
    }
}

impl CommandConnection {
    /// Shard this handle belongs to
    pub fn shard_id(&self) -> &str {
        &self.inner.shard_id
    }

    /// True once the registry has closed this handle
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// True if both handles share the same underlying connection
    pub fn same_connection(&self, other: &CommandConnection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Execute a command, applying the reconnect policy on failure
    pub async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T, PoolError> {
        let inner = &*self.inner;
        let closed = || PoolError::ConnectionClosed {
            shard_id: inner.shard_id.clone(),
        };
        if inner.is_closed() {
            return Err(closed());
        }

        let result = inner
            .policy
            .run(
                &inner.shard_id,
                move || async move {
                    let mut conn = inner.link().await?;
                    let value: T = cmd.query_async(&mut conn).await?;
                    Ok::<T, AttemptError>(value)
                },
                || inner.reset_link(),
            )
            .await;

        result.map_err(|error| match error {
            AttemptError::Closed => closed(),
            AttemptError::Redis(source) => {
                if source.is_io_error() || source.is_connection_dropped() {
                    inner.reset_link();
                }
                let err = PoolError::Command {
                    shard_id: inner.shard_id.clone(),
                    source,
                };
                metrics::record_error(&inner.shard_id, err.error_type_label());
                err
            }
        })
    }

    /// Publish `payload` on `channel`, returning the number of receivers
    pub async fn publish<P: ToRedisArgs>(&self, channel: &str, payload: P) -> Result<i64, PoolError> {
        let mut cmd = redis::cmd("PUBLISH");
        cmd.arg(channel).arg(payload);
        self.query(&cmd).await
    }

    /// Round-trip a `PING`
    pub async fn ping(&self) -> Result<(), PoolError> {
        let _: String = self.query(&redis::cmd("PING")).await?;
        Ok(())
    }

    /// Client settings for a subscriber duplicated from this handle
    pub(crate) fn duplicate_client(&self) -> Client {
        self.inner.client.clone()
    }

    /// Graceful close: `QUIT` on an established connection, then mark closed
    ///
    /// Closing twice is a no-op. A handle that never dialled closes without
    /// I/O.
    pub(crate) async fn close(&self) -> Result<(), PoolError> {
        let inner = &*self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let Some(mut conn) = inner.take_link() else {
            debug!(shard_id = %inner.shard_id, "Closed idle Redis connection");
            return Ok(());
        };

        let quit: RedisResult<()> = redis::cmd("QUIT").query_async(&mut conn).await;
        quit.map_err(|source| PoolError::Command {
            shard_id: inner.shard_id.clone(),
            source,
        })?;

        info!(shard_id = %inner.shard_id, "Closed Redis connection");
        Ok(())
    }
}

impl fmt::Debug for CommandConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandConnection")
            .field("shard_id", &self.inner.shard_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
