//! Subscriber connections
//!
//! A subscriber is duplicated from the global shard's client settings and
//! owns its own pub/sub socket. It can only subscribe, receive and be
//! disconnected; it has no command API and no graceful close, since a
//! socket in subscribe mode cannot complete the `QUIT` handshake.

use crate::error::PoolError;
use crate::metrics;

use dashmap::DashMap;
use futures::StreamExt;
use redis::aio::PubSub;
use redis::{Client, Msg, RedisError, RedisResult};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

pub(crate) type SubscriberSet = DashMap<Uuid, Arc<SubscriberLink>>;

/// State shared between a subscriber handle and the pool tracking it
pub(crate) struct SubscriberLink {
    id: Uuid,
    client: Client,
    pubsub: Mutex<Option<PubSub>>,
    ended: watch::Sender<bool>,
    set: Weak<SubscriberSet>,
}

impl SubscriberLink {
    pub(crate) fn new(client: Client, set: Weak<SubscriberSet>) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            client,
            pubsub: Mutex::new(None),
            ended,
            set,
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    fn is_ended(&self) -> bool {
        *self.ended.borrow()
    }

    /// Mark the connection finished and drop it from the pool
    ///
    /// Safe to call any number of times; only the first call has effect.
    /// If a receive is in flight it observes the signal and releases the
    /// socket itself.
    pub(crate) fn end(&self) {
        if self.ended.send_replace(true) {
            return;
        }

        if let Ok(mut pubsub) = self.pubsub.try_lock() {
            pubsub.take();
        }

        if let Some(set) = self.set.upgrade() {
            set.remove(&self.id);
            metrics::set_subscribers_active(set.len());
        }

        debug!(subscriber_id = %self.id, "Redis subscriber ended");
    }

    /// Lock the pub/sub socket, dialling it on first use
    async fn session(&self) -> Result<MutexGuard<'_, Option<PubSub>>, PoolError> {
        let mut guard = self.pubsub.lock().await;
        if self.is_ended() {
            return Err(self.closed());
        }

        if guard.is_none() {
            let pubsub = self
                .client
                .get_async_pubsub()
                .await
                .map_err(|source| self.failed(source))?;
            debug!(subscriber_id = %self.id, "Redis subscriber connected");

            // Ended while dialling: drop the fresh socket instead of keeping it.
            if self.is_ended() {
                return Err(self.closed());
            }
            *guard = Some(pubsub);
        }

        Ok(guard)
    }

    fn closed(&self) -> PoolError {
        PoolError::SubscriberClosed {
            subscriber_id: self.id,
        }
    }

    fn failed(&self, source: RedisError) -> PoolError {
        PoolError::Subscriber {
            subscriber_id: self.id,
            source,
        }
    }
}

enum Subscription<'a> {
    Subscribe(&'a str),
    Unsubscribe(&'a str),
    PSubscribe(&'a str),
    PUnsubscribe(&'a str),
}

impl Subscription<'_> {
    async fn send(self, pubsub: &mut PubSub) -> RedisResult<()> {
        match self {
            Self::Subscribe(channel) => pubsub.subscribe(channel).await,
            Self::Unsubscribe(channel) => pubsub.unsubscribe(channel).await,
            Self::PSubscribe(pattern) => pubsub.psubscribe(pattern).await,
            Self::PUnsubscribe(pattern) => pubsub.punsubscribe(pattern).await,
        }
    }
}

/// Pub/sub handle duplicated from the global shard
///
/// Dropping the handle disconnects it.
pub struct SubscriberConnection {
    link: Arc<SubscriberLink>,
}

impl SubscriberConnection {
    pub(crate) fn new(link: Arc<SubscriberLink>) -> Self {
        Self { link }
    }

    /// Identifier used in logs and the pool's bookkeeping
    pub fn id(&self) -> Uuid {
        self.link.id
    }

    /// True once disconnected, shut down, or closed by the server
    pub fn is_ended(&self) -> bool {
        self.link.is_ended()
    }

    pub async fn subscribe(&mut self, channel: &str) -> Result<(), PoolError> {
        self.apply(Subscription::Subscribe(channel)).await
    }

    pub async fn unsubscribe(&mut self, channel: &str) -> Result<(), PoolError> {
        self.apply(Subscription::Unsubscribe(channel)).await
    }

    pub async fn psubscribe(&mut self, pattern: &str) -> Result<(), PoolError> {
        self.apply(Subscription::PSubscribe(pattern)).await
    }

    pub async fn punsubscribe(&mut self, pattern: &str) -> Result<(), PoolError> {
        self.apply(Subscription::PUnsubscribe(pattern)).await
    }

    /// Send a subscription change, giving up as soon as the link ends
    ///
    /// A transport failure ends the subscriber; a server error reply does
    /// not.
    async fn apply(&mut self, change: Subscription<'_>) -> Result<(), PoolError> {
        let mut ended = self.link.ended.subscribe();
        let mut guard = self.link.session().await?;
        let pubsub = guard.as_mut().ok_or_else(|| self.link.closed())?;

        let outcome = tokio::select! {
            result = change.send(pubsub) => Some(result),
            _ = ended.wait_for(|done| *done) => None,
        };

        match outcome {
            Some(Ok(())) if !self.link.is_ended() => Ok(()),
            Some(Err(source)) if !self.link.is_ended() => {
                if source.is_io_error() || source.is_connection_dropped() {
                    guard.take();
                    drop(guard);
                    self.link.end();
                }
                Err(self.link.failed(source))
            }
            _ => {
                guard.take();
                drop(guard);
                self.link.end();
                Err(self.link.closed())
            }
        }
    }

    /// Wait for the next published message
    ///
    /// Returns `Ok(None)` once the connection has ended, either because the
    /// server closed it or because the pool was shut down mid-wait.
    pub async fn next_message(&mut self) -> Result<Option<Msg>, PoolError> {
        let mut ended = self.link.ended.subscribe();
        let mut guard = self.link.session().await?;
        let pubsub = guard.as_mut().ok_or_else(|| self.link.closed())?;

        let message = {
            let messages = pubsub.on_message();
            tokio::pin!(messages);
            tokio::select! {
                message = messages.next() => message,
                _ = ended.wait_for(|done| *done) => None,
            }
        };

        match message {
            Some(message) if !self.link.is_ended() => Ok(Some(message)),
            _ => {
                guard.take();
                drop(guard);
                self.link.end();
                Ok(None)
            }
        }
    }

    /// Immediately drop the socket; no reply is awaited
    pub fn disconnect(self) {
        debug!(subscriber_id = %self.link.id, "Disconnecting Redis subscriber");
        // Drop does the work.
    }
}

impl Drop for SubscriberConnection {
    fn drop(&mut self) {
        self.link.end();
    }
}

impl fmt::Debug for SubscriberConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberConnection")
            .field("id", &self.link.id)
            .field("ended", &self.is_ended())
            .finish()
    }
}
