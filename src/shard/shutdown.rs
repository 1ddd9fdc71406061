//! Ordered teardown of captured registry state
//!
//! Phase 1 ends every subscriber, phase 2 closes every command connection
//! concurrently, phase 3 waits out [`SHUTDOWN_GRACE_PERIOD`] so sockets
//! finish flushing before the process exits.

use crate::metrics;
use crate::shard::CommandConnection;
use crate::subscriber::SubscriberLink;

use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Fixed delay after all closes settle
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_millis(100);

/// State captured from the registry at shutdown
pub(crate) struct ShutdownCoordinator {
    commands: Vec<CommandConnection>,
    subscribers: Vec<Arc<SubscriberLink>>,
}

impl ShutdownCoordinator {
    pub(crate) fn new(commands: Vec<CommandConnection>, subscribers: Vec<Arc<SubscriberLink>>) -> Self {
        Self {
            commands,
            subscribers,
        }
    }

    pub(crate) async fn run(self) {
        let start = Instant::now();
        info!(
            shards = self.commands.len(),
            subscribers = self.subscribers.len(),
            "Shutting down Redis connections"
        );

        for subscriber in &self.subscribers {
            subscriber.end();
        }
        debug!(count = self.subscribers.len(), "Redis subscribers disconnected");

        let closes = self.commands.iter().map(|conn| async move {
            if let Err(e) = conn.close().await {
                warn!(shard_id = conn.shard_id(), error = %e, "Redis connection did not close cleanly");
            }
        });
        join_all(closes).await;

        tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;

        metrics::record_shutdown(start.elapsed());
        info!(elapsed_ms = start.elapsed().as_millis() as u64, "Redis connections shut down");
    }
}
