//! Subscriber pool
//!
//! Tracks every live subscriber so shutdown can disconnect them before the
//! shard connections go away.

use crate::metrics;
use crate::shard::CommandConnection;
use crate::subscriber::connection::{SubscriberConnection, SubscriberLink, SubscriberSet};

use std::sync::Arc;
use tracing::debug;

/// Set of subscriber connections seeded from the global shard
#[derive(Default)]
pub struct SubscriberPool {
    links: Arc<SubscriberSet>,
}

impl SubscriberPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Duplicate `global` into a new tracked subscriber
    ///
    /// The socket is dialled lazily on the first subscribe or receive.
    pub(crate) fn acquire(&self, global: &CommandConnection) -> SubscriberConnection {
        let link = Arc::new(SubscriberLink::new(
            global.duplicate_client(),
            Arc::downgrade(&self.links),
        ));
        self.links.insert(link.id(), Arc::clone(&link));
        metrics::set_subscribers_active(self.links.len());

        debug!(subscriber_id = %link.id(), active = self.links.len(), "Redis subscriber created");
        SubscriberConnection::new(link)
    }

    /// Number of tracked subscribers
    pub fn count(&self) -> usize {
        self.links.len()
    }

    /// Remove and return every tracked subscriber
    pub(crate) fn drain(&self) -> Vec<Arc<SubscriberLink>> {
        let ids: Vec<_> = self.links.iter().map(|entry| *entry.key()).collect();
        let drained: Vec<_> = ids
            .into_iter()
            .filter_map(|id| self.links.remove(&id).map(|(_, link)| link))
            .collect();
        metrics::set_subscribers_active(self.links.len());
        drained
    }
}
