//! Prometheus metrics module
//!
//! Recording goes through the `metrics` facade, so the free functions below
//! are no-ops until the binary installs the Prometheus recorder via
//! [`PoolMetrics::install`].

use crate::error::PoolError;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Duration;

/// Pool metrics exporter
#[derive(Clone)]
pub struct PoolMetrics {
    handle: Arc<PrometheusHandle>,
}

impl PoolMetrics {
    /// Install the global Prometheus recorder and return its handle
    pub fn install() -> Result<Self, PoolError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| PoolError::MetricsRecorder(e.to_string()))?;

        Self::register_metrics();

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    fn register_metrics() {
        describe_gauge!(
            "redis_shards_registered",
            Unit::Count,
            "Command connections registered in the shard map"
        );
        describe_gauge!(
            "redis_subscribers_active",
            Unit::Count,
            "Subscriber connections currently tracked"
        );
        describe_counter!(
            "redis_failover_reconnects_total",
            Unit::Count,
            "Reconnect-and-retry cycles triggered by READONLY errors"
        );
        describe_counter!(
            "redis_errors_total",
            Unit::Count,
            "Redis errors surfaced to callers"
        );
        describe_histogram!(
            "redis_shutdown_duration_seconds",
            Unit::Seconds,
            "Time spent draining subscribers and closing shards"
        );
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Set the number of registered shard connections
pub fn set_shards_registered(count: usize) {
    gauge!("redis_shards_registered").set(count as f64);
}

/// Set the number of tracked subscriber connections
pub fn set_subscribers_active(count: usize) {
    gauge!("redis_subscribers_active").set(count as f64);
}

/// Record a failover reconnect on a shard
pub fn record_failover_reconnect(shard_id: &str) {
    counter!(
        "redis_failover_reconnects_total",
        "shard_id" => shard_id.to_string()
    )
    .increment(1);
}

/// Record an error surfaced to a caller
pub fn record_error(shard_id: &str, error_type: &'static str) {
    counter!(
        "redis_errors_total",
        "shard_id" => shard_id.to_string(),
        "error_type" => error_type
    )
    .increment(1);
}

/// Record how long a shutdown took
pub fn record_shutdown(duration: Duration) {
    histogram!("redis_shutdown_duration_seconds").record(duration.as_secs_f64());
}
