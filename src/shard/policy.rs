//! Reconnect policy for command connections
//!
//! During a primary/replica failover, connections pinned to the demoted
//! node start answering writes with `READONLY`. Those errors clear up once
//! the client reconnects, so they are retried. Everything else (auth
//! failures, resets, partitions) is logged and handed back to the caller.

use crate::metrics;

use redis::RedisError;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Error text marking a transient read-only replica
pub const READONLY_MARKER: &str = "READONLY";

/// Maximum reconnect-and-retry cycles for one command
pub const FAILOVER_RETRY_LIMIT: u32 = 3;

const BACKOFF_STEP: Duration = Duration::from_millis(50);
const BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Outcome of the error handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Drop the connection, reconnect and resend the in-flight command
    ReconnectAndRetry,
    /// Surface the error to the caller and keep the connection
    DoNotReconnect,
}

/// Why a single attempt failed
///
/// `Closed` means the handle was retired; it is never retried or logged.
#[derive(Debug)]
pub(crate) enum AttemptError {
    Closed,
    Redis(RedisError),
}

impl From<RedisError> for AttemptError {
    fn from(error: RedisError) -> Self {
        Self::Redis(error)
    }
}

/// Error handler attached to every command connection
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: FAILOVER_RETRY_LIMIT,
        }
    }
}

impl ReconnectPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Classify an error seen on `shard_id`
    ///
    /// Matches on error text rather than `ErrorKind` so that proxies which
    /// rewrap the server reply are still recognised.
    pub fn on_error(&self, shard_id: &str, error: &RedisError) -> ReconnectDecision {
        let text = failure_text(error);
        if text.contains(READONLY_MARKER) {
            info!(shard_id, error = %text, "Redis instance is read-only, reconnecting");
            return ReconnectDecision::ReconnectAndRetry;
        }

        warn!(shard_id, error = %text, "Unhandled Redis error");
        ReconnectDecision::DoNotReconnect
    }

    /// Run `attempt` until it succeeds, the policy refuses, or the retry
    /// ceiling is hit
    ///
    /// `reconnect` discards the cached connection so the next attempt
    /// dials a fresh one.
    pub(crate) async fn run<T, F, Fut>(
        &self,
        shard_id: &str,
        mut attempt: F,
        mut reconnect: impl FnMut(),
    ) -> Result<T, AttemptError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let mut retries = 0;
        loop {
            let error = match attempt().await {
                Ok(value) => return Ok(value),
                Err(AttemptError::Closed) => return Err(AttemptError::Closed),
                Err(AttemptError::Redis(error)) => error,
            };

            if self.on_error(shard_id, &error) == ReconnectDecision::DoNotReconnect {
                return Err(error.into());
            }
            if retries >= self.max_retries {
                warn!(shard_id, retries, error = %error, "Redis failover retries exhausted");
                return Err(error.into());
            }

            retries += 1;
            reconnect();
            metrics::record_failover_reconnect(shard_id);
            tokio::time::sleep(backoff(retries)).await;
        }
    }
}

/// Linear backoff between reconnects
fn backoff(retries: u32) -> Duration {
    BACKOFF_STEP.saturating_mul(retries).min(BACKOFF_MAX)
}

/// Error text including the server error code
///
/// The client's `Display` renders known codes as an `ErrorKind` name, so
/// the raw code is prepended to keep `READONLY` visible.
pub fn failure_text(error: &RedisError) -> String {
    match error.code() {
        Some(code) => format!("{code} {error}"),
        None => error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::ErrorKind;
    use std::fmt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tracing::field::{Field, Visit};
    use tracing::Level;
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    /// Records the `error` field of every WARN event
    struct WarnRecorder {
        warnings: Arc<Mutex<Vec<String>>>,
    }

    #[derive(Default)]
    struct ErrorField(Option<String>);

    impl Visit for ErrorField {
        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            if field.name() == "error" {
                self.0 = Some(format!("{value:?}"));
            }
        }
    }

    impl<S: tracing::Subscriber> Layer<S> for WarnRecorder {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == Level::WARN {
                let mut field = ErrorField::default();
                event.record(&mut field);
                self.warnings
                    .lock()
                    .unwrap()
                    .push(field.0.unwrap_or_default());
            }
        }
    }

    fn capture_warnings<R>(f: impl FnOnce() -> R) -> (R, Vec<String>) {
        let warnings = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(WarnRecorder {
            warnings: Arc::clone(&warnings),
        });
        let result = tracing::subscriber::with_default(subscriber, f);
        let warnings = warnings.lock().unwrap().clone();
        (result, warnings)
    }

    fn readonly_error() -> RedisError {
        RedisError::from((
            ErrorKind::ReadOnly,
            "An error was signalled by the server",
            "You can't write against a read only replica.".to_string(),
        ))
    }

    fn reset_error() -> RedisError {
        RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "read ECONNRESET",
        ))
    }

    #[test]
    fn readonly_server_reply_triggers_reconnect() {
        let policy = ReconnectPolicy::new();
        let (decision, warnings) = capture_warnings(|| policy.on_error("global", &readonly_error()));

        assert_eq!(decision, ReconnectDecision::ReconnectAndRetry);
        assert!(warnings.is_empty(), "failover errors are expected, not warned");
    }

    #[test]
    fn readonly_text_in_message_triggers_reconnect() {
        let policy = ReconnectPolicy::new();
        let error = RedisError::from((
            ErrorKind::ResponseError,
            "READONLY You can't write against a read only replica.",
        ));

        assert_eq!(policy.on_error("east", &error), ReconnectDecision::ReconnectAndRetry);
    }

    #[test]
    fn unrelated_error_logs_one_warning_and_does_not_reconnect() {
        let policy = ReconnectPolicy::new();
        let (decision, warnings) = capture_warnings(|| policy.on_error("global", &reset_error()));

        assert_eq!(decision, ReconnectDecision::DoNotReconnect);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("ECONNRESET"), "warning carries the error: {warnings:?}");
    }

    #[test]
    fn failure_text_keeps_server_code() {
        assert!(failure_text(&readonly_error()).starts_with(READONLY_MARKER));
        assert!(!failure_text(&reset_error()).contains(READONLY_MARKER));
    }

    #[test]
    fn backoff_grows_linearly_and_caps() {
        assert_eq!(backoff(1), Duration::from_millis(50));
        assert_eq!(backoff(3), Duration::from_millis(150));
        assert_eq!(backoff(1_000), BACKOFF_MAX);
    }

    #[tokio::test]
    async fn run_retries_readonly_until_success() {
        let policy = ReconnectPolicy::new();
        let attempts = AtomicU32::new(0);
        let reconnects = AtomicU32::new(0);

        let attempts_ref = &attempts;
        let result = policy
            .run(
                "global",
                move || async move {
                    if attempts_ref.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(AttemptError::from(readonly_error()))
                    } else {
                        Ok("OK")
                    }
                },
                || {
                    reconnects.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;

        assert_eq!(result.unwrap(), "OK");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(reconnects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn run_gives_up_after_retry_ceiling() {
        let policy = ReconnectPolicy::new();
        let attempts = AtomicU32::new(0);

        let attempts_ref = &attempts;
        let result: Result<(), AttemptError> = policy
            .run(
                "global",
                move || async move {
                    attempts_ref.fetch_add(1, Ordering::SeqCst);
                    Err(AttemptError::from(readonly_error()))
                },
                || {},
            )
            .await;

        let Err(AttemptError::Redis(error)) = result else {
            panic!("expected the last redis error");
        };
        assert_eq!(error.code(), Some(READONLY_MARKER));
        assert_eq!(attempts.load(Ordering::SeqCst), FAILOVER_RETRY_LIMIT + 1);
    }

    #[tokio::test]
    async fn run_surfaces_other_errors_without_retry() {
        let policy = ReconnectPolicy::new();
        let attempts = AtomicU32::new(0);
        let reconnects = AtomicU32::new(0);

        let attempts_ref = &attempts;
        let result: Result<(), AttemptError> = policy
            .run(
                "east",
                move || async move {
                    attempts_ref.fetch_add(1, Ordering::SeqCst);
                    Err(AttemptError::from(reset_error()))
                },
                || {
                    reconnects.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;

        assert!(matches!(result, Err(AttemptError::Redis(ref e)) if e.is_io_error()));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(reconnects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn closed_attempt_is_not_retried_or_warned() {
        let policy = ReconnectPolicy::new();
        let attempts = AtomicU32::new(0);
        let reconnects = AtomicU32::new(0);

        let attempts_ref = &attempts;
        let (result, warnings) = capture_warnings(|| {
            tokio_test::block_on(policy.run(
                "global",
                move || async move {
                    attempts_ref.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(AttemptError::Closed)
                },
                || {
                    reconnects.fetch_add(1, Ordering::SeqCst);
                },
            ))
        });

        assert!(matches!(result, Err(AttemptError::Closed)));
        assert!(warnings.is_empty(), "closed handles are not redis failures: {warnings:?}");
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(reconnects.load(Ordering::SeqCst), 0);
    }
}
