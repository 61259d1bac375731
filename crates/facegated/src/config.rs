use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_BIND: &str = "0.0.0.0:5000";

/// Daemon-only settings, loaded from environment variables.
///
/// Matching and storage settings live in [`facegate_core::Config`].
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Listen address (default: 0.0.0.0:5000).
    pub bind: SocketAddr,
    /// Largest accepted request body in bytes.
    pub max_body_bytes: usize,
    /// Upper bound on one engine call, queue wait included.
    pub request_timeout: Duration,
    /// Requests that may wait for the engine thread before senders block.
    pub queue_depth: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: ([0, 0, 0, 0], 5000).into(),
            max_body_bytes: 10 * 1024 * 1024,
            request_timeout: Duration::from_secs(30),
            queue_depth: 4,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from `FACEGATE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let bind = lookup("FACEGATE_BIND")
            .unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = bind.parse().unwrap_or_else(|_| {
            tracing::warn!(value = %bind, "FACEGATE_BIND is not a socket address; using {DEFAULT_BIND}");
            defaults.bind
        });

        Self {
            bind,
            max_body_bytes: env_usize(&lookup, "FACEGATE_MAX_BODY_BYTES", defaults.max_body_bytes),
            request_timeout: Duration::from_secs(env_u64(
                &lookup,
                "FACEGATE_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )),
            // A zero-capacity channel panics in tokio.
            queue_depth: env_usize(&lookup, "FACEGATE_QUEUE_DEPTH", defaults.queue_depth).max(1),
        }
    }
}

fn env_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    lookup(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    lookup(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
