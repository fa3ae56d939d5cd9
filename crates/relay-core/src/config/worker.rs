//! Job dispatcher configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Name of the queue carrying inbound messages.
pub const INBOUND_QUEUE: &str = "process-inbound-message";

/// Job dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Queue to consume.
    #[serde(default = "default_queue")]
    pub queue: String,
    /// Maximum number of deliveries processed at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Sleep between fetches when the queue is empty, in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Grace period for in-flight deliveries on shutdown, in seconds.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_seconds: u64,
    /// Send payloads that fail the shape check straight to the failed set
    /// instead of spending the retry budget on them.
    #[serde(default)]
    pub discard_invalid_payloads: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: default_queue(),
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval(),
            drain_timeout_seconds: default_drain_timeout(),
            discard_invalid_payloads: false,
        }
    }
}

impl WorkerConfig {
    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Drain grace period as a [`Duration`].
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_seconds)
    }
}

fn default_queue() -> String {
    INBOUND_QUEUE.to_string()
}

fn default_concurrency() -> usize {
    5
}

fn default_poll_interval() -> u64 {
    500
}

fn default_drain_timeout() -> u64 {
    30
}
