//! Broker connection lifecycle events.
//!
//! The Redis client publishes every connection transition on a broadcast
//! channel. Subscribers only observe; reconnection is handled by the
//! connection manager itself.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Capacity of the event channel. Slow subscribers lose the oldest events.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// One connection transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// TCP (and TLS) session established.
    Connected,
    /// The broker answered its first command.
    Ready,
    /// A connection or command error.
    Error(String),
    /// The connection was lost.
    Closed,
    /// A new connection attempt follows after `delay`.
    Reconnecting {
        /// Wait before the attempt.
        delay: Duration,
    },
}

/// Publisher side of the lifecycle channel.
#[derive(Debug, Clone)]
pub struct ConnectionEvents {
    tx: broadcast::Sender<ConnectionEvent>,
}

impl Default for ConnectionEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionEvents {
    /// Create a channel with no subscribers yet.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Dropped silently when nobody listens.
    pub fn publish(&self, event: ConnectionEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }
}

/// Log every event received until the channel closes.
pub fn spawn_event_logger(mut rx: broadcast::Receiver<ConnectionEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Connection event logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &ConnectionEvent) {
    match event {
        ConnectionEvent::Connected => info!("Redis connected"),
        ConnectionEvent::Ready => info!("Redis ready"),
        ConnectionEvent::Error(message) => error!(error = %message, "Redis connection error"),
        ConnectionEvent::Closed => warn!("Redis connection closed"),
        ConnectionEvent::Reconnecting { delay } => {
            info!(delay_ms = delay.as_millis() as u64, "Reconnecting to Redis");
        }
    }
}

/// Turns periodic probe results into connection transitions.
///
/// Emits `Error`, `Closed`, `Reconnecting` once when a healthy connection
/// starts failing, and `Connected`, `Ready` once when it recovers.
#[derive(Debug)]
pub struct HealthTracker {
    healthy: bool,
    retry_delay: Duration,
}

impl HealthTracker {
    /// Start in the healthy state; `retry_delay` is the probe interval.
    pub fn new(retry_delay: Duration) -> Self {
        Self {
            healthy: true,
            retry_delay,
        }
    }

    /// Whether the last probe succeeded.
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Record a probe result and return the transitions it caused.
    pub fn observe(&mut self, probe: Result<(), String>) -> Vec<ConnectionEvent> {
        match (self.healthy, probe) {
            (true, Err(message)) => {
                self.healthy = false;
                vec![
                    ConnectionEvent::Error(message),
                    ConnectionEvent::Closed,
                    ConnectionEvent::Reconnecting {
                        delay: self.retry_delay,
                    },
                ]
            }
            (false, Err(_)) => vec![ConnectionEvent::Reconnecting {
                delay: self.retry_delay,
            }],
            (false, Ok(())) => {
                self.healthy = true;
                vec![ConnectionEvent::Connected, ConnectionEvent::Ready]
            }
            (true, Ok(())) => Vec::new(),
        }
    }
}
