//! Redis connection management.

use std::time::Duration;

use redis::Client;
use redis::aio::ConnectionManager;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use relay_core::config::ConnectionTarget;
use relay_core::error::{AppError, ErrorKind};
use relay_core::result::AppResult;

use crate::lifecycle::{ConnectionEvent, ConnectionEvents, HealthTracker};

/// First delay between initial connection attempts.
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(500);
/// Upper bound of the delay between initial connection attempts.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Redis client wrapper with connection management.
///
/// Startup keeps retrying until the broker answers; later disconnects are
/// recovered by the [`ConnectionManager`] on the next command.
#[derive(Debug, Clone)]
pub struct RedisClient {
    /// Redis connection manager (multiplexed, reconnecting).
    conn: ConnectionManager,
    /// Lifecycle channel.
    events: ConnectionEvents,
}

impl RedisClient {
    /// Connect to the resolved target, retrying with capped exponential
    /// backoff until the first connection succeeds.
    pub async fn connect(target: &ConnectionTarget, events: ConnectionEvents) -> AppResult<Self> {
        let url = target.to_url()?;
        info!(
            url = %mask_redis_url(&url),
            source = %target.source,
            tls = target.tls,
            "Connecting to Redis"
        );

        let client = Client::open(url.as_str()).map_err(|e| {
            AppError::with_source(ErrorKind::Configuration, "Failed to create Redis client", e)
        })?;

        let mut delay = INITIAL_RECONNECT_DELAY;
        let conn = loop {
            match ConnectionManager::new(client.clone()).await {
                Ok(conn) => break conn,
                Err(e) => {
                    events.publish(ConnectionEvent::Error(e.to_string()));
                    events.publish(ConnectionEvent::Reconnecting { delay });
                    tokio::time::sleep(delay).await;
                    delay = next_delay(delay);
                }
            }
        };
        events.publish(ConnectionEvent::Connected);

        let this = Self { conn, events };
        match this.ping().await {
            Ok(()) => this.events.publish(ConnectionEvent::Ready),
            Err(e) => this.events.publish(ConnectionEvent::Error(e.to_string())),
        }

        Ok(this)
    }

    /// Get a mutable clone of the connection manager.
    pub fn conn_mut(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Send `PING`.
    pub async fn ping(&self) -> AppResult<()> {
        let mut conn = self.conn_mut();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| AppError::with_source(ErrorKind::Broker, "Redis PING failed", e))?;
        Ok(())
    }

    /// Probe the connection every `interval` and publish transitions until
    /// `cancel` flips to `true`.
    pub fn spawn_health_monitor(
        &self,
        interval: Duration,
        mut cancel: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let mut tracker = HealthTracker::new(interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let probe = client.ping().await.map_err(|e| e.to_string());
                        for event in tracker.observe(probe) {
                            client.events.publish(event);
                        }
                    }
                    _ = cancel.changed() => {
                        if *cancel.borrow() {
                            debug!("Redis health monitor stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

fn next_delay(current: Duration) -> Duration {
    current.saturating_mul(2).min(MAX_RECONNECT_DELAY)
}

/// Mask password in Redis URL for safe logging.
pub(crate) fn mask_redis_url(url: &str) -> String {
    if let Some(at_pos) = url.rfind('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let scheme_end = url.find("://").map(|p| p + 3).unwrap_or(0);
            if colon_pos > scheme_end {
                return format!("{}:****@{}", &url[..colon_pos], &url[at_pos + 1..]);
            }
        }
    }
    url.to_string()
}
