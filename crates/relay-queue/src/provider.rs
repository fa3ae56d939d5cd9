//! Queue manager that dispatches to the configured broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use relay_core::config::AppConfig;
use relay_core::error::AppError;
use relay_core::result::AppResult;
use relay_core::traits::broker::QueueBroker;
use relay_core::types::queue::{
    Delivery, FailOutcome, JobOptions, JobRecord, QueueCounts, RetentionSet,
};

use crate::lifecycle::ConnectionEvents;

/// Queue manager that wraps the configured queue broker.
///
/// The broker is selected at construction time based on configuration.
#[derive(Debug, Clone)]
pub struct QueueManager {
    /// The inner queue broker.
    inner: Arc<dyn QueueBroker>,
    /// Redis client, when the broker is Redis-backed.
    #[cfg(feature = "redis-backend")]
    redis: Option<crate::redis::RedisClient>,
}

impl QueueManager {
    /// Create a new queue manager from configuration.
    ///
    /// For the Redis backend this blocks until the first connection
    /// succeeds, publishing lifecycle events on `events` meanwhile.
    #[cfg_attr(not(feature = "redis-backend"), allow(unused_variables))]
    pub async fn new(config: &AppConfig, events: &ConnectionEvents) -> AppResult<Self> {
        let queue = config.worker.queue.as_str();
        let retention = config.retention.policy();
        let lock_duration = Duration::from_millis(config.broker.lock_duration_ms);

        match config.broker.provider.as_str() {
            #[cfg(feature = "redis-backend")]
            "redis" => {
                info!(queue, "Initializing Redis queue broker");
                let target = config.broker.resolve()?;
                let client = crate::redis::RedisClient::connect(&target, events.clone()).await?;
                let broker = crate::redis::RedisQueue::new(
                    client.clone(),
                    &config.broker.key_prefix,
                    queue,
                    retention,
                    lock_duration,
                );
                Ok(Self {
                    inner: Arc::new(broker),
                    redis: Some(client),
                })
            }
            #[cfg(feature = "memory")]
            "memory" => {
                info!(queue, "Initializing in-memory queue broker");
                let broker = crate::memory::MemoryQueue::new(queue, retention, lock_duration);
                Ok(Self::from_broker(Arc::new(broker)))
            }
            other => Err(AppError::configuration(format!(
                "Unknown queue provider: '{other}'. Supported: memory, redis"
            ))),
        }
    }

    /// Create a queue manager from an existing broker (for testing).
    pub fn from_broker(broker: Arc<dyn QueueBroker>) -> Self {
        Self {
            inner: broker,
            #[cfg(feature = "redis-backend")]
            redis: None,
        }
    }

    /// Start the periodic connection probe when the broker is Redis-backed.
    #[cfg(feature = "redis-backend")]
    pub fn spawn_health_monitor(
        &self,
        interval: Duration,
        cancel: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        self.redis
            .as_ref()
            .map(|client| client.spawn_health_monitor(interval, cancel))
    }

    /// Start the periodic connection probe when the broker is Redis-backed.
    #[cfg(not(feature = "redis-backend"))]
    pub fn spawn_health_monitor(
        &self,
        _interval: Duration,
        _cancel: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        None
    }
}

#[async_trait]
impl QueueBroker for QueueManager {
    fn queue_name(&self) -> &str {
        self.inner.queue_name()
    }

    async fn enqueue(
        &self,
        id: Option<&str>,
        payload: &Value,
        options: &JobOptions,
    ) -> AppResult<Option<String>> {
        self.inner.enqueue(id, payload, options).await
    }

    async fn fetch_next(&self) -> AppResult<Option<Delivery>> {
        self.inner.fetch_next().await
    }

    async fn complete(&self, delivery: &Delivery) -> AppResult<()> {
        self.inner.complete(delivery).await
    }

    async fn fail(&self, delivery: &Delivery, reason: &str) -> AppResult<FailOutcome> {
        self.inner.fail(delivery, reason).await
    }

    async fn discard(&self, delivery: &Delivery, reason: &str) -> AppResult<()> {
        self.inner.discard(delivery, reason).await
    }

    async fn recover_stalled(&self) -> AppResult<Vec<String>> {
        self.inner.recover_stalled().await
    }

    async fn counts(&self) -> AppResult<QueueCounts> {
        self.inner.counts().await
    }

    async fn records(&self, set: RetentionSet, limit: usize) -> AppResult<Vec<JobRecord>> {
        self.inner.records(set, limit).await
    }

    async fn health_check(&self) -> AppResult<bool> {
        self.inner.health_check().await
    }
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;
    use relay_core::error::ErrorKind;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_provider_is_selected() {
        let mut config = AppConfig::default();
        config.broker.provider = "memory".to_string();
        let manager = QueueManager::new(&config, &ConnectionEvents::new())
            .await
            .unwrap();

        assert_eq!(manager.queue_name(), "process-inbound-message");
        manager
            .enqueue(Some("1"), &json!({}), &JobOptions::default())
            .await
            .unwrap();
        assert_eq!(manager.counts().await.unwrap().waiting, 1);
        assert!(
            manager
                .spawn_health_monitor(Duration::from_secs(5), watch::channel(false).1)
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_unknown_provider_is_configuration_error() {
        let mut config = AppConfig::default();
        config.broker.provider = "kafka".to_string();
        let err = QueueManager::new(&config, &ConnectionEvents::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
    }
}
