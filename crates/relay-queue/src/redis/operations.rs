//! Redis queue broker implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use relay_core::error::{AppError, ErrorKind};
use relay_core::result::AppResult;
use relay_core::traits::broker::QueueBroker;
use relay_core::types::queue::{
    Delivery, FailOutcome, JobOptions, JobRecord, QueueCounts, RetentionPolicy, RetentionSet,
};

use super::client::RedisClient;
use super::scripts::QueueScripts;
use crate::keys::QueueKeys;

/// Script result meaning another worker owns the job's lock.
const LOCK_LOST: i64 = -1;

/// Redis-backed queue broker using a BullMQ-compatible key layout.
#[derive(Debug, Clone)]
pub struct RedisQueue {
    /// Redis client.
    client: RedisClient,
    /// Queue name.
    queue: String,
    /// Key builder.
    keys: QueueKeys,
    /// Retention bounds applied on every finish.
    retention: RetentionPolicy,
    /// Lock duration of fetched jobs.
    lock_duration: Duration,
    /// Lock owner token of this worker process.
    token: String,
    /// Transition scripts.
    scripts: Arc<QueueScripts>,
}

impl RedisQueue {
    /// Create a broker for `queue` under `key_prefix`.
    pub fn new(
        client: RedisClient,
        key_prefix: &str,
        queue: &str,
        retention: RetentionPolicy,
        lock_duration: Duration,
    ) -> Self {
        Self {
            client,
            queue: queue.to_string(),
            keys: QueueKeys::new(key_prefix, queue),
            retention,
            lock_duration,
            token: uuid::Uuid::new_v4().to_string(),
            scripts: Arc::new(QueueScripts::new()),
        }
    }

    /// Map a Redis error to an AppError.
    fn map_err(e: redis::RedisError) -> AppError {
        AppError::with_source(ErrorKind::Broker, format!("Redis error: {e}"), e)
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn set_key(&self, set: RetentionSet) -> String {
        match set {
            RetentionSet::Completed => self.keys.completed(),
            RetentionSet::Failed => self.keys.failed(),
        }
    }

    /// Run the finish script for `delivery` into `set`.
    async fn finish(
        &self,
        delivery: &Delivery,
        set: RetentionSet,
        attempts_made: u32,
        reason: &str,
    ) -> AppResult<()> {
        let keep = self.retention.for_set(set);
        let max_age_ms = keep.age.map(|a| a.as_millis() as u64).unwrap_or(0);
        let mut conn = self.client.conn_mut();

        let removed: i64 = self
            .scripts
            .finish
            .key(self.keys.active())
            .key(self.set_key(set))
            .arg(&delivery.id)
            .arg(self.keys.job_prefix())
            .arg(Self::now_ms())
            .arg(&self.token)
            .arg(keep.count as u64)
            .arg(max_age_ms)
            .arg(reason)
            .arg(attempts_made)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::map_err)?;

        if removed == LOCK_LOST {
            return Err(lock_lost(&delivery.id));
        }
        if removed > 0 {
            debug!(set = %set, count = removed, "Trimmed retention set");
        }
        Ok(())
    }

    async fn load_record(&self, id: &str) -> AppResult<Option<JobRecord>> {
        let mut conn = self.client.conn_mut();
        let (data, attempts_made, finished_on, failed_reason): (
            Option<String>,
            Option<u32>,
            Option<i64>,
            Option<String>,
        ) = redis::cmd("HMGET")
            .arg(self.keys.job(id))
            .arg("data")
            .arg("attemptsMade")
            .arg("finishedOn")
            .arg("failedReason")
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;

        let Some(data) = data else {
            return Ok(None);
        };
        Ok(Some(JobRecord {
            id: id.to_string(),
            payload: parse_payload(id, data),
            attempts_made: attempts_made.unwrap_or(0),
            finished_at: finished_on.and_then(DateTime::from_timestamp_millis),
            failed_reason,
        }))
    }
}

fn lock_lost(id: &str) -> AppError {
    AppError::new(
        ErrorKind::Broker,
        format!("Lock of job '{id}' is held by another worker"),
    )
}

/// Decode stored job data. Data that is not JSON is kept as a string so the
/// validator rejects it instead of the broker.
fn parse_payload(id: &str, data: String) -> Value {
    match serde_json::from_str(&data) {
        Ok(value) => value,
        Err(e) => {
            warn!(job_id = %id, error = %e, "Job data is not JSON");
            Value::String(data)
        }
    }
}

/// Decode stored job options, falling back to a single attempt.
fn parse_options(id: &str, opts: &str) -> JobOptions {
    if opts.is_empty() {
        return JobOptions::default();
    }
    serde_json::from_str(opts).unwrap_or_else(|e| {
        warn!(job_id = %id, error = %e, "Job options are invalid, using defaults");
        JobOptions::default()
    })
}

#[async_trait]
impl QueueBroker for RedisQueue {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn enqueue(
        &self,
        id: Option<&str>,
        payload: &Value,
        options: &JobOptions,
    ) -> AppResult<Option<String>> {
        let data = serde_json::to_string(payload)?;
        let opts = serde_json::to_string(options)?;
        let mut conn = self.client.conn_mut();

        let added: Option<String> = self
            .scripts
            .enqueue
            .key(self.keys.wait())
            .key(self.keys.id_counter())
            .arg(self.keys.job_prefix())
            .arg(id.unwrap_or(""))
            .arg(data)
            .arg(opts)
            .arg(Self::now_ms())
            .invoke_async(&mut conn)
            .await
            .map_err(Self::map_err)?;

        if added.is_none() {
            debug!(job_id = ?id, "Duplicate enqueue ignored");
        }
        Ok(added)
    }

    async fn fetch_next(&self) -> AppResult<Option<Delivery>> {
        let mut conn = self.client.conn_mut();
        let fetched: Option<(String, String, String, u32)> = self
            .scripts
            .fetch
            .key(self.keys.wait())
            .key(self.keys.active())
            .key(self.keys.delayed())
            .arg(Self::now_ms())
            .arg(self.keys.job_prefix())
            .arg(self.lock_duration.as_millis() as u64)
            .arg(&self.token)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::map_err)?;

        Ok(fetched.map(|(id, data, opts, attempts_made)| Delivery {
            payload: parse_payload(&id, data),
            options: parse_options(&id, &opts),
            attempts_made,
            id,
        }))
    }

    async fn complete(&self, delivery: &Delivery) -> AppResult<()> {
        self.finish(delivery, RetentionSet::Completed, delivery.attempt(), "")
            .await
    }

    async fn fail(&self, delivery: &Delivery, reason: &str) -> AppResult<FailOutcome> {
        let outcome = delivery.options.after_failure(delivery.attempts_made);
        match outcome {
            FailOutcome::Retrying { attempt, delay } => {
                let mut conn = self.client.conn_mut();
                let result: i64 = self
                    .scripts
                    .retry
                    .key(self.keys.active())
                    .key(self.keys.delayed())
                    .key(self.keys.wait())
                    .arg(&delivery.id)
                    .arg(self.keys.job_prefix())
                    .arg(Self::now_ms())
                    .arg(&self.token)
                    .arg(delay.as_millis() as u64)
                    .arg(reason)
                    .arg(attempt)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(Self::map_err)?;
                if result == LOCK_LOST {
                    return Err(lock_lost(&delivery.id));
                }
            }
            FailOutcome::Exhausted { attempts } => {
                self.finish(delivery, RetentionSet::Failed, attempts, reason)
                    .await?;
            }
        }
        Ok(outcome)
    }

    async fn discard(&self, delivery: &Delivery, reason: &str) -> AppResult<()> {
        self.finish(delivery, RetentionSet::Failed, delivery.attempt(), reason)
            .await
    }

    async fn recover_stalled(&self) -> AppResult<Vec<String>> {
        let mut conn = self.client.conn_mut();
        let recovered: Vec<String> = self
            .scripts
            .recover_stalled
            .key(self.keys.active())
            .key(self.keys.wait())
            .arg(self.keys.job_prefix())
            .invoke_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        Ok(recovered)
    }

    async fn counts(&self) -> AppResult<QueueCounts> {
        let mut conn = self.client.conn_mut();
        let (waiting, active, delayed, completed, failed): (u64, u64, u64, u64, u64) =
            redis::pipe()
                .cmd("LLEN")
                .arg(self.keys.wait())
                .cmd("LLEN")
                .arg(self.keys.active())
                .cmd("ZCARD")
                .arg(self.keys.delayed())
                .cmd("ZCARD")
                .arg(self.keys.completed())
                .cmd("ZCARD")
                .arg(self.keys.failed())
                .query_async(&mut conn)
                .await
                .map_err(Self::map_err)?;

        Ok(QueueCounts {
            waiting,
            active,
            delayed,
            completed,
            failed,
        })
    }

    async fn records(&self, set: RetentionSet, limit: usize) -> AppResult<Vec<JobRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.client.conn_mut();
        let ids: Vec<String> = redis::cmd("ZREVRANGE")
            .arg(self.set_key(set))
            .arg(0)
            .arg(limit as i64 - 1)
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.load_record(&id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn health_check(&self) -> AppResult<bool> {
        Ok(self.client.ping().await.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::types::queue::BackoffPolicy;
    use serde_json::json;

    #[test]
    fn test_parse_payload_keeps_non_json_as_string() {
        assert_eq!(parse_payload("1", r#"{"a":1}"#.to_string()), json!({"a": 1}));
        assert_eq!(
            parse_payload("1", "not json".to_string()),
            Value::String("not json".to_string())
        );
    }

    #[test]
    fn test_parse_options_reads_bullmq_opts() {
        let options = parse_options(
            "1",
            r#"{"attempts":3,"backoff":{"type":"exponential","delay":2000},"jobId":"x"}"#,
        );
        assert_eq!(options.attempts, 3);
        assert_eq!(
            options.backoff,
            Some(BackoffPolicy::Exponential { delay: 2000 })
        );
    }

    #[test]
    fn test_parse_options_falls_back_to_single_attempt() {
        assert_eq!(parse_options("1", ""), JobOptions::default());
        assert_eq!(parse_options("1", "{broken"), JobOptions::default());
    }
}
