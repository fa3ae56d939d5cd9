//! In-process queue for local runs and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use relay_core::error::AppError;
use relay_core::result::AppResult;
use relay_core::traits::broker::QueueBroker;
use relay_core::types::queue::{
    Delivery, FailOutcome, JobOptions, JobRecord, QueueCounts, RetentionPolicy, RetentionSet,
};

/// Bookkeeping for one job.
#[derive(Debug)]
struct StoredJob {
    payload: Value,
    options: JobOptions,
    attempts_made: u32,
    finished_at: Option<DateTime<Utc>>,
    failed_reason: Option<String>,
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<String, StoredJob>,
    waiting: VecDeque<String>,
    /// Active ids and their lock expiry.
    active: HashMap<String, Instant>,
    delayed: Vec<(Instant, String)>,
    /// Newest first.
    completed: VecDeque<String>,
    /// Newest first.
    failed: VecDeque<String>,
    next_id: u64,
}

impl QueueState {
    fn promote_delayed(&mut self, now: Instant) {
        let (due, pending): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|(ready_at, _)| *ready_at <= now);
        self.delayed = pending;
        self.waiting.extend(due.into_iter().map(|(_, id)| id));
    }

    fn finish(
        &mut self,
        id: &str,
        set: RetentionSet,
        attempts_made: u32,
        reason: Option<&str>,
        retention: &RetentionPolicy,
    ) -> AppResult<()> {
        self.active.remove(id);
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| AppError::not_found(format!("Job '{id}' not found")))?;
        job.attempts_made = attempts_made;
        job.finished_at = Some(Utc::now());
        if let Some(reason) = reason {
            job.failed_reason = Some(reason.to_string());
        }

        let list = match set {
            RetentionSet::Completed => &mut self.completed,
            RetentionSet::Failed => &mut self.failed,
        };
        list.retain(|existing| existing != id);
        list.push_front(id.to_string());

        self.trim(set, retention);
        Ok(())
    }

    fn trim(&mut self, set: RetentionSet, retention: &RetentionPolicy) {
        let keep = retention.for_set(set);
        let cutoff = keep
            .age
            .and_then(|age| chrono::Duration::from_std(age).ok())
            .map(|age| Utc::now() - age);

        let list = match set {
            RetentionSet::Completed => &mut self.completed,
            RetentionSet::Failed => &mut self.failed,
        };

        let mut removed = Vec::new();
        while list.len() > keep.count {
            if let Some(id) = list.pop_back() {
                removed.push(id);
            }
        }
        if let Some(cutoff) = cutoff {
            while let Some(oldest) = list.back() {
                let expired = self
                    .jobs
                    .get(oldest)
                    .and_then(|j| j.finished_at)
                    .is_none_or(|finished| finished < cutoff);
                if !expired {
                    break;
                }
                if let Some(id) = list.pop_back() {
                    removed.push(id);
                }
            }
        }

        for id in &removed {
            self.jobs.remove(id);
        }
        if !removed.is_empty() {
            debug!(set = %set, count = removed.len(), "Trimmed retention set");
        }
    }

    fn record(&self, id: &str) -> Option<JobRecord> {
        self.jobs.get(id).map(|job| JobRecord {
            id: id.to_string(),
            payload: job.payload.clone(),
            attempts_made: job.attempts_made,
            finished_at: job.finished_at,
            failed_reason: job.failed_reason.clone(),
        })
    }
}

/// In-memory [`QueueBroker`] with the same retry, backoff, stall, and
/// retention rules as the Redis backend. State is lost on exit.
#[derive(Debug, Clone)]
pub struct MemoryQueue {
    name: String,
    retention: RetentionPolicy,
    lock_duration: Duration,
    state: Arc<Mutex<QueueState>>,
}

impl MemoryQueue {
    /// Create an empty queue.
    pub fn new(name: impl Into<String>, retention: RetentionPolicy, lock_duration: Duration) -> Self {
        Self {
            name: name.into(),
            retention,
            lock_duration,
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    /// Create an empty queue with default retention and a 90 second lock.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, RetentionPolicy::default(), Duration::from_secs(90))
    }
}

#[async_trait]
impl QueueBroker for MemoryQueue {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn enqueue(
        &self,
        id: Option<&str>,
        payload: &Value,
        options: &JobOptions,
    ) -> AppResult<Option<String>> {
        let mut state = self.state.lock().await;
        let id = match id {
            Some(id) => id.to_string(),
            None => {
                state.next_id += 1;
                state.next_id.to_string()
            }
        };
        if state.jobs.contains_key(&id) {
            debug!(job_id = %id, "Duplicate enqueue ignored");
            return Ok(None);
        }

        state.jobs.insert(
            id.clone(),
            StoredJob {
                payload: payload.clone(),
                options: options.clone(),
                attempts_made: 0,
                finished_at: None,
                failed_reason: None,
            },
        );
        state.waiting.push_back(id.clone());
        Ok(Some(id))
    }

    async fn fetch_next(&self) -> AppResult<Option<Delivery>> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.promote_delayed(now);

        let Some(id) = state.waiting.pop_front() else {
            return Ok(None);
        };
        state.active.insert(id.clone(), now + self.lock_duration);

        let job = state
            .jobs
            .get(&id)
            .ok_or_else(|| AppError::internal(format!("Waiting job '{id}' has no data")))?;
        Ok(Some(Delivery {
            id: id.clone(),
            payload: job.payload.clone(),
            attempts_made: job.attempts_made,
            options: job.options.clone(),
        }))
    }

    async fn complete(&self, delivery: &Delivery) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state.finish(
            &delivery.id,
            RetentionSet::Completed,
            delivery.attempt(),
            None,
            &self.retention,
        )
    }

    async fn fail(&self, delivery: &Delivery, reason: &str) -> AppResult<FailOutcome> {
        let outcome = delivery.options.after_failure(delivery.attempts_made);
        let mut state = self.state.lock().await;

        match outcome {
            FailOutcome::Retrying { attempt, delay } => {
                state.active.remove(&delivery.id);
                let job = state.jobs.get_mut(&delivery.id).ok_or_else(|| {
                    AppError::not_found(format!("Job '{}' not found", delivery.id))
                })?;
                job.attempts_made = attempt;
                job.failed_reason = Some(reason.to_string());

                if delay.is_zero() {
                    state.waiting.push_back(delivery.id.clone());
                } else {
                    state
                        .delayed
                        .push((Instant::now() + delay, delivery.id.clone()));
                }
            }
            FailOutcome::Exhausted { attempts } => {
                state.finish(
                    &delivery.id,
                    RetentionSet::Failed,
                    attempts,
                    Some(reason),
                    &self.retention,
                )?;
            }
        }

        Ok(outcome)
    }

    async fn discard(&self, delivery: &Delivery, reason: &str) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state.finish(
            &delivery.id,
            RetentionSet::Failed,
            delivery.attempt(),
            Some(reason),
            &self.retention,
        )
    }

    async fn recover_stalled(&self) -> AppResult<Vec<String>> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let stalled: Vec<String> = state
            .active
            .iter()
            .filter(|(_, expires)| **expires <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stalled {
            state.active.remove(id);
            state.waiting.push_front(id.clone());
        }
        Ok(stalled)
    }

    async fn counts(&self) -> AppResult<QueueCounts> {
        let state = self.state.lock().await;
        Ok(QueueCounts {
            waiting: state.waiting.len() as u64,
            active: state.active.len() as u64,
            delayed: state.delayed.len() as u64,
            completed: state.completed.len() as u64,
            failed: state.failed.len() as u64,
        })
    }

    async fn records(&self, set: RetentionSet, limit: usize) -> AppResult<Vec<JobRecord>> {
        let state = self.state.lock().await;
        let list = match set {
            RetentionSet::Completed => &state.completed,
            RetentionSet::Failed => &state.failed,
        };
        Ok(list
            .iter()
            .take(limit)
            .filter_map(|id| state.record(id))
            .collect())
    }

    async fn health_check(&self) -> AppResult<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::types::queue::{BackoffPolicy, KeepJobs};
    use serde_json::json;

    fn make_queue() -> MemoryQueue {
        MemoryQueue::with_defaults("process-inbound-message")
    }

    #[tokio::test]
    async fn test_enqueue_fetch_complete() {
        let queue = make_queue();
        let id = queue
            .enqueue(Some("1"), &json!({"job_id": "1"}), &JobOptions::default())
            .await
            .unwrap();
        assert_eq!(id.as_deref(), Some("1"));

        let delivery = queue.fetch_next().await.unwrap().unwrap();
        assert_eq!(delivery.id, "1");
        assert_eq!(delivery.attempt(), 1);
        assert_eq!(queue.counts().await.unwrap().active, 1);

        queue.complete(&delivery).await.unwrap();
        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.active, 0);
        assert_eq!(counts.completed, 1);

        let records = queue.records(RetentionSet::Completed, 10).await.unwrap();
        assert_eq!(records[0].id, "1");
        assert_eq!(records[0].attempts_made, 1);
        assert!(records[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_id_is_ignored() {
        let queue = make_queue();
        let options = JobOptions::default();
        assert!(queue.enqueue(Some("a"), &json!({}), &options).await.unwrap().is_some());
        assert!(queue.enqueue(Some("a"), &json!({}), &options).await.unwrap().is_none());
        assert_eq!(queue.counts().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_generated_ids_are_sequential() {
        let queue = make_queue();
        let options = JobOptions::default();
        let first = queue.enqueue(None, &json!({}), &options).await.unwrap();
        let second = queue.enqueue(None, &json!({}), &options).await.unwrap();
        assert_eq!(first.as_deref(), Some("1"));
        assert_eq!(second.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_fetch_on_empty_queue() {
        assert!(make_queue().fetch_next().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_for_backoff_then_exhausts() {
        let queue = make_queue();
        let options = JobOptions {
            attempts: 2,
            backoff: Some(BackoffPolicy::Fixed { delay: 1000 }),
        };
        queue.enqueue(Some("r"), &json!({}), &options).await.unwrap();

        let first = queue.fetch_next().await.unwrap().unwrap();
        let outcome = queue.fail(&first, "downstream returned 500").await.unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                attempt: 1,
                delay: Duration::from_millis(1000)
            }
        );
        assert_eq!(queue.counts().await.unwrap().delayed, 1);
        assert!(queue.fetch_next().await.unwrap().is_none());

        tokio::time::advance(Duration::from_millis(1001)).await;
        let second = queue.fetch_next().await.unwrap().unwrap();
        assert_eq!(second.attempts_made, 1);

        let outcome = queue.fail(&second, "downstream returned 500").await.unwrap();
        assert_eq!(outcome, FailOutcome::Exhausted { attempts: 2 });

        let failed = queue.records(RetentionSet::Failed, 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts_made, 2);
        assert_eq!(
            failed[0].failed_reason.as_deref(),
            Some("downstream returned 500")
        );
    }

    #[tokio::test]
    async fn test_discard_skips_remaining_attempts() {
        let queue = make_queue();
        queue
            .enqueue(Some("bad"), &json!("nope"), &JobOptions::producer_default())
            .await
            .unwrap();
        let delivery = queue.fetch_next().await.unwrap().unwrap();
        queue.discard(&delivery, "payload is not an object").await.unwrap();

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.delayed, 0);
        assert_eq!(counts.waiting, 0);
    }

    #[tokio::test]
    async fn test_completed_set_is_trimmed_by_count() {
        let retention = RetentionPolicy {
            completed: KeepJobs {
                count: 2,
                age: None,
            },
            ..RetentionPolicy::default()
        };
        let queue = MemoryQueue::new("q", retention, Duration::from_secs(90));
        for id in ["1", "2", "3"] {
            queue
                .enqueue(Some(id), &json!({}), &JobOptions::default())
                .await
                .unwrap();
            let delivery = queue.fetch_next().await.unwrap().unwrap();
            queue.complete(&delivery).await.unwrap();
        }

        let records = queue.records(RetentionSet::Completed, 10).await.unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "2"]);

        // A trimmed id can be enqueued again.
        assert!(queue
            .enqueue(Some("1"), &json!({}), &JobOptions::default())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_completed_set_is_trimmed_by_age() {
        let retention = RetentionPolicy {
            completed: KeepJobs {
                count: 100,
                age: Some(Duration::from_secs(3600)),
            },
            ..RetentionPolicy::default()
        };
        let queue = MemoryQueue::new("q", retention, Duration::from_secs(90));
        queue
            .enqueue(Some("old"), &json!({}), &JobOptions::default())
            .await
            .unwrap();
        let delivery = queue.fetch_next().await.unwrap().unwrap();
        queue.complete(&delivery).await.unwrap();

        // Backdate the first completion past the retention age.
        if let Some(job) = queue.state.lock().await.jobs.get_mut("old") {
            job.finished_at = Some(Utc::now() - chrono::Duration::hours(2));
        }

        queue
            .enqueue(Some("new"), &json!({}), &JobOptions::default())
            .await
            .unwrap();
        let delivery = queue.fetch_next().await.unwrap().unwrap();
        queue.complete(&delivery).await.unwrap();

        let records = queue.records(RetentionSet::Completed, 10).await.unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["new"]);
        assert!(!queue.state.lock().await.jobs.contains_key("old"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lock_is_recovered() {
        let queue = MemoryQueue::new("q", RetentionPolicy::default(), Duration::from_secs(5));
        queue
            .enqueue(Some("s"), &json!({}), &JobOptions::default())
            .await
            .unwrap();
        let _delivery = queue.fetch_next().await.unwrap().unwrap();

        assert!(queue.recover_stalled().await.unwrap().is_empty());
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(queue.recover_stalled().await.unwrap(), vec!["s".to_string()]);
        let again = queue.fetch_next().await.unwrap().unwrap();
        assert_eq!(again.id, "s");
    }
}
