//! Queue broker trait for pluggable queue backends.

use async_trait::async_trait;
use serde_json::Value;

use crate::result::AppResult;
use crate::types::job::Job;
use crate::types::queue::{
    Delivery, FailOutcome, JobOptions, JobRecord, QueueCounts, RetentionSet,
};

/// A durable queue with at-least-once delivery, per-job retry budgets, and
/// bounded completed/failed retention.
///
/// Retry counting, backoff, stalled-delivery recovery, and retention
/// trimming all live behind this trait. Callers only report what happened
/// to each delivery.
#[async_trait]
pub trait QueueBroker: Send + Sync + std::fmt::Debug + 'static {
    /// Name of the queue this broker serves.
    fn queue_name(&self) -> &str;

    /// Add a raw payload. `id` makes the enqueue idempotent: when a job with
    /// the same id already exists nothing is added and `None` is returned.
    async fn enqueue(
        &self,
        id: Option<&str>,
        payload: &Value,
        options: &JobOptions,
    ) -> AppResult<Option<String>>;

    /// Take the next ready job, if any, and lock it to the caller.
    async fn fetch_next(&self) -> AppResult<Option<Delivery>>;

    /// Record a successful delivery in the completed set.
    async fn complete(&self, delivery: &Delivery) -> AppResult<()>;

    /// Record a failed attempt: schedule a retry or, once the budget is
    /// spent, move the job to the failed set.
    async fn fail(&self, delivery: &Delivery, reason: &str) -> AppResult<FailOutcome>;

    /// Move a delivery to the failed set without spending further attempts.
    async fn discard(&self, delivery: &Delivery, reason: &str) -> AppResult<()>;

    /// Return active deliveries whose lock expired to the waiting list.
    /// Returns the recovered ids.
    async fn recover_stalled(&self) -> AppResult<Vec<String>>;

    /// Sizes of the queue's lists and sets.
    async fn counts(&self) -> AppResult<QueueCounts>;

    /// Newest entries of a retention set.
    async fn records(&self, set: RetentionSet, limit: usize) -> AppResult<Vec<JobRecord>>;

    /// Whether the backend is reachable.
    async fn health_check(&self) -> AppResult<bool>;

    /// Enqueue a typed job under its own `job_id`.
    async fn enqueue_job(&self, job: &Job, options: &JobOptions) -> AppResult<Option<String>> {
        let payload = serde_json::to_value(job)?;
        self.enqueue(Some(&job.job_id), &payload, options).await
    }
}
