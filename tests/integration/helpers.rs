//! Shared test helpers for integration tests.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use wiremock::MockServer;

use relay_core::config::{AppConfig, WorkerConfig};
use relay_core::traits::broker::QueueBroker;
use relay_core::types::job::Job;
use relay_core::types::queue::{JobOptions, JobRecord, RetentionSet};
use relay_queue::memory::MemoryQueue;
use relay_worker::{DrainState, HttpProcessor, JobDispatcher, LifecycleController};

/// A running relay wired to an in-memory queue and a mock downstream.
pub struct TestRelay {
    /// The queue the dispatcher consumes.
    pub queue: Arc<MemoryQueue>,
    /// The mocked downstream service.
    pub downstream: MockServer,
    controller: LifecycleController,
    dispatcher: Option<JoinHandle<()>>,
}

impl TestRelay {
    /// Start a relay with fast polling.
    pub async fn start(downstream: MockServer) -> Self {
        let mut config = AppConfig::default();
        config.downstream.base_url = Some(downstream.uri());
        config.downstream.timeout_ms = 2_000;
        config.worker = WorkerConfig {
            poll_interval_ms: 10,
            drain_timeout_seconds: 5,
            ..WorkerConfig::default()
        };
        config.validate().expect("test config is valid");

        let queue = Arc::new(MemoryQueue::with_defaults(config.worker.queue.clone()));
        let processor =
            HttpProcessor::from_config(&config.downstream).expect("Failed to build processor");
        let dispatcher =
            JobDispatcher::new(queue.clone(), Arc::new(processor), config.worker.clone());
        let controller =
            LifecycleController::new(dispatcher.in_flight(), config.worker.drain_timeout());

        let cancel = controller.subscribe();
        let handle = tokio::spawn(async move { dispatcher.run(cancel).await });

        Self {
            queue,
            downstream,
            controller,
            dispatcher: Some(handle),
        }
    }

    /// Enqueue a job the way the producer does.
    pub async fn enqueue(&self, job: &Job, options: &JobOptions) {
        self.queue
            .enqueue_job(job, options)
            .await
            .expect("Failed to enqueue job");
    }

    /// Enqueue a raw payload.
    pub async fn enqueue_raw(&self, id: &str, payload: Value, options: &JobOptions) {
        self.queue
            .enqueue(Some(id), &payload, options)
            .await
            .expect("Failed to enqueue payload");
    }

    /// Wait until `set` holds at least `count` records.
    pub async fn wait_for(&self, set: RetentionSet, count: usize) -> Vec<JobRecord> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let records = self
                .queue
                .records(set, usize::MAX)
                .await
                .expect("Failed to read records");
            if records.len() >= count {
                return records;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "Timed out waiting for {count} {set} records, have {}",
                records.len()
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Drain and stop the relay.
    pub async fn shutdown(mut self) -> DrainState {
        let handle = self.dispatcher.take().expect("relay already stopped");
        self.controller.drain(handle, std::future::pending()).await
    }
}

/// A job with fixed identifiers.
pub fn sample_job(job_id: &str) -> Job {
    Job::new(job_id, "comp-1", "conv-1", "hola, necesito ayuda")
        .with_created_at("2024-05-01T10:00:00.000Z")
}
