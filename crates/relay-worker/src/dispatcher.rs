//! Dispatch loop: fetch deliveries, validate, forward, report.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tracing::{debug, error, info, warn};

use relay_core::config::WorkerConfig;
use relay_core::traits::broker::QueueBroker;
use relay_core::types::queue::{Delivery, FailOutcome};

use crate::drain::InFlightTracker;
use crate::error::JobFailure;
use crate::processor::JobProcessor;
use crate::validator;

/// Default interval between stalled-delivery sweeps.
const DEFAULT_STALLED_INTERVAL: Duration = Duration::from_secs(30);

/// Where one delivery is in its handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Fetched from the broker.
    Dequeued,
    /// Structural check running.
    Validating,
    /// Payload failed the structural check.
    Rejected,
    /// Payload passed the structural check.
    Validated,
    /// Downstream call in progress.
    Processing,
    /// Reported as completed.
    Completed,
    /// Reported as failed.
    Failed,
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Dequeued => "dequeued",
            Self::Validating => "validating",
            Self::Rejected => "rejected",
            Self::Validated => "validated",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What the broker was told about one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Moved to the completed set.
    Completed,
    /// Scheduled for another attempt.
    Retrying {
        /// The attempt that failed.
        attempt: u32,
        /// Delay before the next one.
        delay: Duration,
    },
    /// Retry budget spent; moved to the failed set.
    Exhausted {
        /// Attempts made in total.
        attempts: u32,
    },
    /// Invalid payload moved to the failed set without further attempts.
    Discarded,
    /// The broker call itself failed; stalled recovery will redeliver.
    Unreported,
}

/// Pulls deliveries from one queue and runs at most `concurrency` of them
/// at a time.
#[derive(Debug)]
pub struct JobDispatcher {
    /// Queue broker.
    broker: Arc<dyn QueueBroker>,
    /// Downstream processor.
    processor: Arc<dyn JobProcessor>,
    /// Dispatcher settings.
    config: WorkerConfig,
    /// Interval between stalled sweeps.
    stalled_interval: Duration,
    /// In-flight accounting shared with the shutdown path.
    in_flight: InFlightTracker,
}

impl JobDispatcher {
    /// Create a dispatcher.
    pub fn new(
        broker: Arc<dyn QueueBroker>,
        processor: Arc<dyn JobProcessor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            broker,
            processor,
            config,
            stalled_interval: DEFAULT_STALLED_INTERVAL,
            in_flight: InFlightTracker::new(),
        }
    }

    /// Set the interval between stalled-delivery sweeps.
    pub fn with_stalled_interval(mut self, interval: Duration) -> Self {
        self.stalled_interval = interval;
        self
    }

    /// Tracker of deliveries currently being handled.
    pub fn in_flight(&self) -> InFlightTracker {
        self.in_flight.clone()
    }

    /// Fetch and dispatch until `cancel` flips to `true`. Returns as soon as
    /// fetching stops; spawned deliveries keep running and are tracked by
    /// [`in_flight`](Self::in_flight).
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) {
        info!(
            queue = %self.broker.queue_name(),
            concurrency = self.config.concurrency,
            poll_interval_ms = self.config.poll_interval_ms,
            "Dispatcher started"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let poll_interval = self.config.poll_interval();
        let mut stalled_ticker = tokio::time::interval(self.stalled_interval);
        stalled_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *cancel.borrow() {
                break;
            }

            let permit = tokio::select! {
                biased;
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                    continue;
                }
                _ = stalled_ticker.tick() => {
                    self.recover_stalled().await;
                    continue;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.broker.fetch_next().await {
                Ok(Some(delivery)) => self.spawn_delivery(delivery, permit),
                Ok(None) => {
                    drop(permit);
                    if pause(&mut cancel, poll_interval).await {
                        break;
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(error = %e, "Failed to fetch job");
                    if pause(&mut cancel, poll_interval).await {
                        break;
                    }
                }
            }
        }

        info!(
            queue = %self.broker.queue_name(),
            in_flight = self.in_flight.count(),
            "Dispatcher stopped fetching"
        );
    }

    fn spawn_delivery(&self, delivery: Delivery, permit: OwnedSemaphorePermit) {
        let guard = self.in_flight.begin();
        let broker = Arc::clone(&self.broker);
        let processor = Arc::clone(&self.processor);
        let discard_invalid = self.config.discard_invalid_payloads;

        tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;
            handle_delivery(broker.as_ref(), processor.as_ref(), delivery, discard_invalid).await;
        });
    }

    async fn recover_stalled(&self) {
        match self.broker.recover_stalled().await {
            Ok(ids) => {
                for id in ids {
                    warn!(broker_id = %id, "Job stalled, returned to queue");
                }
            }
            Err(e) => error!(error = %e, "Stalled job sweep failed"),
        }
    }
}

/// Sleep for `duration` unless cancelled first. Returns whether to stop.
async fn pause(cancel: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        changed = cancel.changed() => changed.is_err() || *cancel.borrow(),
        _ = tokio::time::sleep(duration) => false,
    }
}

fn transition(delivery: &Delivery, state: DeliveryState) {
    debug!(broker_id = %delivery.id, attempt = delivery.attempt(), state = %state, "Delivery state");
}

/// Validate, process, and report one delivery.
pub async fn handle_delivery(
    broker: &dyn QueueBroker,
    processor: &dyn JobProcessor,
    delivery: Delivery,
    discard_invalid: bool,
) -> DeliveryOutcome {
    let started = Instant::now();
    transition(&delivery, DeliveryState::Dequeued);

    transition(&delivery, DeliveryState::Validating);
    let job = match validator::validate(&delivery.payload) {
        Ok(job) => {
            transition(&delivery, DeliveryState::Validated);
            job
        }
        Err(e) => {
            transition(&delivery, DeliveryState::Rejected);
            let job_id = delivery
                .payload
                .get("job_id")
                .and_then(|v| v.as_str())
                .unwrap_or("-")
                .to_string();
            return report_failure(
                broker,
                &delivery,
                &job_id,
                JobFailure::Validation(e),
                discard_invalid,
                started,
            )
            .await;
        }
    };

    info!(
        job_id = %job.job_id,
        broker_id = %delivery.id,
        attempt = delivery.attempt(),
        company_id = %job.company_id,
        conversation_id = %job.conversation_id,
        channel = %job.channel,
        "Job active"
    );
    transition(&delivery, DeliveryState::Processing);

    match processor.process(&job).await {
        Ok(()) => {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match broker.complete(&delivery).await {
                Ok(()) => {
                    transition(&delivery, DeliveryState::Completed);
                    info!(
                        job_id = %job.job_id,
                        broker_id = %delivery.id,
                        attempt = delivery.attempt(),
                        elapsed_ms,
                        "Job completed"
                    );
                    DeliveryOutcome::Completed
                }
                Err(e) => {
                    error!(
                        job_id = %job.job_id,
                        broker_id = %delivery.id,
                        error = %e,
                        "Failed to mark job as completed"
                    );
                    DeliveryOutcome::Unreported
                }
            }
        }
        Err(failure) => {
            report_failure(broker, &delivery, &job.job_id, failure, false, started).await
        }
    }
}

async fn report_failure(
    broker: &dyn QueueBroker,
    delivery: &Delivery,
    job_id: &str,
    failure: JobFailure,
    discard: bool,
    started: Instant,
) -> DeliveryOutcome {
    let reason = failure.to_string();
    let elapsed_ms = started.elapsed().as_millis() as u64;

    if discard && matches!(failure, JobFailure::Validation(_)) {
        return match broker.discard(delivery, &reason).await {
            Ok(()) => {
                transition(delivery, DeliveryState::Failed);
                warn!(
                    job_id,
                    broker_id = %delivery.id,
                    reason = %reason,
                    "Invalid job discarded"
                );
                DeliveryOutcome::Discarded
            }
            Err(e) => {
                error!(job_id, broker_id = %delivery.id, error = %e, "Failed to discard job");
                DeliveryOutcome::Unreported
            }
        };
    }

    match broker.fail(delivery, &reason).await {
        Ok(FailOutcome::Retrying { attempt, delay }) => {
            transition(delivery, DeliveryState::Failed);
            warn!(
                job_id,
                broker_id = %delivery.id,
                attempt,
                max_attempts = delivery.options.attempts,
                retry_in_ms = delay.as_millis() as u64,
                elapsed_ms,
                kind = failure.kind(),
                status = failure.status(),
                reason = %reason,
                "Job failed, retry scheduled"
            );
            DeliveryOutcome::Retrying { attempt, delay }
        }
        Ok(FailOutcome::Exhausted { attempts }) => {
            transition(delivery, DeliveryState::Failed);
            error!(
                job_id,
                broker_id = %delivery.id,
                attempts,
                elapsed_ms,
                kind = failure.kind(),
                status = failure.status(),
                reason = %reason,
                "Job failed, retries exhausted"
            );
            DeliveryOutcome::Exhausted { attempts }
        }
        Err(e) => {
            error!(
                job_id,
                broker_id = %delivery.id,
                error = %e,
                reason = %reason,
                "Failed to report job failure"
            );
            DeliveryOutcome::Unreported
        }
    }
}
