//! Broker-side types: deliveries, retry options, and retention records.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Backoff between attempts, in milliseconds.
///
/// Serialized the way BullMQ producers write it:
/// `{"type":"exponential","delay":2000}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackoffPolicy {
    /// Same delay before every retry.
    Fixed {
        /// Delay in milliseconds.
        delay: u64,
    },
    /// `delay * 2^(attempt - 1)` before the retry following `attempt`.
    Exponential {
        /// Base delay in milliseconds.
        delay: u64,
    },
}

impl BackoffPolicy {
    /// Delay before retrying after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let millis = match *self {
            Self::Fixed { delay } => delay,
            Self::Exponential { delay } => {
                let exponent = attempt.saturating_sub(1).min(32);
                delay.saturating_mul(1u64 << exponent)
            }
        };
        Duration::from_millis(millis)
    }
}

/// Per-job retry options stored alongside the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Total attempts allowed, including the first.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Backoff between attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffPolicy>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            backoff: None,
        }
    }
}

impl JobOptions {
    /// Options used by the inbound-message producer: three attempts with
    /// exponential backoff from two seconds.
    pub fn producer_default() -> Self {
        Self {
            attempts: 3,
            backoff: Some(BackoffPolicy::Exponential { delay: 2000 }),
        }
    }

    /// Decide what happens after a failed attempt, given the attempts made
    /// before it.
    pub fn after_failure(&self, attempts_made_before: u32) -> FailOutcome {
        let attempt = attempts_made_before + 1;
        if attempt < self.attempts.max(1) {
            FailOutcome::Retrying {
                attempt,
                delay: self
                    .backoff
                    .map(|b| b.delay_for(attempt))
                    .unwrap_or(Duration::ZERO),
            }
        } else {
            FailOutcome::Exhausted { attempts: attempt }
        }
    }
}

fn default_attempts() -> u32 {
    1
}

/// Result of reporting a failed attempt to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The job was scheduled for another attempt.
    Retrying {
        /// The attempt that just failed (1-based).
        attempt: u32,
        /// Delay before it becomes available again.
        delay: Duration,
    },
    /// The retry budget is spent; the job moved to the failed set.
    Exhausted {
        /// Attempts made in total.
        attempts: u32,
    },
}

/// One dequeued job, owned by a single worker until reported.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned identifier.
    pub id: String,
    /// Raw payload, not yet validated.
    pub payload: Value,
    /// Attempts made before this one.
    pub attempts_made: u32,
    /// Retry options stored with the job.
    pub options: JobOptions,
}

impl Delivery {
    /// The 1-based number of this attempt.
    pub fn attempt(&self) -> u32 {
        self.attempts_made + 1
    }
}

/// The two bounded record sets kept by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetentionSet {
    /// Successfully processed jobs.
    Completed,
    /// Jobs whose retry budget is spent.
    Failed,
}

impl fmt::Display for RetentionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Entry of a retention set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Broker-assigned identifier.
    pub id: String,
    /// Payload as enqueued.
    pub payload: Value,
    /// Attempts made in total.
    pub attempts_made: u32,
    /// When the job reached the set.
    pub finished_at: Option<DateTime<Utc>>,
    /// Reason of the last failure (failed set only).
    pub failed_reason: Option<String>,
}

/// Sizes of the queue's lists and sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    /// Ready to be fetched.
    pub waiting: u64,
    /// Fetched and not yet reported.
    pub active: u64,
    /// Waiting for their backoff to elapse.
    pub delayed: u64,
    /// In the completed retention set.
    pub completed: u64,
    /// In the failed retention set.
    pub failed: u64,
}

/// Bound of one retention set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepJobs {
    /// Newest entries kept.
    pub count: usize,
    /// Maximum age of an entry, if bounded by age.
    pub age: Option<Duration>,
}

/// Retention bounds handed to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Completed set bound.
    pub completed: KeepJobs,
    /// Failed set bound.
    pub failed: KeepJobs,
}

impl RetentionPolicy {
    /// Bound of the given set.
    pub fn for_set(&self, set: RetentionSet) -> KeepJobs {
        match set {
            RetentionSet::Completed => self.completed,
            RetentionSet::Failed => self.failed,
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            completed: KeepJobs {
                count: 100,
                age: Some(Duration::from_secs(24 * 3600)),
            },
            failed: KeepJobs {
                count: 1000,
                age: None,
            },
        }
    }
}
