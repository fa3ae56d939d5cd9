//! Core type definitions used across the relay workspace.

pub mod job;
pub mod queue;

pub use job::Job;
pub use queue::{
    BackoffPolicy, Delivery, FailOutcome, JobOptions, JobRecord, KeepJobs, QueueCounts,
    RetentionPolicy, RetentionSet,
};
