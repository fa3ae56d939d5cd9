//! Completed/failed retention configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::queue::{KeepJobs, RetentionPolicy};

/// Bounds of the completed and failed record sets kept by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Completed records kept, newest first.
    #[serde(default = "default_completed_count")]
    pub completed_count: usize,
    /// Maximum age of a completed record in seconds.
    #[serde(default = "default_completed_age")]
    pub completed_age_seconds: u64,
    /// Failed records kept, newest first.
    #[serde(default = "default_failed_count")]
    pub failed_count: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            completed_count: default_completed_count(),
            completed_age_seconds: default_completed_age(),
            failed_count: default_failed_count(),
        }
    }
}

impl RetentionConfig {
    /// Convert to the policy handed to the broker.
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            completed: KeepJobs {
                count: self.completed_count,
                age: Some(Duration::from_secs(self.completed_age_seconds)),
            },
            failed: KeepJobs {
                count: self.failed_count,
                age: None,
            },
        }
    }
}

fn default_completed_count() -> usize {
    100
}

fn default_completed_age() -> u64 {
    24 * 3600
}

fn default_failed_count() -> usize {
    1000
}
