//! Redis key builders for one queue.
//!
//! The layout follows BullMQ's (`<prefix>:<queue>:wait`, `:active`, ...) so
//! that producers written against BullMQ and this relay address the same
//! lists and hashes.

/// Key builder for one queue under one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    /// `<prefix>:<queue>:`, shared by every key of the queue.
    base: String,
}

impl QueueKeys {
    /// Create a key builder.
    pub fn new(prefix: &str, queue: &str) -> Self {
        Self {
            base: format!("{prefix}:{queue}:"),
        }
    }

    /// Prefix of per-job keys, used by scripts to build `job` and `lock`.
    pub fn job_prefix(&self) -> &str {
        &self.base
    }

    /// List of ids ready to be fetched.
    pub fn wait(&self) -> String {
        format!("{}wait", self.base)
    }

    /// List of ids currently locked by a worker.
    pub fn active(&self) -> String {
        format!("{}active", self.base)
    }

    /// Sorted set of ids waiting for their backoff, scored by ready-at ms.
    pub fn delayed(&self) -> String {
        format!("{}delayed", self.base)
    }

    /// Completed retention set, scored by finished-at ms.
    pub fn completed(&self) -> String {
        format!("{}completed", self.base)
    }

    /// Failed retention set, scored by finished-at ms.
    pub fn failed(&self) -> String {
        format!("{}failed", self.base)
    }

    /// Counter for generated ids.
    pub fn id_counter(&self) -> String {
        format!("{}id", self.base)
    }

    /// Hash holding one job's payload and bookkeeping.
    pub fn job(&self, id: &str) -> String {
        format!("{}{id}", self.base)
    }
}
