//! The inbound-message job carried by the queue.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Channel tag used when the producer does not name one.
pub const DEFAULT_CHANNEL: &str = "whatsapp";

/// One inbound message routed from the queue to the processing service.
///
/// Immutable once dequeued: the relay forwards it verbatim and never
/// re-enqueues a modified copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier, also used as the broker id for idempotency.
    pub job_id: String,
    /// Tenant identifier.
    pub company_id: String,
    /// Conversation (thread) identifier.
    pub conversation_id: String,
    /// Message text.
    pub message: String,
    /// Origin channel tag.
    pub channel: String,
    /// Opaque producer metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    /// ISO-8601 creation timestamp.
    pub created_at: String,
    /// Producer fields the relay does not interpret, forwarded as received.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Job {
    /// Build a job on the default channel, stamped with the current time.
    pub fn new(
        job_id: impl Into<String>,
        company_id: impl Into<String>,
        conversation_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            company_id: company_id.into(),
            conversation_id: conversation_id.into(),
            message: message.into(),
            channel: DEFAULT_CHANNEL.to_string(),
            metadata: None,
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            extra: Map::new(),
        }
    }

    /// Set the origin channel.
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Attach producer metadata.
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Override the creation timestamp.
    pub fn with_created_at(mut self, created_at: impl Into<String>) -> Self {
        self.created_at = created_at.into();
        self
    }

    /// The job as the JSON object sent on the wire.
    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}
