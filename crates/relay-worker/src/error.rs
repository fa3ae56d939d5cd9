//! Per-job failure taxonomy.
//!
//! Every failure is reported to the broker as a string reason (its
//! `Display`); the variant decides log fields and, for validation failures,
//! whether the retry budget is spent.

use thiserror::Error;

use crate::validator::ValidationError;

/// Why one delivery attempt failed.
#[derive(Debug, Error)]
pub enum JobFailure {
    /// The payload failed the structural check.
    #[error("invalid job payload: {0}")]
    Validation(#[from] ValidationError),

    /// The downstream service answered with a non-2xx status.
    #[error("downstream returned HTTP {status}: {body}")]
    DownstreamHttp {
        /// Response status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },

    /// The request was sent but no response arrived (timeout, refused
    /// connection, transport error).
    #[error("downstream unreachable: {source}")]
    DownstreamUnreachable {
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// The request could not be built, e.g. a malformed target URL.
    #[error("could not build downstream request: {source}")]
    RequestConstruction {
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// Anything else, passed through unchanged.
    #[error("{0}")]
    Unknown(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl JobFailure {
    /// Wrap an unclassified error.
    pub fn unknown(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Unknown(Box::new(err))
    }

    /// Short label used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::DownstreamHttp { .. } => "downstream_http",
            Self::DownstreamUnreachable { .. } => "downstream_unreachable",
            Self::RequestConstruction { .. } => "request_construction",
            Self::Unknown(_) => "unknown",
        }
    }

    /// HTTP status of the downstream response, if one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::DownstreamHttp { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_failure_message_embeds_status_and_body() {
        let failure = JobFailure::DownstreamHttp {
            status: 503,
            body: r#"{"error":"overloaded"}"#.to_string(),
        };
        let message = failure.to_string();
        assert!(message.contains("503"));
        assert!(message.contains("overloaded"));
        assert_eq!(failure.status(), Some(503));
        assert_eq!(failure.kind(), "downstream_http");
    }

    #[test]
    fn test_validation_failure_wraps_reason() {
        let failure = JobFailure::from(ValidationError::MissingField("message"));
        assert_eq!(
            failure.to_string(),
            "invalid job payload: missing required field 'message'"
        );
        assert_eq!(failure.status(), None);
    }

    #[test]
    fn test_unknown_failure_displays_inner_error() {
        let inner = std::io::Error::other("socket closed mid-body");
        let failure = JobFailure::unknown(inner);
        assert_eq!(failure.to_string(), "socket closed mid-body");
        assert_eq!(failure.kind(), "unknown");
    }
}
