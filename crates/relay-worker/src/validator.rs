//! Structural check of dequeued payloads.
//!
//! Only shape is checked: required fields present and strings, `metadata`
//! absent or an object. Content is not interpreted.

use serde_json::{Map, Value};
use thiserror::Error;

use relay_core::types::job::Job;

/// Fields every job must carry as strings.
const REQUIRED_STRING_FIELDS: [&str; 6] = [
    "job_id",
    "company_id",
    "conversation_id",
    "message",
    "channel",
    "created_at",
];

/// The first structural check a payload failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The payload is not a JSON object.
    #[error("payload is not an object")]
    NotAnObject,
    /// A required field is absent.
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    /// A required field is present but not a string.
    #[error("field '{0}' is not a string")]
    NotAString(&'static str),
    /// `metadata` is present but not an object.
    #[error("field 'metadata' is not an object")]
    MetadataNotAnObject,
}

/// Check the payload shape and build the typed job.
pub fn validate(payload: &Value) -> Result<Job, ValidationError> {
    let object = payload.as_object().ok_or(ValidationError::NotAnObject)?;

    let [job_id, company_id, conversation_id, message, channel, created_at] =
        REQUIRED_STRING_FIELDS.map(|field| required_string(object, field));
    let (job_id, company_id, conversation_id, message, channel, created_at) = (
        job_id?,
        company_id?,
        conversation_id?,
        message?,
        channel?,
        created_at?,
    );

    let metadata = match object.get("metadata") {
        None => None,
        Some(Value::Object(map)) => Some(map.clone()),
        Some(_) => return Err(ValidationError::MetadataNotAnObject),
    };

    let extra = object
        .iter()
        .filter(|(key, _)| {
            key.as_str() != "metadata" && !REQUIRED_STRING_FIELDS.contains(&key.as_str())
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    Ok(Job {
        job_id,
        company_id,
        conversation_id,
        message,
        channel,
        metadata,
        created_at,
        extra,
    })
}

/// Whether the payload passes [`validate`].
pub fn is_valid(payload: &Value) -> bool {
    validate(payload).is_ok()
}

fn required_string(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<String, ValidationError> {
    match object.get(field) {
        None => Err(ValidationError::MissingField(field)),
        Some(Value::String(value)) => Ok(value.clone()),
        Some(_) => Err(ValidationError::NotAString(field)),
    }
}
