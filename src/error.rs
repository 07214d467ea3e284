/// Error types shared across ingestion, storage and the HTTP surface
use std::path::PathBuf;
use thiserror::Error;

/// Failures reported by the radio stack. All of them are retryable from a
/// session's point of view.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("failed to subscribe to {channel}: {reason}")]
    Subscribe { channel: String, reason: String },

    #[error("write to {channel} failed: {reason}")]
    Write { channel: String, reason: String },

    #[error("bluetooth adapter error: {0}")]
    Adapter(String),
}

impl From<bluer::Error> for TransportError {
    fn from(err: bluer::Error) -> Self {
        TransportError::Adapter(err.to_string())
    }
}

/// A notification payload that could not be turned into a record
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,
}

/// Durable log write failure. The next record for the same log retries.
#[derive(Debug, Error)]
#[error("failed to append to {}: {source}", .path.display())]
pub struct StorageError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Annotation body rejected before it reached the log
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("request body must be a JSON object")]
    NotAnObject,

    #[error("Missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    #[error("field '{0}' must be a string")]
    InvalidField(&'static str),
}

#[derive(Debug, Error)]
pub enum AnnotationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Session parameters that can never lead to a working connection
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("invalid session parameters: {0}")]
    InvalidParameters(String),
}
