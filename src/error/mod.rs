//! Error types for qbridge.

use serde_json::Value;
use thiserror::Error;

use crate::types::{OperationResult, ResultEnvelope, StatusCode};

/// Result type for qbridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for qbridge.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// Resource already exists, or is missing where it must pre-exist.
    #[error("{0}")]
    Conflict(String),

    /// Delivery mode is neither push nor pull.
    #[error("This type used : \"{0}\", is not a valid type use push or pull.")]
    InvalidMode(String),

    /// Failure reported by the queue backend.
    #[error("{message}")]
    Backend {
        /// HTTP-like code reported by the backend, if any.
        code: Option<u16>,
        /// Human-readable reason.
        message: String,
    },

    /// Topic not found in the backend.
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    /// Subscription not found in the backend.
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// Task queue not found in the backend.
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Resource already exists in the backend.
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    /// Unknown or already acknowledged ack id.
    #[error("Invalid ack id: {0}")]
    InvalidAckId(String),

    /// Push request failed identity verification.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error talking to a remote backend.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Validation error types.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Topic or subscription name violates the resource naming rules.
    #[error("The Resource name (topic or subscription) has not a valid format see https://cloud.google.com/pubsub/docs/admin#resource_names for more information.")]
    InvalidResourceName(String),

    /// Task queue name violates the queue naming rules.
    #[error("Invalid queue name \"{name}\": {reason}")]
    InvalidQueueName {
        /// Offending name.
        name: String,
        /// Reason for invalidity.
        reason: String,
    },

    /// Decoded payload exceeds the configured limit.
    #[error("Message too large: {size} bytes (max: {max} bytes)")]
    MessageTooLarge {
        /// Actual payload size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
}

impl Error {
    /// Build a backend error from a raw error text, unwrapping JSON-structured bodies.
    ///
    /// Backends frequently report failures as JSON, either flat
    /// (`{"message": "...", "code": 3}`) or in the Google API shape
    /// (`{"error": {"code": 400, "message": "..."}}`). The nested `message`
    /// wins when present, otherwise the raw text is kept as-is.
    pub fn backend(code: Option<u16>, raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let parsed = serde_json::from_str::<Value>(&raw).ok();
        let nested = parsed.as_ref().and_then(|v| v.get("error").or(Some(v)));

        let message = nested
            .and_then(|v| v.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(raw);

        let code = code.or_else(|| {
            nested
                .and_then(|v| v.get("code"))
                .and_then(Value::as_u64)
                .and_then(|c| u16::try_from(c).ok())
        });

        Error::Backend { code, message }
    }

    /// HTTP status code this error maps to in the response envelope.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::Backend { code: Some(code), .. } => StatusCode::from_u16(*code)
                .ok()
                .filter(|s| s.is_client_error() || s.is_server_error())
                .unwrap_or(StatusCode::CONFLICT),
            _ => StatusCode::CONFLICT,
        }
    }

    /// Whether the backend reported that the resource already exists.
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Error::AlreadyExists(_) | Error::Backend { code: Some(409), .. }
        )
    }

    /// Whether the error originated in a backend call rather than local checks.
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            Error::Backend { .. }
                | Error::TopicNotFound(_)
                | Error::SubscriptionNotFound(_)
                | Error::QueueNotFound(_)
                | Error::AlreadyExists(_)
                | Error::InvalidAckId(_)
                | Error::Http(_)
        )
    }
}

impl From<Error> for OperationResult {
    fn from(err: Error) -> Self {
        OperationResult::Error(ResultEnvelope::new(
            err.status_code(),
            Value::String(err.to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_extracts_flat_message() {
        let err = Error::backend(None, r#"{"message":"relative uri is invalid","code":3}"#);
        match err {
            Error::Backend { code, message } => {
                assert_eq!(message, "relative uri is invalid");
                assert_eq!(code, Some(3));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_backend_error_extracts_google_api_message() {
        let err = Error::backend(
            Some(400),
            r#"{"error":{"code":400,"message":"Queue name is invalid","status":"INVALID_ARGUMENT"}}"#,
        );
        assert_eq!(err.to_string(), "Queue name is invalid");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_backend_error_keeps_raw_text() {
        let err = Error::backend(None, "connection reset by peer");
        assert_eq!(err.to_string(), "connection reset by peer");
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_grpc_code_falls_back_to_conflict() {
        let err = Error::backend(Some(3), "bad argument");
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_error_into_envelope() {
        let result: OperationResult = Error::InvalidMode("bogus".to_string()).into();
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["error"]["code"], 409);
        assert_eq!(json["error"]["status"], "HTTP_CONFLICT");
        assert!(json["error"]["message"]
            .as_str()
            .unwrap()
            .contains("is not a valid type"));
    }

    #[test]
    fn test_forbidden_maps_to_403() {
        assert_eq!(
            Error::Forbidden("bad token".to_string()).status_code(),
            StatusCode::FORBIDDEN
        );
    }
}
