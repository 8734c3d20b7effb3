//! Common data types for qbridge.

pub mod resource;
pub mod validation;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::Error;

pub use axum::http::StatusCode;
pub use resource::ResourceName;

/// Backend-assigned message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    /// Create a new random message ID.
    pub fn new() -> Self {
        MessageId(Uuid::new_v4().to_string())
    }

    /// Create a message ID from a string.
    pub fn from_string(s: String) -> Self {
        MessageId(s)
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message pulled from a subscription.
///
/// Immutable once received. The `ack_id` is the only handle the backend
/// accepts for acknowledgement; re-publishing produces a new `message_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Acknowledgement handle.
    pub ack_id: String,
    /// Message identity.
    pub message_id: MessageId,
    /// Raw payload.
    pub data: Vec<u8>,
    /// Message attributes.
    pub attributes: HashMap<String, String>,
    /// Time the message was published.
    pub publish_time: DateTime<Utc>,
}

/// Options passed through to a backend pull call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PullOptions {
    /// Maximum number of messages to return.
    pub max_messages: u32,
    /// Return immediately when no messages are available.
    pub return_immediately: bool,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            max_messages: 100,
            return_immediately: true,
        }
    }
}

/// How a subscription delivers messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Consumer actively fetches messages.
    Pull,
    /// Backend delivers messages to an HTTP endpoint.
    Push,
}

impl DeliveryMode {
    /// Wire name of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Pull => "pull",
            DeliveryMode::Push => "push",
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pull" => Ok(DeliveryMode::Pull),
            "push" => Ok(DeliveryMode::Push),
            other => Err(Error::InvalidMode(other.to_string())),
        }
    }
}

/// HTTP method used by the task dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// POST, the only method tasks are created with.
    Post,
}

/// HTTP request the task-queue backend sends when the task is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskHttpRequest {
    /// Target URI relative to the application root, e.g. `/tasks/consume`.
    pub relative_uri: String,
    /// HTTP method.
    pub http_method: HttpMethod,
    /// Request headers.
    pub headers: HashMap<String, String>,
    /// Request body.
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
}

/// A deferred HTTP-dispatch unit held in a task queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Backend-assigned task name, empty until created.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Request sent on dispatch.
    pub app_engine_http_request: TaskHttpRequest,
}

impl Task {
    /// Build a JSON POST task targeting `relative_uri` with `body` as payload.
    pub fn post_json(relative_uri: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        let mut headers = HashMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());

        Self {
            name: String::new(),
            app_engine_http_request: TaskHttpRequest {
                relative_uri: relative_uri.into(),
                http_method: HttpMethod::Post,
                headers,
                body: body.into(),
            },
        }
    }
}

/// Body of a push delivery as sent by the Pub/Sub push dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    /// The delivered message.
    pub message: PushMessage,
    /// Subscription the message was delivered through.
    #[serde(default)]
    pub subscription: String,
}

/// Message inside a push delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    /// Message data (base64 on the wire).
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Message attributes.
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    /// Message ID.
    #[serde(default)]
    pub message_id: Option<String>,
    /// Publish timestamp.
    #[serde(default)]
    pub publish_time: Option<String>,
}

/// Serde helpers for base64-encoded byte fields.
pub mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize bytes as a standard base64 string.
    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    /// Deserialize a standard base64 string into bytes.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}

/// Envelope body shared by successful and failed operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    /// HTTP-style status code.
    pub code: u16,
    /// Structured payload on success, reason on failure.
    pub message: Value,
    /// Status label, e.g. `HTTP_CREATED`.
    pub status: String,
    /// Detail from the operation a summary was built from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Box<ResultEnvelope>>,
}

impl ResultEnvelope {
    /// Build an envelope with a status label derived from `code`.
    pub fn new(code: StatusCode, message: Value) -> Self {
        Self {
            code: code.as_u16(),
            message,
            status: status_label(code),
            info: None,
        }
    }

    /// Attach the envelope this one summarizes.
    pub fn with_info(mut self, info: ResultEnvelope) -> Self {
        self.info = Some(Box::new(info));
        self
    }

    /// Status code as a typed value.
    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

/// `HTTP_<REASON>` label for a status code, e.g. `HTTP_CONFLICT`.
pub fn status_label(code: StatusCode) -> String {
    match code.canonical_reason() {
        Some(reason) => {
            let reason: String = reason
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == ' ' || *c == '-')
                .map(|c| if c == ' ' || c == '-' { '_' } else { c.to_ascii_uppercase() })
                .collect();
            format!("HTTP_{}", reason)
        }
        None => format!("HTTP_{}", code.as_u16()),
    }
}

/// Discriminated outcome of an admin, publish or consume operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "EnvelopeRepr", into = "EnvelopeRepr")]
pub enum OperationResult {
    /// Success, serialized flat as `{code, message, status}`.
    Info(ResultEnvelope),
    /// Failure, serialized as `{error: {code, message, status}}`.
    Error(ResultEnvelope),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum EnvelopeRepr {
    Error { error: ResultEnvelope },
    Info(ResultEnvelope),
}

impl From<EnvelopeRepr> for OperationResult {
    fn from(repr: EnvelopeRepr) -> Self {
        match repr {
            EnvelopeRepr::Error { error } => OperationResult::Error(error),
            EnvelopeRepr::Info(info) => OperationResult::Info(info),
        }
    }
}

impl From<OperationResult> for EnvelopeRepr {
    fn from(result: OperationResult) -> Self {
        match result {
            OperationResult::Error(error) => EnvelopeRepr::Error { error },
            OperationResult::Info(info) => EnvelopeRepr::Info(info),
        }
    }
}

impl OperationResult {
    /// Successful result.
    pub fn info(code: StatusCode, message: Value) -> Self {
        OperationResult::Info(ResultEnvelope::new(code, message))
    }

    /// Failed result.
    pub fn error(code: StatusCode, message: impl Into<String>) -> Self {
        OperationResult::Error(ResultEnvelope::new(code, Value::String(message.into())))
    }

    /// Whether this is a success.
    pub fn is_info(&self) -> bool {
        matches!(self, OperationResult::Info(_))
    }

    /// The envelope regardless of outcome.
    pub fn envelope(&self) -> &ResultEnvelope {
        match self {
            OperationResult::Info(e) | OperationResult::Error(e) => e,
        }
    }

    /// HTTP status the boundary should respond with.
    pub fn status_code(&self) -> StatusCode {
        self.envelope().status_code()
    }
}

impl<T: Into<OperationResult>> From<crate::Result<T>> for OperationResult {
    fn from(result: crate::Result<T>) -> Self {
        match result {
            Ok(value) => value.into(),
            Err(err) => err.into(),
        }
    }
}

/// Canonical names produced by a topic/subscription operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceNames {
    /// `projects/{project}/topics/{topic}`
    pub topic_name: String,
    /// `projects/{project}/subscriptions/{subscription}`
    pub subscription_name: String,
    /// Owning project.
    pub project_id: String,
}

impl From<ResourceNames> for OperationResult {
    fn from(names: ResourceNames) -> Self {
        OperationResult::info(
            StatusCode::CREATED,
            json!({
                "topicName": names.topic_name,
                "subscriptionName": names.subscription_name,
                "projectId": names.project_id,
            }),
        )
    }
}

/// Receipt for a created task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReceipt {
    /// Canonical queue name.
    pub queue_name: String,
    /// Backend-assigned task name.
    pub task_name: String,
    /// Owning project.
    pub project_id: String,
}

impl From<TaskReceipt> for OperationResult {
    fn from(receipt: TaskReceipt) -> Self {
        OperationResult::info(
            StatusCode::CREATED,
            json!({
                "queueName": receipt.queue_name,
                "taskName": receipt.task_name,
                "projectId": receipt.project_id,
            }),
        )
    }
}
