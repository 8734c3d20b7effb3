//! Consumer dispatch: decode deliveries, invoke the handler, acknowledge or requeue.
//!
//! A delivery moves through `Received -> Decoding -> Processing ->
//! {Acknowledged | Requeued} -> Done`. Payloads without usable JSON structure
//! are dropped before the handler runs. On the pull path the acknowledgement
//! discipline is chosen by [`AckMode`].

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::METRICS;
use crate::transport::Transport;
use crate::types::validation::validate_message_size;
use crate::types::{OperationResult, PullOptions, ReceivedMessage, StatusCode};
use crate::{Error, Result};

/// Application logic invoked once per usable message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a decoded message. The returned value becomes the push or task
    /// response message. An error triggers requeue on the pull path.
    async fn handle(&self, message: Value) -> anyhow::Result<Value>;
}

/// Handler backed by an async closure.
pub struct FnHandler<F>(F);

impl<F, Fut> FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    /// Wrap `f` as a handler.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, message: Value) -> anyhow::Result<Value> {
        (self.0)(message).await
    }
}

/// Handler returning the decoded message unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn handle(&self, message: Value) -> anyhow::Result<Value> {
        Ok(message)
    }
}

/// When a pulled message is acknowledged relative to processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Acknowledge on receipt, then process. A failed message is re-published
    /// to its origin topic as a new message.
    #[default]
    BeforeProcessing,
    /// Acknowledge only after the handler succeeds. A failed message is
    /// released for redelivery by the backend; nothing is re-published.
    AfterProcessing,
}

/// Limits applied to every delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceLimits {
    /// Maximum raw payload size in bytes. `None` is unlimited.
    pub max_payload_bytes: Option<usize>,
    /// Maximum handler run time. Exceeding it counts as a handler failure.
    pub handler_timeout: Option<Duration>,
}

/// Dispatch options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchOptions {
    /// Pull acknowledgement discipline.
    pub ack_mode: AckMode,
    /// Per-delivery limits.
    pub limits: ResourceLimits,
}

/// A single delivery handed to the dispatcher.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// Payload pushed by the backend, identity already verified.
    Push {
        /// Decoded message data.
        payload: Vec<u8>,
    },
    /// Message fetched from a subscription.
    Pull {
        /// The pulled message.
        message: ReceivedMessage,
    },
    /// Task-queue callback body.
    Task {
        /// Raw request body.
        body: Vec<u8>,
    },
}

impl Delivery {
    /// Metric label for the delivery kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Delivery::Push { .. } => "push",
            Delivery::Pull { .. } => "pull",
            Delivery::Task { .. } => "task",
        }
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> &[u8] {
        match self {
            Delivery::Push { payload } => payload,
            Delivery::Pull { message } => &message.data,
            Delivery::Task { body } => body,
        }
    }
}

/// Why a delivery never reached the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Not JSON, or JSON without usable structure.
    Unusable,
}

/// Result of running one delivery through decode and the handler.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    /// The handler succeeded with this value.
    Processed(Value),
    /// Dropped before the handler ran.
    Dropped(DropReason),
    /// The handler failed or timed out.
    Failed(String),
    /// Cancellation interrupted the handler.
    Cancelled,
}

/// Summary of one pull batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    /// Subscription the batch was pulled from.
    pub subscription: String,
    /// Messages returned by the pull call.
    pub received: usize,
    /// Messages the handler processed successfully.
    pub processed: usize,
    /// Messages dropped before the handler ran.
    pub dropped: usize,
    /// Messages whose handler failed or timed out.
    pub failed: usize,
    /// Messages re-published to the origin topic.
    pub requeued: usize,
    /// Messages released back to the backend for redelivery.
    pub released: usize,
    /// Acknowledge, requeue or release calls that failed.
    pub bookkeeping_failures: usize,
    /// Whether cancellation stopped the batch early.
    pub cancelled: bool,
}

impl From<BatchReport> for OperationResult {
    fn from(report: BatchReport) -> Self {
        OperationResult::info(
            StatusCode::OK,
            Value::String(format!(
                "Pull message for subscription '{}' was executed successfully.",
                report.subscription
            )),
        )
    }
}

/// Decode a payload, returning `None` when it has no usable structure.
///
/// Usable means a non-empty JSON object or array. Invalid JSON, `null`,
/// scalars and empty containers are all unusable.
pub fn decode_payload(payload: &[u8]) -> Option<Value> {
    match serde_json::from_slice::<Value>(payload).ok()? {
        Value::Object(map) if !map.is_empty() => Some(Value::Object(map)),
        Value::Array(items) if !items.is_empty() => Some(Value::Array(items)),
        _ => None,
    }
}

/// Routes deliveries to a [`MessageHandler`].
#[derive(Clone)]
pub struct Dispatcher {
    transport: Transport,
    handler: Arc<dyn MessageHandler>,
    options: DispatchOptions,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(
        transport: Transport,
        handler: Arc<dyn MessageHandler>,
        options: DispatchOptions,
    ) -> Self {
        Self {
            transport,
            handler,
            options,
        }
    }

    /// Dispatch options in effect.
    pub fn options(&self) -> &DispatchOptions {
        &self.options
    }

    /// Run one delivery through size check, decode and the handler.
    ///
    /// Returns `Err` only for an oversized payload.
    pub async fn process(
        &self,
        delivery: &Delivery,
        cancel: &CancellationToken,
    ) -> Result<MessageOutcome> {
        let kind = delivery.kind();
        let payload = delivery.payload();

        validate_message_size(payload.len(), self.options.limits.max_payload_bytes)
            .inspect_err(|_| {
                METRICS
                    .messages_dropped_total
                    .with_label_values(&[kind, "too_large"])
                    .inc();
            })?;

        let Some(decoded) = decode_payload(payload) else {
            debug!(delivery = kind, bytes = payload.len(), "Dropping payload without usable structure");
            METRICS
                .messages_dropped_total
                .with_label_values(&[kind, "unusable"])
                .inc();
            return Ok(MessageOutcome::Dropped(DropReason::Unusable));
        };

        let started = Instant::now();
        let handled = async {
            match self.options.limits.handler_timeout {
                Some(limit) => tokio::time::timeout(limit, self.handler.handle(decoded))
                    .await
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("handler timed out after {:?}", limit))),
                None => self.handler.handle(decoded).await,
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => MessageOutcome::Cancelled,
            result = handled => match result {
                Ok(value) => MessageOutcome::Processed(value),
                Err(e) => {
                    METRICS
                        .handler_failures_total
                        .with_label_values(&[kind])
                        .inc();
                    MessageOutcome::Failed(format!("{:#}", e))
                }
            },
        };

        METRICS
            .handler_latency_seconds
            .with_label_values(&[kind])
            .observe(started.elapsed().as_secs_f64());
        Ok(outcome)
    }

    /// Consume a verified push delivery.
    ///
    /// Success or a dropped payload answers 200 with the handler result (or
    /// `null`); a handler failure answers 409.
    pub async fn consume_push(&self, payload: Vec<u8>) -> OperationResult {
        self.respond(Delivery::Push { payload }).await
    }

    /// Consume a task-queue callback body, with the same contract as push.
    pub async fn consume_task(&self, body: Vec<u8>) -> OperationResult {
        self.respond(Delivery::Task { body }).await
    }

    async fn respond(&self, delivery: Delivery) -> OperationResult {
        let kind = delivery.kind();
        match self.process(&delivery, &CancellationToken::new()).await {
            Ok(MessageOutcome::Processed(value)) => OperationResult::info(StatusCode::OK, value),
            Ok(MessageOutcome::Dropped(_)) => OperationResult::info(StatusCode::OK, Value::Null),
            Ok(MessageOutcome::Failed(message)) => {
                warn!(delivery = kind, error = %message, "Handler failed");
                OperationResult::error(StatusCode::CONFLICT, message)
            }
            Ok(MessageOutcome::Cancelled) => {
                OperationResult::error(StatusCode::CONFLICT, "Handler was cancelled")
            }
            Err(e) => e.into(),
        }
    }

    /// Pull one batch from `subscription` and dispatch every message.
    ///
    /// `topic` is the origin topic failed messages are re-published to. Each
    /// message is isolated: its failure never fails the batch. Only a failed
    /// pull call returns `Err`. Cancellation stops the batch between messages
    /// and interrupts a running handler; unprocessed messages are handed back
    /// to the backend.
    pub async fn consume_pull(
        &self,
        subscription: &str,
        topic: &str,
        options: &PullOptions,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let messages = self
            .transport
            .pull(subscription, options)
            .await
            .map_err(|e| Error::Conflict(e.to_string()))?;

        let mut report = BatchReport {
            subscription: subscription.to_string(),
            received: messages.len(),
            ..Default::default()
        };

        let mut pending = messages.into_iter();
        while let Some(message) = pending.next() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                self.release(subscription, &message, &mut report).await;
                break;
            }

            let stop = match self.options.ack_mode {
                AckMode::BeforeProcessing => {
                    self.ack_then_process(subscription, topic, message, cancel, &mut report)
                        .await
                }
                AckMode::AfterProcessing => {
                    self.process_then_ack(subscription, message, cancel, &mut report)
                        .await
                }
            };

            if stop {
                report.cancelled = true;
                break;
            }
        }

        for message in pending {
            self.release(subscription, &message, &mut report).await;
        }

        info!(
            subscription = %subscription,
            received = report.received,
            processed = report.processed,
            dropped = report.dropped,
            failed = report.failed,
            requeued = report.requeued,
            released = report.released,
            cancelled = report.cancelled,
            "Pull batch complete"
        );
        Ok(report)
    }

    /// Returns `true` when cancellation interrupted the handler.
    async fn ack_then_process(
        &self,
        subscription: &str,
        topic: &str,
        message: ReceivedMessage,
        cancel: &CancellationToken,
        report: &mut BatchReport,
    ) -> bool {
        if let Err(e) = self.transport.acknowledge(subscription, &message.ack_id).await {
            // Unacknowledged messages are redelivered by the backend.
            warn!(subscription = %subscription, message_id = %message.message_id, error = %e, "Acknowledge failed, skipping message");
            report.bookkeeping_failures += 1;
            return false;
        }

        let message_id = message.message_id.clone();
        let delivery = Delivery::Pull { message };
        let outcome = match self.process(&delivery, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(subscription = %subscription, message_id = %message_id, error = %e, "Dropping message");
                report.dropped += 1;
                return false;
            }
        };

        let Delivery::Pull { message } = delivery else {
            return false;
        };

        match outcome {
            MessageOutcome::Processed(_) => {
                report.processed += 1;
                false
            }
            MessageOutcome::Dropped(_) => {
                report.dropped += 1;
                false
            }
            MessageOutcome::Failed(reason) => {
                warn!(subscription = %subscription, message_id = %message_id, error = %reason, "Handler failed, requeueing message");
                report.failed += 1;
                self.requeue(subscription, topic, message.data, report).await;
                false
            }
            MessageOutcome::Cancelled => {
                debug!(subscription = %subscription, message_id = %message_id, "Handler cancelled, requeueing message");
                self.requeue(subscription, topic, message.data, report).await;
                true
            }
        }
    }

    /// Returns `true` when cancellation interrupted the handler.
    async fn process_then_ack(
        &self,
        subscription: &str,
        message: ReceivedMessage,
        cancel: &CancellationToken,
        report: &mut BatchReport,
    ) -> bool {
        let delivery = Delivery::Pull { message };
        let outcome = self.process(&delivery, cancel).await;
        let Delivery::Pull { message } = delivery else {
            return false;
        };

        let (ack, stop) = match outcome {
            Ok(MessageOutcome::Processed(_)) => {
                report.processed += 1;
                (true, false)
            }
            Ok(MessageOutcome::Dropped(_)) | Err(_) => {
                report.dropped += 1;
                (true, false)
            }
            Ok(MessageOutcome::Failed(reason)) => {
                warn!(subscription = %subscription, message_id = %message.message_id, error = %reason, "Handler failed, releasing message");
                report.failed += 1;
                (false, false)
            }
            Ok(MessageOutcome::Cancelled) => (false, true),
        };

        if ack {
            if let Err(e) = self.transport.acknowledge(subscription, &message.ack_id).await {
                warn!(subscription = %subscription, message_id = %message.message_id, error = %e, "Acknowledge failed");
                report.bookkeeping_failures += 1;
            }
        } else {
            self.release(subscription, &message, report).await;
        }

        stop
    }

    async fn requeue(
        &self,
        subscription: &str,
        topic: &str,
        data: Vec<u8>,
        report: &mut BatchReport,
    ) {
        match self.transport.requeue(subscription, topic, data).await {
            Ok(message_id) => {
                debug!(topic = %topic, message_id = %message_id, "Message requeued");
                report.requeued += 1;
            }
            Err(e) => {
                error!(topic = %topic, error = %e, "Failed to requeue message");
                report.bookkeeping_failures += 1;
            }
        }
    }

    async fn release(&self, subscription: &str, message: &ReceivedMessage, report: &mut BatchReport) {
        match self.transport.nack(subscription, &message.ack_id).await {
            Ok(()) => report.released += 1,
            Err(e) => {
                warn!(subscription = %subscription, message_id = %message.message_id, error = %e, "Failed to release message");
                report.bookkeeping_failures += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::InMemoryBackend;
    use crate::backend::{MessageTransport, PubSubAdmin};
    use serde_json::json;

    const TOPIC: &str = "projects/p/topics/jobs";
    const SUB: &str = "projects/p/subscriptions/jobs-sub";

    async fn setup(options: DispatchOptions, handler: Arc<dyn MessageHandler>) -> (Dispatcher, InMemoryBackend) {
        let backend = InMemoryBackend::new();
        backend.create_topic(TOPIC).await.unwrap();
        backend.create_subscription(TOPIC, SUB).await.unwrap();
        let transport = Transport::new(Arc::new(backend.clone()), "p");
        (Dispatcher::new(transport, handler, options), backend)
    }

    #[test]
    fn test_decode_payload() {
        assert_eq!(decode_payload(br#"{"a":1}"#), Some(json!({"a": 1})));
        assert_eq!(decode_payload(b"[1,2]"), Some(json!([1, 2])));
        assert_eq!(decode_payload(b"not json"), None);
        assert_eq!(decode_payload(b"null"), None);
        assert_eq!(decode_payload(b"42"), None);
        assert_eq!(decode_payload(b"\"text\""), None);
        assert_eq!(decode_payload(b"{}"), None);
        assert_eq!(decode_payload(b"[]"), None);
        assert_eq!(decode_payload(b"false"), None);
    }

    #[tokio::test]
    async fn test_push_returns_handler_result() {
        let (dispatcher, _) = setup(DispatchOptions::default(), Arc::new(EchoHandler)).await;
        let result = dispatcher.consume_push(br#"{"id":7}"#.to_vec()).await;

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value, json!({"code": 200, "message": {"id": 7}, "status": "HTTP_OK"}));
    }

    #[tokio::test]
    async fn test_push_unusable_payload_skips_handler() {
        let handler = FnHandler::new(|_| async { anyhow::bail!("must not run") });
        let (dispatcher, _) = setup(DispatchOptions::default(), Arc::new(handler)).await;

        let result = dispatcher.consume_push(b"null".to_vec()).await;
        assert!(result.is_info());
        assert_eq!(result.envelope().message, Value::Null);
    }

    #[tokio::test]
    async fn test_push_handler_failure_conflicts() {
        let handler = FnHandler::new(|_| async { anyhow::bail!("database unavailable") });
        let (dispatcher, _) = setup(DispatchOptions::default(), Arc::new(handler)).await;

        let result = dispatcher.consume_push(br#"{"id":1}"#.to_vec()).await;
        assert!(!result.is_info());
        assert_eq!(result.status_code(), StatusCode::CONFLICT);
        assert_eq!(result.envelope().message, json!("database unavailable"));
    }

    #[tokio::test]
    async fn test_oversized_push_is_rejected() {
        let options = DispatchOptions {
            limits: ResourceLimits {
                max_payload_bytes: Some(4),
                handler_timeout: None,
            },
            ..Default::default()
        };
        let (dispatcher, _) = setup(options, Arc::new(EchoHandler)).await;

        let result = dispatcher.consume_push(br#"{"id":7}"#.to_vec()).await;
        assert!(!result.is_info());
        assert!(result.envelope().message.as_str().unwrap().contains("Message too large"));
    }

    #[tokio::test]
    async fn test_handler_timeout_is_failure() {
        let handler = FnHandler::new(|v| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(v)
        });
        let options = DispatchOptions {
            limits: ResourceLimits {
                max_payload_bytes: None,
                handler_timeout: Some(Duration::from_millis(10)),
            },
            ..Default::default()
        };
        let (dispatcher, _) = setup(options, Arc::new(handler)).await;

        let result = dispatcher.consume_task(br#"{"id":1}"#.to_vec()).await;
        assert!(!result.is_info());
        assert!(result.envelope().message.as_str().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_pull_failure_requeues_once() {
        let handler = FnHandler::new(|v: Value| async move {
            if v["fail"] == json!(true) {
                anyhow::bail!("boom");
            }
            Ok(v)
        });
        let (dispatcher, backend) = setup(DispatchOptions::default(), Arc::new(handler)).await;

        backend.publish(TOPIC, br#"{"fail":false}"#.to_vec()).await.unwrap();
        backend.publish(TOPIC, br#"{"fail":true}"#.to_vec()).await.unwrap();

        let report = dispatcher
            .consume_pull("jobs-sub", "jobs", &PullOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.received, 2);
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.requeued, 1);
        assert_eq!(backend.in_flight_count(SUB).await, 0);
        assert_eq!(backend.pending_count(SUB).await, 1);

        let published = backend.published(TOPIC).await;
        assert_eq!(published.len(), 3);
        assert_eq!(published[2].data, br#"{"fail":true}"#);
    }

    #[tokio::test]
    async fn test_after_processing_releases_without_republish() {
        let handler = FnHandler::new(|_| async { anyhow::bail!("boom") });
        let options = DispatchOptions {
            ack_mode: AckMode::AfterProcessing,
            ..Default::default()
        };
        let (dispatcher, backend) = setup(options, Arc::new(handler)).await;
        backend.publish(TOPIC, br#"{"id":1}"#.to_vec()).await.unwrap();

        let report = dispatcher
            .consume_pull("jobs-sub", "jobs", &PullOptions::default(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.requeued, 0);
        assert_eq!(report.released, 1);
        assert_eq!(backend.published(TOPIC).await.len(), 1);
        assert_eq!(backend.pending_count(SUB).await, 1);
    }

    #[tokio::test]
    async fn test_pull_from_missing_subscription_conflicts() {
        let (dispatcher, _) = setup(DispatchOptions::default(), Arc::new(EchoHandler)).await;
        let result: OperationResult = dispatcher
            .consume_pull("missing", "jobs", &PullOptions::default(), &CancellationToken::new())
            .await
            .into();

        assert_eq!(result.status_code(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_cancelled_batch_releases_messages() {
        let (dispatcher, backend) = setup(DispatchOptions::default(), Arc::new(EchoHandler)).await;
        for _ in 0..3 {
            backend.publish(TOPIC, br#"{"id":1}"#.to_vec()).await.unwrap();
        }

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = dispatcher
            .consume_pull("jobs-sub", "jobs", &PullOptions::default(), &cancel)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.processed, 0);
        assert_eq!(report.released, 3);
        assert_eq!(backend.pending_count(SUB).await, 3);
        assert_eq!(backend.in_flight_count(SUB).await, 0);
    }

    #[tokio::test]
    async fn test_cancel_mid_handler_requeues() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let handler = FnHandler::new(move |v| {
            let trigger = trigger.clone();
            async move {
                trigger.cancel();
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(v)
            }
        });
        let (dispatcher, backend) = setup(DispatchOptions::default(), Arc::new(handler)).await;
        backend.publish(TOPIC, br#"{"id":1}"#.to_vec()).await.unwrap();
        backend.publish(TOPIC, br#"{"id":2}"#.to_vec()).await.unwrap();

        let report = dispatcher
            .consume_pull("jobs-sub", "jobs", &PullOptions::default(), &cancel)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.requeued, 1);
        assert_eq!(report.released, 1);
        assert_eq!(backend.in_flight_count(SUB).await, 0);
        assert_eq!(backend.pending_count(SUB).await, 2);
    }

    #[test]
    fn test_batch_report_summary() {
        let result: OperationResult = BatchReport {
            subscription: "jobs-sub".to_string(),
            ..Default::default()
        }
        .into();

        assert_eq!(
            result.envelope().message,
            json!("Pull message for subscription 'jobs-sub' was executed successfully.")
        );
        assert_eq!(result.envelope().status, "HTTP_OK");
    }
}
