//! Message transport: publish, pull and acknowledge with metrics and tracing.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, instrument};

use crate::backend::MessageTransport;
use crate::metrics::{record_backend_error, METRICS};
use crate::types::{MessageId, PullOptions, ReceivedMessage, ResourceName};
use crate::Result;

/// Project-scoped handle over a [`MessageTransport`].
#[derive(Clone)]
pub struct Transport {
    inner: Arc<dyn MessageTransport>,
    project_id: String,
}

impl Transport {
    /// Create a transport for `project_id`.
    pub fn new(inner: Arc<dyn MessageTransport>, project_id: impl Into<String>) -> Self {
        Self {
            inner,
            project_id: project_id.into(),
        }
    }

    /// Owning project.
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    fn observe(operation: &str, started: Instant) {
        METRICS
            .backend_latency_seconds
            .with_label_values(&[operation])
            .observe(started.elapsed().as_secs_f64());
    }

    /// Publish `data` to `topic`.
    #[instrument(skip(self, data), fields(bytes = data.len()))]
    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<MessageId> {
        let topic_name = ResourceName::topic(&self.project_id, topic);
        let started = Instant::now();

        let message_id = self
            .inner
            .publish(&topic_name, data)
            .await
            .inspect_err(|e| record_backend_error("publish", e))?;

        Self::observe("publish", started);
        METRICS
            .messages_published_total
            .with_label_values(&[topic_name.as_str()])
            .inc();
        debug!(topic = %topic_name, message_id = %message_id, "Published message");
        Ok(message_id)
    }

    /// Pull a batch from `subscription`.
    #[instrument(skip(self, options), fields(max_messages = options.max_messages))]
    pub async fn pull(
        &self,
        subscription: &str,
        options: &PullOptions,
    ) -> Result<Vec<ReceivedMessage>> {
        let subscription_name = ResourceName::subscription(&self.project_id, subscription);
        let started = Instant::now();

        let messages = self
            .inner
            .pull(&subscription_name, options)
            .await
            .inspect_err(|e| record_backend_error("pull", e))?;

        Self::observe("pull", started);
        METRICS
            .messages_pulled_total
            .with_label_values(&[subscription_name.as_str()])
            .inc_by(messages.len() as u64);
        debug!(subscription = %subscription_name, count = messages.len(), "Pulled messages");
        Ok(messages)
    }

    /// Acknowledge a pulled message.
    pub async fn acknowledge(&self, subscription: &str, ack_id: &str) -> Result<()> {
        let subscription_name = ResourceName::subscription(&self.project_id, subscription);
        let started = Instant::now();

        self.inner
            .acknowledge(&subscription_name, ack_id)
            .await
            .inspect_err(|e| record_backend_error("acknowledge", e))?;

        Self::observe("acknowledge", started);
        METRICS
            .messages_acknowledged_total
            .with_label_values(&[subscription_name.as_str()])
            .inc();
        Ok(())
    }

    /// Hand a pulled message back for immediate redelivery.
    pub async fn nack(&self, subscription: &str, ack_id: &str) -> Result<()> {
        let subscription_name = ResourceName::subscription(&self.project_id, subscription);
        self.inner
            .modify_ack_deadline(&subscription_name, ack_id, 0)
            .await
            .inspect_err(|e| record_backend_error("modify_ack_deadline", e))
    }

    /// Re-publish a failed message's raw payload to its origin topic.
    pub async fn requeue(&self, subscription: &str, topic: &str, data: Vec<u8>) -> Result<MessageId> {
        let message_id = self.publish(topic, data).await?;
        METRICS
            .messages_requeued_total
            .with_label_values(&[ResourceName::subscription(&self.project_id, subscription).as_str()])
            .inc();
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::InMemoryBackend;
    use crate::backend::PubSubAdmin;

    #[tokio::test]
    async fn test_publish_pull_ack_by_short_name() {
        let backend = InMemoryBackend::new();
        backend.create_topic("projects/p/topics/t").await.unwrap();
        backend
            .create_subscription("projects/p/topics/t", "projects/p/subscriptions/s")
            .await
            .unwrap();

        let transport = Transport::new(Arc::new(backend.clone()), "p");
        transport.publish("t", b"one".to_vec()).await.unwrap();

        let batch = transport.pull("s", &PullOptions::default()).await.unwrap();
        assert_eq!(batch.len(), 1);
        transport.acknowledge("s", &batch[0].ack_id).await.unwrap();
        assert_eq!(backend.in_flight_count("projects/p/subscriptions/s").await, 0);
    }

    #[tokio::test]
    async fn test_requeue_publishes_new_identity() {
        let backend = InMemoryBackend::new();
        backend.create_topic("projects/p/topics/t").await.unwrap();

        let transport = Transport::new(Arc::new(backend.clone()), "p");
        let first = transport.publish("t", b"x".to_vec()).await.unwrap();
        let second = transport.requeue("s", "t", b"x".to_vec()).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(backend.published("projects/p/topics/t").await.len(), 2);
    }
}
