//! Queue backend capability traits and implementations.
//!
//! Every argument naming a resource is its canonical name
//! (`projects/{p}/topics/{t}`, `projects/{p}/subscriptions/{s}`,
//! `projects/{p}/locations/{l}/queues/{q}`). Listing calls take the parent
//! (`projects/{p}` or `projects/{p}/locations/{l}`).

use std::sync::Arc;

use async_trait::async_trait;

use crate::types::{MessageId, PullOptions, ReceivedMessage, Task};
use crate::Result;

pub mod memory;
pub mod rest;

/// Topic and subscription lifecycle.
#[async_trait]
pub trait PubSubAdmin: Send + Sync {
    /// Whether the topic exists.
    async fn topic_exists(&self, topic: &str) -> Result<bool>;

    /// Create a topic, returning the canonical name the backend assigned.
    async fn create_topic(&self, topic: &str) -> Result<String>;

    /// Delete a topic.
    async fn delete_topic(&self, topic: &str) -> Result<()>;

    /// List topic names under a project.
    async fn list_topics(&self, project: &str) -> Result<Vec<String>>;

    /// Whether the subscription exists.
    async fn subscription_exists(&self, subscription: &str) -> Result<bool>;

    /// Create a pull subscription bound to `topic`.
    async fn create_subscription(&self, topic: &str, subscription: &str) -> Result<String>;

    /// Delete a subscription.
    async fn delete_subscription(&self, subscription: &str) -> Result<()>;

    /// List subscription names under a project.
    async fn list_subscriptions(&self, project: &str) -> Result<Vec<String>>;
}

/// Publish, pull and acknowledge.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Publish a payload to a topic.
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<MessageId>;

    /// Pull a batch of messages from a subscription.
    async fn pull(&self, subscription: &str, options: &PullOptions)
        -> Result<Vec<ReceivedMessage>>;

    /// Acknowledge a pulled message.
    async fn acknowledge(&self, subscription: &str, ack_id: &str) -> Result<()>;

    /// Change the ack deadline of a pulled message. Zero makes it available
    /// for redelivery immediately.
    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_id: &str,
        deadline_seconds: u32,
    ) -> Result<()>;
}

/// Task queue lifecycle.
#[async_trait]
pub trait TaskQueueAdmin: Send + Sync {
    /// Whether the queue exists.
    async fn queue_exists(&self, queue: &str) -> Result<bool>;

    /// Create a queue, returning its canonical name.
    async fn create_queue(&self, queue: &str) -> Result<String>;

    /// Delete a queue.
    async fn delete_queue(&self, queue: &str) -> Result<()>;

    /// List queue names under a location.
    async fn list_queues(&self, location: &str) -> Result<Vec<String>>;
}

/// Task creation.
#[async_trait]
pub trait TaskSubmitter: Send + Sync {
    /// Create a task in a queue, returning the backend-assigned task name.
    async fn create_task(&self, queue: &str, task: &Task) -> Result<String>;
}

/// A backend implementing every capability.
#[async_trait]
pub trait QueueBackend: PubSubAdmin + MessageTransport + TaskQueueAdmin + TaskSubmitter {
    /// Health check.
    async fn health_check(&self) -> Result<HealthStatus>;
}

/// Health status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Backend is healthy.
    Healthy,
    /// Backend is unhealthy.
    Unhealthy(String),
}

/// Capability handles shared by the admin, transport, dispatch and publisher layers.
#[derive(Clone)]
pub struct Backends {
    /// Topic and subscription lifecycle.
    pub pubsub: Arc<dyn PubSubAdmin>,
    /// Publish, pull and acknowledge.
    pub transport: Arc<dyn MessageTransport>,
    /// Task queue lifecycle.
    pub queues: Arc<dyn TaskQueueAdmin>,
    /// Task creation.
    pub tasks: Arc<dyn TaskSubmitter>,
    /// Combined handle for health checks.
    pub health: Arc<dyn HealthCheck>,
}

/// Object-safe health check.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Health check.
    async fn check(&self) -> Result<HealthStatus>;
}

#[async_trait]
impl<B: QueueBackend> HealthCheck for B {
    async fn check(&self) -> Result<HealthStatus> {
        self.health_check().await
    }
}

impl Backends {
    /// Split one backend into its capability handles.
    pub fn from_backend<B: QueueBackend + 'static>(backend: Arc<B>) -> Self {
        Self {
            pubsub: backend.clone(),
            transport: backend.clone(),
            queues: backend.clone(),
            tasks: backend.clone(),
            health: backend,
        }
    }
}
