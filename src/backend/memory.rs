//! In-memory backend implementation.
//!
//! Emulates Pub/Sub fan-out and Cloud Tasks queues inside the process. Used
//! for local runs and as the backend under test.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::backend::{
    HealthStatus, MessageTransport, PubSubAdmin, QueueBackend, TaskQueueAdmin, TaskSubmitter,
};
use crate::types::{MessageId, PullOptions, ReceivedMessage, Task};
use crate::{Error, Result};

/// In-memory backend.
#[derive(Clone)]
pub struct InMemoryBackend {
    inner: Arc<InMemoryBackendInner>,
}

struct InMemoryBackendInner {
    /// Topic names.
    topics: RwLock<HashMap<String, DateTime<Utc>>>,
    /// Subscriptions keyed by canonical name.
    subscriptions: RwLock<HashMap<String, SubscriptionData>>,
    /// Task queues keyed by canonical name.
    queues: RwLock<HashMap<String, Vec<Task>>>,
    /// Most recent publishes, oldest first, bounded by `published_log_capacity`.
    published: RwLock<VecDeque<PublishedMessage>>,
    /// Number of backend operations invoked.
    calls: AtomicU64,
    /// Configuration.
    config: InMemoryConfig,
}

/// Configuration for the in-memory backend.
#[derive(Debug, Clone)]
pub struct InMemoryConfig {
    /// Seconds a pulled, unacknowledged message stays invisible.
    pub ack_deadline_seconds: u32,
    /// Publishes kept for inspection. Zero disables the log.
    pub published_log_capacity: usize,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            ack_deadline_seconds: 10,
            published_log_capacity: 1000,
        }
    }
}

/// A message recorded at publish time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Canonical topic name.
    pub topic: String,
    /// Assigned message ID.
    pub message_id: MessageId,
    /// Raw payload.
    pub data: Vec<u8>,
}

struct SubscriptionData {
    /// Canonical topic name.
    topic: String,
    /// Messages awaiting delivery.
    pending: VecDeque<StoredMessage>,
    /// Delivered, unacknowledged messages keyed by ack ID.
    in_flight: HashMap<String, InFlightMessage>,
}

#[derive(Clone)]
struct StoredMessage {
    message_id: MessageId,
    data: Vec<u8>,
    publish_time: DateTime<Utc>,
}

struct InFlightMessage {
    message: StoredMessage,
    deadline: DateTime<Utc>,
}

impl InMemoryBackend {
    /// Create a new in-memory backend with default configuration.
    pub fn new() -> Self {
        Self::with_config(InMemoryConfig::default())
    }

    /// Create a new in-memory backend with custom configuration.
    pub fn with_config(config: InMemoryConfig) -> Self {
        info!(
            ack_deadline_seconds = config.ack_deadline_seconds,
            published_log_capacity = config.published_log_capacity,
            "Initializing in-memory backend"
        );

        Self {
            inner: Arc::new(InMemoryBackendInner {
                topics: RwLock::new(HashMap::new()),
                subscriptions: RwLock::new(HashMap::new()),
                queues: RwLock::new(HashMap::new()),
                published: RwLock::new(VecDeque::new()),
                calls: AtomicU64::new(0),
                config,
            }),
        }
    }

    fn record_call(&self) {
        self.inner.calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of backend operations invoked so far.
    pub fn call_count(&self) -> u64 {
        self.inner.calls.load(Ordering::Relaxed)
    }

    /// Messages published to `topic`, oldest first.
    ///
    /// Only the most recent `published_log_capacity` publishes across all
    /// topics are retained.
    pub async fn published(&self, topic: &str) -> Vec<PublishedMessage> {
        self.inner
            .published
            .read()
            .await
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Tasks created in `queue`, oldest first.
    pub async fn tasks(&self, queue: &str) -> Vec<Task> {
        self.inner
            .queues
            .read()
            .await
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of delivered, unacknowledged messages on a subscription.
    pub async fn in_flight_count(&self, subscription: &str) -> usize {
        self.inner
            .subscriptions
            .read()
            .await
            .get(subscription)
            .map(|s| s.in_flight.len())
            .unwrap_or(0)
    }

    /// Number of messages awaiting delivery on a subscription.
    pub async fn pending_count(&self, subscription: &str) -> usize {
        self.inner
            .subscriptions
            .read()
            .await
            .get(subscription)
            .map(|s| s.pending.len())
            .unwrap_or(0)
    }

    fn list_under(names: impl Iterator<Item = String>, prefix: &str) -> Vec<String> {
        let mut names: Vec<String> = names.filter(|n| n.starts_with(prefix)).collect();
        names.sort();
        names
    }

    /// Return expired in-flight messages to the pending queue.
    fn release_expired(subscription: &mut SubscriptionData, now: DateTime<Utc>) {
        let expired: Vec<String> = subscription
            .in_flight
            .iter()
            .filter(|(_, m)| m.deadline <= now)
            .map(|(ack_id, _)| ack_id.clone())
            .collect();

        for ack_id in expired {
            if let Some(in_flight) = subscription.in_flight.remove(&ack_id) {
                subscription.pending.push_back(in_flight.message);
            }
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PubSubAdmin for InMemoryBackend {
    async fn topic_exists(&self, topic: &str) -> Result<bool> {
        self.record_call();
        Ok(self.inner.topics.read().await.contains_key(topic))
    }

    async fn create_topic(&self, topic: &str) -> Result<String> {
        self.record_call();
        debug!(topic = %topic, "Creating topic");

        let mut topics = self.inner.topics.write().await;
        if topics.contains_key(topic) {
            return Err(Error::AlreadyExists(topic.to_string()));
        }
        topics.insert(topic.to_string(), Utc::now());

        info!(topic = %topic, "Topic created");
        Ok(topic.to_string())
    }

    async fn delete_topic(&self, topic: &str) -> Result<()> {
        self.record_call();
        debug!(topic = %topic, "Deleting topic");

        self.inner
            .topics
            .write()
            .await
            .remove(topic)
            .ok_or_else(|| Error::TopicNotFound(topic.to_string()))?;
        self.inner
            .published
            .write()
            .await
            .retain(|m| m.topic != topic);

        info!(topic = %topic, "Topic deleted");
        Ok(())
    }

    async fn list_topics(&self, project: &str) -> Result<Vec<String>> {
        self.record_call();
        let topics = self.inner.topics.read().await;
        Ok(Self::list_under(
            topics.keys().cloned(),
            &format!("{}/topics/", project),
        ))
    }

    async fn subscription_exists(&self, subscription: &str) -> Result<bool> {
        self.record_call();
        Ok(self
            .inner
            .subscriptions
            .read()
            .await
            .contains_key(subscription))
    }

    async fn create_subscription(&self, topic: &str, subscription: &str) -> Result<String> {
        self.record_call();
        debug!(topic = %topic, subscription = %subscription, "Creating subscription");

        if !self.inner.topics.read().await.contains_key(topic) {
            return Err(Error::TopicNotFound(topic.to_string()));
        }

        let mut subscriptions = self.inner.subscriptions.write().await;
        if subscriptions.contains_key(subscription) {
            return Err(Error::AlreadyExists(subscription.to_string()));
        }

        subscriptions.insert(
            subscription.to_string(),
            SubscriptionData {
                topic: topic.to_string(),
                pending: VecDeque::new(),
                in_flight: HashMap::new(),
            },
        );

        info!(subscription = %subscription, "Subscription created");
        Ok(subscription.to_string())
    }

    async fn delete_subscription(&self, subscription: &str) -> Result<()> {
        self.record_call();
        debug!(subscription = %subscription, "Deleting subscription");

        self.inner
            .subscriptions
            .write()
            .await
            .remove(subscription)
            .ok_or_else(|| Error::SubscriptionNotFound(subscription.to_string()))?;

        info!(subscription = %subscription, "Subscription deleted");
        Ok(())
    }

    async fn list_subscriptions(&self, project: &str) -> Result<Vec<String>> {
        self.record_call();
        let subscriptions = self.inner.subscriptions.read().await;
        Ok(Self::list_under(
            subscriptions.keys().cloned(),
            &format!("{}/subscriptions/", project),
        ))
    }
}

#[async_trait::async_trait]
impl MessageTransport for InMemoryBackend {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<MessageId> {
        self.record_call();

        if !self.inner.topics.read().await.contains_key(topic) {
            return Err(Error::TopicNotFound(topic.to_string()));
        }

        let message = StoredMessage {
            message_id: MessageId::new(),
            data,
            publish_time: Utc::now(),
        };

        let mut fanned_out = 0usize;
        {
            let mut subscriptions = self.inner.subscriptions.write().await;
            for sub in subscriptions.values_mut().filter(|s| s.topic == topic) {
                sub.pending.push_back(message.clone());
                fanned_out += 1;
            }
        }

        let capacity = self.inner.config.published_log_capacity;
        if capacity > 0 {
            let mut published = self.inner.published.write().await;
            while published.len() >= capacity {
                published.pop_front();
            }
            published.push_back(PublishedMessage {
                topic: topic.to_string(),
                message_id: message.message_id.clone(),
                data: message.data,
            });
        }

        debug!(
            topic = %topic,
            message_id = %message.message_id,
            subscriptions = fanned_out,
            "Message published"
        );
        Ok(message.message_id)
    }

    async fn pull(
        &self,
        subscription: &str,
        options: &PullOptions,
    ) -> Result<Vec<ReceivedMessage>> {
        self.record_call();
        debug!(subscription = %subscription, max_messages = options.max_messages, "Pulling messages");

        let mut subscriptions = self.inner.subscriptions.write().await;
        let sub = subscriptions
            .get_mut(subscription)
            .ok_or_else(|| Error::SubscriptionNotFound(subscription.to_string()))?;

        let now = Utc::now();
        Self::release_expired(sub, now);

        let deadline = now + Duration::seconds(i64::from(self.inner.config.ack_deadline_seconds));
        let max = options.max_messages.max(1) as usize;
        let mut received = Vec::new();

        while received.len() < max {
            let Some(message) = sub.pending.pop_front() else {
                break;
            };
            let ack_id = Uuid::new_v4().to_string();

            received.push(ReceivedMessage {
                ack_id: ack_id.clone(),
                message_id: message.message_id.clone(),
                data: message.data.clone(),
                attributes: HashMap::new(),
                publish_time: message.publish_time,
            });
            sub.in_flight
                .insert(ack_id, InFlightMessage { message, deadline });
        }

        debug!(subscription = %subscription, count = received.len(), "Messages pulled");
        Ok(received)
    }

    async fn acknowledge(&self, subscription: &str, ack_id: &str) -> Result<()> {
        self.record_call();

        let mut subscriptions = self.inner.subscriptions.write().await;
        let sub = subscriptions
            .get_mut(subscription)
            .ok_or_else(|| Error::SubscriptionNotFound(subscription.to_string()))?;

        sub.in_flight
            .remove(ack_id)
            .ok_or_else(|| Error::InvalidAckId(ack_id.to_string()))?;

        debug!(subscription = %subscription, "Message acknowledged");
        Ok(())
    }

    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_id: &str,
        deadline_seconds: u32,
    ) -> Result<()> {
        self.record_call();

        let mut subscriptions = self.inner.subscriptions.write().await;
        let sub = subscriptions
            .get_mut(subscription)
            .ok_or_else(|| Error::SubscriptionNotFound(subscription.to_string()))?;

        if deadline_seconds == 0 {
            let in_flight = sub
                .in_flight
                .remove(ack_id)
                .ok_or_else(|| Error::InvalidAckId(ack_id.to_string()))?;
            sub.pending.push_front(in_flight.message);
        } else {
            let in_flight = sub
                .in_flight
                .get_mut(ack_id)
                .ok_or_else(|| Error::InvalidAckId(ack_id.to_string()))?;
            in_flight.deadline = Utc::now() + Duration::seconds(i64::from(deadline_seconds));
        }

        debug!(subscription = %subscription, deadline_seconds, "Ack deadline modified");
        Ok(())
    }
}

#[async_trait::async_trait]
impl TaskQueueAdmin for InMemoryBackend {
    async fn queue_exists(&self, queue: &str) -> Result<bool> {
        self.record_call();
        Ok(self.inner.queues.read().await.contains_key(queue))
    }

    async fn create_queue(&self, queue: &str) -> Result<String> {
        self.record_call();
        debug!(queue = %queue, "Creating queue");

        let mut queues = self.inner.queues.write().await;
        if queues.contains_key(queue) {
            return Err(Error::AlreadyExists(queue.to_string()));
        }
        queues.insert(queue.to_string(), Vec::new());

        info!(queue = %queue, "Queue created");
        Ok(queue.to_string())
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.record_call();
        debug!(queue = %queue, "Deleting queue");

        self.inner
            .queues
            .write()
            .await
            .remove(queue)
            .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;

        info!(queue = %queue, "Queue deleted");
        Ok(())
    }

    async fn list_queues(&self, location: &str) -> Result<Vec<String>> {
        self.record_call();
        let queues = self.inner.queues.read().await;
        Ok(Self::list_under(
            queues.keys().cloned(),
            &format!("{}/queues/", location),
        ))
    }
}

#[async_trait::async_trait]
impl TaskSubmitter for InMemoryBackend {
    async fn create_task(&self, queue: &str, task: &Task) -> Result<String> {
        self.record_call();

        let relative_uri = &task.app_engine_http_request.relative_uri;
        if !relative_uri.starts_with('/') {
            return Err(Error::backend(
                Some(400),
                format!(
                    r#"{{"error":{{"code":400,"message":"Task.appEngineHttpRequest.relativeUri must begin with '/': {}","status":"INVALID_ARGUMENT"}}}}"#,
                    relative_uri
                ),
            ));
        }

        let mut queues = self.inner.queues.write().await;
        let tasks = queues
            .get_mut(queue)
            .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;

        let name = format!("{}/tasks/{}", queue, Uuid::new_v4().simple());
        let mut created = task.clone();
        created.name = name.clone();
        tasks.push(created);

        debug!(queue = %queue, task = %name, "Task created");
        Ok(name)
    }
}

#[async_trait::async_trait]
impl QueueBackend for InMemoryBackend {
    async fn health_check(&self) -> Result<HealthStatus> {
        Ok(HealthStatus::Healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "projects/p/topics/orders";
    const SUB: &str = "projects/p/subscriptions/orders-sub";

    async fn backend_with_subscription() -> InMemoryBackend {
        let backend = InMemoryBackend::new();
        backend.create_topic(TOPIC).await.unwrap();
        backend.create_subscription(TOPIC, SUB).await.unwrap();
        backend
    }

    #[tokio::test]
    async fn test_create_topic_twice() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.create_topic(TOPIC).await.unwrap(), TOPIC);
        assert!(matches!(
            backend.create_topic(TOPIC).await,
            Err(Error::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_subscription_requires_topic() {
        let backend = InMemoryBackend::new();
        assert!(matches!(
            backend.create_subscription(TOPIC, SUB).await,
            Err(Error::TopicNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_subscriptions() {
        let backend = backend_with_subscription().await;
        let second = "projects/p/subscriptions/audit";
        backend.create_subscription(TOPIC, second).await.unwrap();

        backend.publish(TOPIC, b"hello".to_vec()).await.unwrap();

        assert_eq!(backend.pending_count(SUB).await, 1);
        assert_eq!(backend.pending_count(second).await, 1);
        assert_eq!(backend.published(TOPIC).await.len(), 1);
    }

    #[tokio::test]
    async fn test_publish_to_missing_topic() {
        let backend = InMemoryBackend::new();
        assert!(matches!(
            backend.publish(TOPIC, b"x".to_vec()).await,
            Err(Error::TopicNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_published_log_is_bounded() {
        let backend = InMemoryBackend::with_config(InMemoryConfig {
            published_log_capacity: 5,
            ..Default::default()
        });
        backend.create_topic(TOPIC).await.unwrap();
        backend.create_subscription(TOPIC, SUB).await.unwrap();

        let options = PullOptions {
            max_messages: 1,
            return_immediately: true,
        };
        for n in 0..50u8 {
            backend.publish(TOPIC, vec![n; 1024]).await.unwrap();
            let batch = backend.pull(SUB, &options).await.unwrap();
            backend.acknowledge(SUB, &batch[0].ack_id).await.unwrap();
        }

        let published = backend.published(TOPIC).await;
        assert_eq!(published.len(), 5);
        assert_eq!(published[0].data[0], 45);
        assert_eq!(published[4].data[0], 49);
        assert_eq!(backend.pending_count(SUB).await, 0);
        assert_eq!(backend.in_flight_count(SUB).await, 0);
    }

    #[tokio::test]
    async fn test_delete_topic_clears_published_log() {
        let backend = backend_with_subscription().await;
        let other = "projects/p/topics/audit";
        backend.create_topic(other).await.unwrap();
        backend.publish(TOPIC, b"a".to_vec()).await.unwrap();
        backend.publish(other, b"b".to_vec()).await.unwrap();

        backend.delete_subscription(SUB).await.unwrap();
        backend.delete_topic(TOPIC).await.unwrap();

        assert!(backend.published(TOPIC).await.is_empty());
        assert_eq!(backend.published(other).await.len(), 1);
    }

    #[tokio::test]
    async fn test_published_log_disabled() {
        let backend = InMemoryBackend::with_config(InMemoryConfig {
            published_log_capacity: 0,
            ..Default::default()
        });
        backend.create_topic(TOPIC).await.unwrap();
        backend.publish(TOPIC, b"x".to_vec()).await.unwrap();
        assert!(backend.published(TOPIC).await.is_empty());
    }

    #[tokio::test]
    async fn test_pull_and_acknowledge() {
        let backend = backend_with_subscription().await;
        for body in ["a", "b", "c"] {
            backend.publish(TOPIC, body.as_bytes().to_vec()).await.unwrap();
        }

        let options = PullOptions {
            max_messages: 2,
            return_immediately: true,
        };
        let batch = backend.pull(SUB, &options).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].data, b"a");
        assert_eq!(batch[1].data, b"b");
        assert_eq!(backend.in_flight_count(SUB).await, 2);

        backend.acknowledge(SUB, &batch[0].ack_id).await.unwrap();
        assert_eq!(backend.in_flight_count(SUB).await, 1);

        assert!(matches!(
            backend.acknowledge(SUB, &batch[0].ack_id).await,
            Err(Error::InvalidAckId(_))
        ));
    }

    #[tokio::test]
    async fn test_nack_redelivers_immediately() {
        let backend = backend_with_subscription().await;
        backend.publish(TOPIC, b"retry".to_vec()).await.unwrap();

        let batch = backend.pull(SUB, &PullOptions::default()).await.unwrap();
        backend
            .modify_ack_deadline(SUB, &batch[0].ack_id, 0)
            .await
            .unwrap();

        let again = backend.pull(SUB, &PullOptions::default()).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].message_id, batch[0].message_id);
        assert_ne!(again[0].ack_id, batch[0].ack_id);
    }

    #[tokio::test]
    async fn test_expired_deadline_redelivers() {
        let backend = InMemoryBackend::with_config(InMemoryConfig {
            ack_deadline_seconds: 0,
            ..Default::default()
        });
        backend.create_topic(TOPIC).await.unwrap();
        backend.create_subscription(TOPIC, SUB).await.unwrap();
        backend.publish(TOPIC, b"late".to_vec()).await.unwrap();

        let first = backend.pull(SUB, &PullOptions::default()).await.unwrap();
        let second = backend.pull(SUB, &PullOptions::default()).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].message_id, second[0].message_id);
    }

    #[tokio::test]
    async fn test_list_is_scoped_to_project() {
        let backend = InMemoryBackend::new();
        backend.create_topic("projects/a/topics/one").await.unwrap();
        backend.create_topic("projects/b/topics/two").await.unwrap();

        assert_eq!(
            backend.list_topics("projects/a").await.unwrap(),
            vec!["projects/a/topics/one".to_string()]
        );
    }

    #[tokio::test]
    async fn test_create_task_requires_relative_uri() {
        let backend = InMemoryBackend::new();
        let queue = "projects/p/locations/l/queues/mail";
        backend.create_queue(queue).await.unwrap();

        let name = backend
            .create_task(queue, &Task::post_json("/cb", b"{}".to_vec()))
            .await
            .unwrap();
        assert!(name.starts_with("projects/p/locations/l/queues/mail/tasks/"));

        let err = backend
            .create_task(queue, &Task::post_json("https://example.com/cb", b"{}".to_vec()))
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .starts_with("Task.appEngineHttpRequest.relativeUri must begin with '/'"));
        assert_eq!(backend.tasks(queue).await.len(), 1);
    }

    #[tokio::test]
    async fn test_create_task_missing_queue() {
        let backend = InMemoryBackend::new();
        assert!(matches!(
            backend
                .create_task("projects/p/locations/l/queues/q", &Task::post_json("/cb", vec![]))
                .await,
            Err(Error::QueueNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_call_count() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.call_count(), 0);
        backend.topic_exists(TOPIC).await.unwrap();
        backend.queue_exists("projects/p/locations/l/queues/q").await.unwrap();
        assert_eq!(backend.call_count(), 2);
    }
}
