//! Topic, subscription and task-queue administration.
//!
//! Callers pass short resource names; the admin validates them, expands them
//! to canonical names under the configured project and forwards to the backend.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::{PubSubAdmin, TaskQueueAdmin};
use crate::metrics::record_backend_error;
use crate::types::validation::{validate_queue_name, validate_resource_name};
use crate::types::{DeliveryMode, ResourceName, ResourceNames};
use crate::{Error, Result};

/// Topic and subscription administration for one project.
#[derive(Clone)]
pub struct Admin {
    pubsub: Arc<dyn PubSubAdmin>,
    project_id: String,
}

impl Admin {
    /// Create an admin for `project_id`.
    pub fn new(pubsub: Arc<dyn PubSubAdmin>, project_id: impl Into<String>) -> Self {
        Self {
            pubsub,
            project_id: project_id.into(),
        }
    }

    /// Owning project.
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Canonical topic name.
    pub fn topic_name(&self, topic: &str) -> String {
        ResourceName::topic(&self.project_id, topic)
    }

    /// Canonical subscription name.
    pub fn subscription_name(&self, subscription: &str) -> String {
        ResourceName::subscription(&self.project_id, subscription)
    }

    fn project_name(&self) -> String {
        format!("projects/{}", self.project_id)
    }

    fn names(&self, topic: &str, subscription: &str) -> ResourceNames {
        ResourceNames {
            topic_name: self.topic_name(topic),
            subscription_name: self.subscription_name(subscription),
            project_id: self.project_id.clone(),
        }
    }

    /// Whether the topic exists.
    pub async fn topic_exists(&self, topic: &str) -> Result<bool> {
        validate_resource_name(topic)?;
        self.pubsub
            .topic_exists(&self.topic_name(topic))
            .await
            .inspect_err(|e| record_backend_error("topic_exists", e))
    }

    /// Create a topic, returning the canonical name the backend assigned.
    pub async fn create_topic(&self, topic: &str) -> Result<String> {
        validate_resource_name(topic)?;
        let name = self
            .pubsub
            .create_topic(&self.topic_name(topic))
            .await
            .inspect_err(|e| record_backend_error("create_topic", e))?;

        info!(topic = %name, "Topic created");
        Ok(name)
    }

    /// Delete a topic.
    pub async fn delete_topic(&self, topic: &str) -> Result<()> {
        validate_resource_name(topic)?;
        self.pubsub
            .delete_topic(&self.topic_name(topic))
            .await
            .inspect_err(|e| record_backend_error("delete_topic", e))?;

        info!(topic = %topic, "Topic deleted");
        Ok(())
    }

    /// List canonical topic names in the project.
    pub async fn list_topics(&self) -> Result<Vec<String>> {
        self.pubsub
            .list_topics(&self.project_name())
            .await
            .inspect_err(|e| record_backend_error("list_topics", e))
    }

    /// Whether the subscription exists.
    pub async fn subscription_exists(&self, subscription: &str) -> Result<bool> {
        validate_resource_name(subscription)?;
        self.pubsub
            .subscription_exists(&self.subscription_name(subscription))
            .await
            .inspect_err(|e| record_backend_error("subscription_exists", e))
    }

    /// Create a pull subscription on `topic`.
    pub async fn create_subscription(&self, topic: &str, subscription: &str) -> Result<String> {
        validate_resource_name(topic)?;
        validate_resource_name(subscription)?;
        let name = self
            .pubsub
            .create_subscription(
                &self.topic_name(topic),
                &self.subscription_name(subscription),
            )
            .await
            .inspect_err(|e| record_backend_error("create_subscription", e))?;

        info!(topic = %topic, subscription = %name, "Subscription created");
        Ok(name)
    }

    /// Delete a subscription.
    pub async fn delete_subscription(&self, subscription: &str) -> Result<()> {
        validate_resource_name(subscription)?;
        self.pubsub
            .delete_subscription(&self.subscription_name(subscription))
            .await
            .inspect_err(|e| record_backend_error("delete_subscription", e))?;

        info!(subscription = %subscription, "Subscription deleted");
        Ok(())
    }

    /// List canonical subscription names in the project.
    pub async fn list_subscriptions(&self) -> Result<Vec<String>> {
        self.pubsub
            .list_subscriptions(&self.project_name())
            .await
            .inspect_err(|e| record_backend_error("list_subscriptions", e))
    }

    /// Create a topic and, for pull mode, its subscription.
    ///
    /// Create-only: an existing topic, or an existing pull subscription, is a
    /// conflict. Push subscriptions are never created here and must already
    /// exist.
    pub async fn ensure_topic_and_subscription(
        &self,
        topic: &str,
        subscription: &str,
        mode: DeliveryMode,
    ) -> Result<ResourceNames> {
        validate_resource_name(topic)?;
        validate_resource_name(subscription)?;

        if self.topic_exists(topic).await? {
            return Err(Error::Conflict(format!("Topic : \"{}\" already exist.", topic)));
        }

        let names = self.names(topic, subscription);
        let created = self.create_topic(topic).await?;
        if created != names.topic_name {
            warn!(expected = %names.topic_name, returned = %created, "Topic creation returned unexpected name");
            return Err(Error::Conflict(format!(
                "Topic : \"{}\" not exist, there was an error during topic creation.",
                topic
            )));
        }

        match mode {
            DeliveryMode::Pull => {
                if self.subscription_exists(subscription).await? {
                    return Err(Error::Conflict(format!(
                        "Subscription : \"{}\" already exist.",
                        subscription
                    )));
                }
                self.create_subscription(topic, subscription).await?;
            }
            DeliveryMode::Push => {
                if !self.subscription_exists(subscription).await? {
                    return Err(push_subscription_missing(subscription));
                }
            }
        }

        Ok(names)
    }

    /// Create the topic unless it exists. Returns whether it was created.
    pub async fn ensure_topic(&self, topic: &str) -> Result<bool> {
        if self.topic_exists(topic).await? {
            return Ok(false);
        }

        match self.create_topic(topic).await {
            Ok(created) if created == self.topic_name(topic) => Ok(true),
            Ok(_) => Err(Error::Conflict(format!(
                "Topic : \"{}\" not exist, there was an error during topic creation.",
                topic
            ))),
            Err(e) if e.is_already_exists() => {
                debug!(topic = %topic, "Topic created concurrently");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Create the pull subscription unless it exists. Returns whether it was created.
    pub async fn ensure_subscription(&self, topic: &str, subscription: &str) -> Result<bool> {
        if self.subscription_exists(subscription).await? {
            return Ok(false);
        }

        match self.create_subscription(topic, subscription).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_already_exists() => {
                debug!(subscription = %subscription, "Subscription created concurrently");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

/// Conflict raised when a push subscription is missing.
pub(crate) fn push_subscription_missing(subscription: &str) -> Error {
    Error::Conflict(format!(
        "Subscription : \"{}\" not exist, add a new subscription in the GCP Console by specify the push method.",
        subscription
    ))
}

/// Task-queue administration for one project location.
#[derive(Clone)]
pub struct TaskAdmin {
    queues: Arc<dyn TaskQueueAdmin>,
    project_id: String,
    location_id: String,
}

impl TaskAdmin {
    /// Create a task admin for `project_id` in `location_id`.
    pub fn new(
        queues: Arc<dyn TaskQueueAdmin>,
        project_id: impl Into<String>,
        location_id: impl Into<String>,
    ) -> Self {
        Self {
            queues,
            project_id: project_id.into(),
            location_id: location_id.into(),
        }
    }

    /// Owning project.
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Same location under another project.
    pub fn with_project(&self, project_id: impl Into<String>) -> Self {
        Self {
            queues: self.queues.clone(),
            project_id: project_id.into(),
            location_id: self.location_id.clone(),
        }
    }

    /// Canonical queue name.
    pub fn queue_name(&self, queue: &str) -> String {
        ResourceName::queue(&self.project_id, &self.location_id, queue)
    }

    /// Whether the queue exists.
    pub async fn queue_exists(&self, queue: &str) -> Result<bool> {
        validate_queue_name(queue)?;
        self.queues
            .queue_exists(&self.queue_name(queue))
            .await
            .inspect_err(|e| record_backend_error("queue_exists", e))
    }

    /// Create a queue.
    pub async fn create_queue(&self, queue: &str) -> Result<String> {
        validate_queue_name(queue)?;
        let name = self
            .queues
            .create_queue(&self.queue_name(queue))
            .await
            .inspect_err(|e| record_backend_error("create_queue", e))?;

        info!(queue = %name, "Queue created");
        Ok(name)
    }

    /// Delete a queue.
    pub async fn delete_queue(&self, queue: &str) -> Result<()> {
        validate_queue_name(queue)?;
        self.queues
            .delete_queue(&self.queue_name(queue))
            .await
            .inspect_err(|e| record_backend_error("delete_queue", e))?;

        info!(queue = %queue, "Queue deleted");
        Ok(())
    }

    /// List canonical queue names in the location.
    pub async fn list_queues(&self) -> Result<Vec<String>> {
        self.queues
            .list_queues(&ResourceName::location(&self.project_id, &self.location_id))
            .await
            .inspect_err(|e| record_backend_error("list_queues", e))
    }

    /// Create the queue unless it exists, returning its canonical name.
    pub async fn ensure_queue(&self, queue: &str) -> Result<String> {
        let name = self.queue_name(queue);
        if self.queue_exists(queue).await? {
            return Ok(name);
        }

        match self.create_queue(queue).await {
            Ok(created) => Ok(created),
            Err(e) if e.is_already_exists() => {
                debug!(queue = %queue, "Queue created concurrently");
                Ok(name)
            }
            Err(e) => Err(e),
        }
    }
}
