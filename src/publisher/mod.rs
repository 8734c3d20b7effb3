//! Publisher façade: validate, ensure resources, publish, report.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::admin::{push_subscription_missing, Admin, TaskAdmin};
use crate::backend::{Backends, TaskSubmitter};
use crate::metrics::{record_backend_error, METRICS};
use crate::transport::Transport;
use crate::types::validation::validate_resource_name;
use crate::types::{
    DeliveryMode, OperationResult, ResourceNames, ResultEnvelope, StatusCode, Task, TaskReceipt,
};
use crate::Result;

/// Existence checks and auto-creation applied when publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishPolicy {
    /// Check the topic exists before publishing.
    pub verify_topic_exists: bool,
    /// Check the subscription exists before publishing.
    pub verify_subscription_exists: bool,
    /// Create missing topics and pull subscriptions found by the checks above.
    pub allow_auto_create: bool,
}

impl Default for PublishPolicy {
    fn default() -> Self {
        Self {
            verify_topic_exists: true,
            verify_subscription_exists: true,
            allow_auto_create: true,
        }
    }
}

/// Publishes messages and tasks on behalf of the HTTP boundary.
#[derive(Clone)]
pub struct Publisher {
    admin: Admin,
    transport: Transport,
    task_admin: TaskAdmin,
    tasks: Arc<dyn TaskSubmitter>,
    policy: PublishPolicy,
}

impl Publisher {
    /// Create a publisher for `project_id`, with task queues in `location_id`.
    pub fn new(
        backends: &Backends,
        project_id: &str,
        location_id: &str,
        policy: PublishPolicy,
    ) -> Self {
        Self {
            admin: Admin::new(backends.pubsub.clone(), project_id),
            transport: Transport::new(backends.transport.clone(), project_id),
            task_admin: TaskAdmin::new(backends.queues.clone(), project_id, location_id),
            tasks: backends.tasks.clone(),
            policy,
        }
    }

    /// Create tasks under `project_id` instead of the Pub/Sub project.
    pub fn with_tasks_project(mut self, project_id: &str) -> Self {
        self.task_admin = self.task_admin.with_project(project_id);
        self
    }

    /// Publish `payload` through a `mode` subscription and build the summary.
    ///
    /// An unknown mode fails before any backend call.
    pub async fn publish_message(
        &self,
        payload: Vec<u8>,
        mode: &str,
        topic: &str,
        subscription: &str,
    ) -> OperationResult {
        let mode: DeliveryMode = match mode.parse() {
            Ok(mode) => mode,
            Err(e) => return OperationResult::from(e),
        };

        let published = match mode {
            DeliveryMode::Pull => self.publish_pull(payload, topic, subscription).await,
            DeliveryMode::Push => self.publish_push(payload, topic, subscription).await,
        };

        match published {
            Ok(names) => {
                let detail = OperationResult::from(names).envelope().clone();
                OperationResult::Info(
                    ResultEnvelope::new(
                        StatusCode::CREATED,
                        Value::String(format!(
                            "A new message is published in the \"{}\" subscription : \"{}\"",
                            mode, subscription
                        )),
                    )
                    .with_info(detail),
                )
            }
            Err(e) => e.into(),
        }
    }

    /// Publish through a pull subscription, creating resources as the policy allows.
    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    pub async fn publish_pull(
        &self,
        payload: Vec<u8>,
        topic: &str,
        subscription: &str,
    ) -> Result<ResourceNames> {
        validate_resource_name(topic)?;
        validate_resource_name(subscription)?;

        let policy = self.policy;
        if policy.verify_topic_exists
            && policy.allow_auto_create
            && self.admin.ensure_topic(topic).await?
        {
            debug!(topic = %topic, "Auto-created topic");
        }

        if policy.verify_subscription_exists
            && policy.allow_auto_create
            && self.admin.ensure_subscription(topic, subscription).await?
        {
            debug!(subscription = %subscription, "Auto-created subscription");
        }

        self.transport.publish(topic, payload).await?;
        info!(topic = %topic, subscription = %subscription, "Published pull message");
        Ok(self.names(topic, subscription))
    }

    /// Publish through a push subscription, which must already exist.
    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    pub async fn publish_push(
        &self,
        payload: Vec<u8>,
        topic: &str,
        subscription: &str,
    ) -> Result<ResourceNames> {
        validate_resource_name(topic)?;
        validate_resource_name(subscription)?;

        let policy = self.policy;
        if policy.verify_subscription_exists && !self.admin.subscription_exists(subscription).await? {
            return Err(push_subscription_missing(subscription));
        }

        if policy.verify_topic_exists
            && policy.allow_auto_create
            && self.admin.ensure_topic(topic).await?
        {
            debug!(topic = %topic, "Auto-created topic");
        }

        self.transport.publish(topic, payload).await?;
        info!(topic = %topic, subscription = %subscription, "Published push message");
        Ok(self.names(topic, subscription))
    }

    /// Create a task delivering `payload` to `target_uri`, creating the queue if absent.
    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    pub async fn publish_task(
        &self,
        payload: Vec<u8>,
        queue: &str,
        target_uri: &str,
    ) -> OperationResult {
        self.create_task(payload, queue, target_uri).await.into()
    }

    async fn create_task(
        &self,
        payload: Vec<u8>,
        queue: &str,
        target_uri: &str,
    ) -> Result<TaskReceipt> {
        let queue_name = self.task_admin.ensure_queue(queue).await?;
        let task = Task::post_json(target_uri, payload);

        let task_name = self
            .tasks
            .create_task(&queue_name, &task)
            .await
            .inspect_err(|e| record_backend_error("create_task", e))?;

        METRICS
            .tasks_created_total
            .with_label_values(&[queue_name.as_str()])
            .inc();
        info!(queue = %queue_name, task = %task_name, "Task created");

        Ok(TaskReceipt {
            queue_name,
            task_name,
            project_id: self.task_admin.project_id().to_string(),
        })
    }

    fn names(&self, topic: &str, subscription: &str) -> ResourceNames {
        ResourceNames {
            topic_name: self.admin.topic_name(topic),
            subscription_name: self.admin.subscription_name(subscription),
            project_id: self.admin.project_id().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::InMemoryBackend;
    use serde_json::json;

    fn publisher(policy: PublishPolicy) -> (Publisher, InMemoryBackend) {
        let backend = InMemoryBackend::new();
        let backends = Backends::from_backend(Arc::new(backend.clone()));
        (Publisher::new(&backends, "demo", "europe-west1", policy), backend)
    }

    #[tokio::test]
    async fn test_publish_summary_shape() {
        let (publisher, _) = publisher(PublishPolicy::default());
        let result = publisher
            .publish_message(br#"{"id":1}"#.to_vec(), "pull", "orders", "orders-sub")
            .await;

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(
            value,
            json!({
                "code": 201,
                "message": "A new message is published in the \"pull\" subscription : \"orders-sub\"",
                "status": "HTTP_CREATED",
                "info": {
                    "code": 201,
                    "message": {
                        "topicName": "projects/demo/topics/orders",
                        "subscriptionName": "projects/demo/subscriptions/orders-sub",
                        "projectId": "demo"
                    },
                    "status": "HTTP_CREATED"
                }
            })
        );
    }

    #[tokio::test]
    async fn test_auto_create_disabled_publishes_to_missing_topic() {
        let (publisher, _) = publisher(PublishPolicy {
            allow_auto_create: false,
            ..Default::default()
        });

        let err = publisher
            .publish_pull(b"{}".to_vec(), "orders", "orders-sub")
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::TopicNotFound(_)));
    }

    #[tokio::test]
    async fn test_push_checks_subscription_before_topic() {
        let (publisher, backend) = publisher(PublishPolicy::default());
        let err = publisher
            .publish_push(b"{}".to_vec(), "events", "events-push")
            .await
            .unwrap_err();

        assert!(err.to_string().contains("not exist, add a new subscription"));
        assert!(backend.published("projects/demo/topics/events").await.is_empty());
        assert!(crate::backend::PubSubAdmin::list_topics(&backend, "projects/demo")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_publish_task_receipt() {
        let (publisher, backend) = publisher(PublishPolicy::default());
        let result = publisher
            .publish_task(br#"{"mail":"x"}"#.to_vec(), "mail", "/tasks/consume")
            .await;

        assert!(result.is_info());
        let message = &result.envelope().message;
        assert_eq!(message["queueName"], "projects/demo/locations/europe-west1/queues/mail");
        assert_eq!(message["projectId"], "demo");

        let tasks = backend
            .tasks("projects/demo/locations/europe-west1/queues/mail")
            .await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(message["taskName"], json!(tasks[0].name));
    }
}
