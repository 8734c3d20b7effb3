//! REST backend speaking the Pub/Sub v1 and Cloud Tasks v2 JSON APIs.
//!
//! Works against Google Cloud or a local emulator. Authentication is a static
//! bearer access token when one is configured.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::backend::{
    HealthStatus, MessageTransport, PubSubAdmin, QueueBackend, TaskQueueAdmin, TaskSubmitter,
};
use crate::metrics::METRICS;
use crate::types::{MessageId, PullOptions, ReceivedMessage, Task};
use crate::{Error, Result};

/// Default Pub/Sub endpoint.
pub const DEFAULT_PUBSUB_ENDPOINT: &str = "https://pubsub.googleapis.com";

/// Default Cloud Tasks endpoint.
pub const DEFAULT_TASKS_ENDPOINT: &str = "https://cloudtasks.googleapis.com";

/// REST backend configuration.
#[derive(Debug, Clone)]
pub struct RestConfig {
    /// Pub/Sub API base URL.
    pub pubsub_endpoint: String,
    /// Cloud Tasks API base URL.
    pub tasks_endpoint: String,
    /// Bearer access token sent with every call.
    pub access_token: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            pubsub_endpoint: DEFAULT_PUBSUB_ENDPOINT.to_string(),
            tasks_endpoint: DEFAULT_TASKS_ENDPOINT.to_string(),
            access_token: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// REST backend.
#[derive(Clone)]
pub struct RestBackend {
    client: Client,
    config: RestConfig,
}

#[derive(Deserialize)]
struct NamedResource {
    name: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ListTopicsResponse {
    #[serde(default)]
    topics: Vec<NamedResource>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ListSubscriptionsResponse {
    #[serde(default)]
    subscriptions: Vec<NamedResource>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ListQueuesResponse {
    #[serde(default)]
    queues: Vec<NamedResource>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    message_ids: Vec<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<WireReceivedMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReceivedMessage {
    ack_id: String,
    message: WireMessage,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
    message_id: String,
    #[serde(default)]
    publish_time: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct CreateTaskRequest<'a> {
    task: &'a Task,
}

impl RestBackend {
    /// Create a new REST backend.
    pub fn new(config: RestConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(format!("qbridge/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, config })
    }

    fn pubsub_url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.config.pubsub_endpoint.trim_end_matches('/'), path)
    }

    fn tasks_url(&self, path: &str) -> String {
        format!("{}/v2/{}", self.config.tasks_endpoint.trim_end_matches('/'), path)
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.config.access_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Turn a non-success response into a backend error.
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let raw = if body.is_empty() {
            status.to_string()
        } else {
            body
        };
        Err(Error::backend(Some(status.as_u16()), raw))
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = Self::check(builder.send().await?).await?;
        Ok(response.json().await?)
    }

    async fn send_empty(&self, builder: RequestBuilder) -> Result<()> {
        Self::check(builder.send().await?).await?;
        Ok(())
    }

    /// GET a resource, mapping 404 to `false`.
    async fn exists(&self, url: String) -> Result<bool> {
        let response = self.request(Method::GET, url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Self::check(response).await?;
        Ok(true)
    }

    /// Follow `nextPageToken` until exhausted.
    async fn list_all<T, F>(&self, url: String, mut split: F) -> Result<Vec<String>>
    where
        T: DeserializeOwned,
        F: FnMut(T) -> (Vec<NamedResource>, Option<String>),
    {
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut builder = self.request(Method::GET, url.clone());
            if let Some(token) = &page_token {
                builder = builder.query(&[("pageToken", token)]);
            }

            let (page, next) = split(self.send_json::<T>(builder).await?);
            names.extend(page.into_iter().map(|r| r.name));

            match next.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(names)
    }
}

#[async_trait]
impl PubSubAdmin for RestBackend {
    async fn topic_exists(&self, topic: &str) -> Result<bool> {
        self.exists(self.pubsub_url(topic)).await
    }

    async fn create_topic(&self, topic: &str) -> Result<String> {
        debug!(topic = %topic, "Creating topic via REST");
        let created: NamedResource = self
            .send_json(self.request(Method::PUT, self.pubsub_url(topic)).json(&json!({})))
            .await?;
        Ok(created.name)
    }

    async fn delete_topic(&self, topic: &str) -> Result<()> {
        self.send_empty(self.request(Method::DELETE, self.pubsub_url(topic)))
            .await
    }

    async fn list_topics(&self, project: &str) -> Result<Vec<String>> {
        self.list_all(
            self.pubsub_url(&format!("{}/topics", project)),
            |r: ListTopicsResponse| (r.topics, r.next_page_token),
        )
        .await
    }

    async fn subscription_exists(&self, subscription: &str) -> Result<bool> {
        self.exists(self.pubsub_url(subscription)).await
    }

    async fn create_subscription(&self, topic: &str, subscription: &str) -> Result<String> {
        debug!(topic = %topic, subscription = %subscription, "Creating subscription via REST");
        let created: NamedResource = self
            .send_json(
                self.request(Method::PUT, self.pubsub_url(subscription))
                    .json(&json!({ "topic": topic })),
            )
            .await?;
        Ok(created.name)
    }

    async fn delete_subscription(&self, subscription: &str) -> Result<()> {
        self.send_empty(self.request(Method::DELETE, self.pubsub_url(subscription)))
            .await
    }

    async fn list_subscriptions(&self, project: &str) -> Result<Vec<String>> {
        self.list_all(
            self.pubsub_url(&format!("{}/subscriptions", project)),
            |r: ListSubscriptionsResponse| (r.subscriptions, r.next_page_token),
        )
        .await
    }
}

#[async_trait]
impl MessageTransport for RestBackend {
    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<MessageId> {
        let body = json!({
            "messages": [{
                "data": base64::engine::general_purpose::STANDARD.encode(&data),
            }]
        });

        let response: PublishResponse = self
            .send_json(
                self.request(Method::POST, self.pubsub_url(&format!("{}:publish", topic)))
                    .json(&body),
            )
            .await?;

        response
            .message_ids
            .into_iter()
            .next()
            .map(MessageId::from_string)
            .ok_or_else(|| Error::backend(None, "publish returned no message id"))
    }

    async fn pull(
        &self,
        subscription: &str,
        options: &PullOptions,
    ) -> Result<Vec<ReceivedMessage>> {
        let response: PullResponse = self
            .send_json(
                self.request(
                    Method::POST,
                    self.pubsub_url(&format!("{}:pull", subscription)),
                )
                .json(options),
            )
            .await?;

        let mut messages = Vec::with_capacity(response.received_messages.len());
        for received in response.received_messages {
            let data = match base64::engine::general_purpose::STANDARD
                .decode(received.message.data.as_bytes())
            {
                Ok(data) => data,
                Err(e) => {
                    // Undecodable data never becomes decodable, so redelivery is pointless.
                    warn!(
                        subscription = %subscription,
                        message_id = %received.message.message_id,
                        error = %e,
                        "Acknowledging message with invalid base64 data"
                    );
                    METRICS
                        .messages_dropped_total
                        .with_label_values(&["pull", "invalid_data"])
                        .inc();
                    if let Err(e) = self.acknowledge(subscription, &received.ack_id).await {
                        warn!(error = %e, "Failed to acknowledge undecodable message");
                    }
                    continue;
                }
            };

            messages.push(ReceivedMessage {
                ack_id: received.ack_id,
                message_id: MessageId::from_string(received.message.message_id),
                data,
                attributes: received.message.attributes,
                publish_time: received.message.publish_time.unwrap_or_else(Utc::now),
            });
        }

        Ok(messages)
    }

    async fn acknowledge(&self, subscription: &str, ack_id: &str) -> Result<()> {
        self.send_empty(
            self.request(
                Method::POST,
                self.pubsub_url(&format!("{}:acknowledge", subscription)),
            )
            .json(&json!({ "ackIds": [ack_id] })),
        )
        .await
    }

    async fn modify_ack_deadline(
        &self,
        subscription: &str,
        ack_id: &str,
        deadline_seconds: u32,
    ) -> Result<()> {
        self.send_empty(
            self.request(
                Method::POST,
                self.pubsub_url(&format!("{}:modifyAckDeadline", subscription)),
            )
            .json(&json!({ "ackIds": [ack_id], "ackDeadlineSeconds": deadline_seconds })),
        )
        .await
    }
}

#[async_trait]
impl TaskQueueAdmin for RestBackend {
    async fn queue_exists(&self, queue: &str) -> Result<bool> {
        self.exists(self.tasks_url(queue)).await
    }

    async fn create_queue(&self, queue: &str) -> Result<String> {
        let location = queue
            .rsplit_once("/queues/")
            .map(|(location, _)| location)
            .ok_or_else(|| Error::backend(None, format!("invalid queue name: {}", queue)))?;

        debug!(queue = %queue, "Creating queue via REST");
        let created: NamedResource = self
            .send_json(
                self.request(Method::POST, self.tasks_url(&format!("{}/queues", location)))
                    .json(&json!({ "name": queue })),
            )
            .await?;
        Ok(created.name)
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.send_empty(self.request(Method::DELETE, self.tasks_url(queue)))
            .await
    }

    async fn list_queues(&self, location: &str) -> Result<Vec<String>> {
        self.list_all(
            self.tasks_url(&format!("{}/queues", location)),
            |r: ListQueuesResponse| (r.queues, r.next_page_token),
        )
        .await
    }
}

#[async_trait]
impl TaskSubmitter for RestBackend {
    async fn create_task(&self, queue: &str, task: &Task) -> Result<String> {
        let created: NamedResource = self
            .send_json(
                self.request(Method::POST, self.tasks_url(&format!("{}/tasks", queue)))
                    .json(&CreateTaskRequest { task }),
            )
            .await?;
        Ok(created.name)
    }
}

#[async_trait]
impl QueueBackend for RestBackend {
    async fn health_check(&self) -> Result<HealthStatus> {
        let response = self
            .request(Method::GET, self.config.pubsub_endpoint.clone())
            .send()
            .await;

        // The API root answers 404 when reachable; auth and server errors are not healthy.
        Ok(match response {
            Ok(response)
                if response.status().is_server_error()
                    || response.status() == StatusCode::UNAUTHORIZED
                    || response.status() == StatusCode::FORBIDDEN =>
            {
                HealthStatus::Unhealthy(format!(
                    "{} returned status {}",
                    self.config.pubsub_endpoint,
                    response.status()
                ))
            }
            Ok(_) => HealthStatus::Healthy,
            Err(e) => HealthStatus::Unhealthy(e.to_string()),
        })
    }
}
