//! Gateway HTTP API: administration, publishing and consumer endpoints.
//!
//! Every endpoint except `/health` answers with the result envelope, using the
//! envelope's code as the HTTP status.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::admin::{Admin, TaskAdmin};
use crate::auth::PushAuthenticator;
use crate::backend::{Backends, HealthCheck, HealthStatus};
use crate::config::GatewayConfig;
use crate::dispatch::{Dispatcher, MessageHandler};
use crate::metrics::METRICS;
use crate::publisher::Publisher;
use crate::server::shutdown::shutdown_receiver;
use crate::transport::Transport;
use crate::types::{DeliveryMode, OperationResult, PullOptions, PushRequest};

/// Shared state for gateway handlers.
#[derive(Clone)]
pub struct GatewayState {
    admin: Admin,
    task_admin: TaskAdmin,
    publisher: Publisher,
    dispatcher: Dispatcher,
    authenticator: Option<PushAuthenticator>,
    health: Arc<dyn HealthCheck>,
    pull: PullOptions,
    cancel: CancellationToken,
}

impl GatewayState {
    /// Wire the gateway services over `backends`.
    ///
    /// `cancel` is the shutdown token; each pull batch runs under a child of it.
    pub fn new(
        backends: &Backends,
        config: &GatewayConfig,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Self {
        let project_id = config.pubsub.project_id.as_str();
        let transport = Transport::new(backends.transport.clone(), project_id);

        Self {
            admin: Admin::new(backends.pubsub.clone(), project_id),
            task_admin: TaskAdmin::new(
                backends.queues.clone(),
                config.tasks_project_id(),
                config.tasks.location_id.as_str(),
            ),
            publisher: Publisher::new(
                backends,
                project_id,
                config.tasks.location_id.as_str(),
                config.pubsub.publish,
            )
            .with_tasks_project(config.tasks_project_id()),
            dispatcher: Dispatcher::new(transport, handler, config.dispatch.options()),
            authenticator: config.auth.authenticator(),
            health: backends.health.clone(),
            pull: config.pubsub.pull.clone(),
            cancel,
        }
    }

    /// Replace the push authenticator.
    pub fn with_authenticator(mut self, authenticator: Option<PushAuthenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }
}

/// Body of `POST /pubsub/topics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTopicRequest {
    /// Topic id.
    pub topic: String,
    /// Subscription id.
    pub subscription: String,
    /// `pull` or `push`.
    #[serde(default = "default_mode")]
    pub mode: String,
}

/// Body of `POST /pubsub/publish`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    /// Topic id.
    pub topic: String,
    /// Subscription id.
    pub subscription: String,
    /// `pull` or `push`.
    #[serde(default = "default_mode")]
    pub mode: String,
    /// JSON payload.
    pub message: Value,
}

/// Body of `POST /pubsub/pull`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    /// Subscription id to pull from.
    pub subscription: String,
    /// Origin topic id failed messages are re-published to.
    pub topic: String,
    /// Overrides the configured batch size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_messages: Option<u32>,
}

/// Body of `POST /tasks/publish`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Queue id.
    pub queue: String,
    /// Relative URI the task is delivered to.
    pub uri: String,
    /// JSON payload.
    pub message: Value,
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `healthy` or `unhealthy`.
    pub status: String,
    /// Backend detail.
    pub backend: String,
}

fn default_mode() -> String {
    DeliveryMode::Pull.as_str().to_string()
}

impl IntoResponse for OperationResult {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self)).into_response()
    }
}

fn respond(endpoint: &str, result: OperationResult) -> Response {
    let status = result.status_code();
    METRICS
        .api_requests_total
        .with_label_values(&[endpoint, status.as_str()])
        .inc();
    if !result.is_info() {
        warn!(endpoint = %endpoint, code = status.as_u16(), message = %result.envelope().message, "Request failed");
    }
    result.into_response()
}

fn listed(names: crate::Result<Vec<String>>) -> OperationResult {
    match names {
        Ok(names) => OperationResult::info(StatusCode::OK, json!(names)),
        Err(e) => e.into(),
    }
}

fn deleted(kind: &str, id: &str, result: crate::Result<()>) -> OperationResult {
    match result {
        Ok(()) => OperationResult::info(
            StatusCode::OK,
            Value::String(format!("{} : \"{}\" deleted.", kind, id)),
        ),
        Err(e) => e.into(),
    }
}

/// Health check endpoint
async fn health_check(State(state): State<GatewayState>) -> Response {
    let (code, backend) = match state.health.check().await {
        Ok(HealthStatus::Healthy) => (StatusCode::OK, "healthy".to_string()),
        Ok(HealthStatus::Unhealthy(reason)) => (StatusCode::SERVICE_UNAVAILABLE, reason),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    };

    let status = if code == StatusCode::OK {
        "healthy"
    } else {
        "unhealthy"
    };
    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            backend,
        }),
    )
        .into_response()
}

async fn create_topic(
    State(state): State<GatewayState>,
    Json(req): Json<CreateTopicRequest>,
) -> Response {
    let result = match req.mode.parse::<DeliveryMode>() {
        Ok(mode) => state
            .admin
            .ensure_topic_and_subscription(&req.topic, &req.subscription, mode)
            .await
            .into(),
        Err(e) => e.into(),
    };
    respond("create_topic", result)
}

async fn list_topics(State(state): State<GatewayState>) -> Response {
    respond("list_topics", listed(state.admin.list_topics().await))
}

async fn delete_topic(State(state): State<GatewayState>, Path(topic): Path<String>) -> Response {
    let result = state.admin.delete_topic(&topic).await;
    respond("delete_topic", deleted("Topic", &topic, result))
}

async fn list_subscriptions(State(state): State<GatewayState>) -> Response {
    respond(
        "list_subscriptions",
        listed(state.admin.list_subscriptions().await),
    )
}

async fn delete_subscription(
    State(state): State<GatewayState>,
    Path(subscription): Path<String>,
) -> Response {
    let result = state.admin.delete_subscription(&subscription).await;
    respond(
        "delete_subscription",
        deleted("Subscription", &subscription, result),
    )
}

async fn publish_message(
    State(state): State<GatewayState>,
    Json(req): Json<PublishRequest>,
) -> Response {
    let result = match serde_json::to_vec(&req.message) {
        Ok(payload) => {
            state
                .publisher
                .publish_message(payload, &req.mode, &req.topic, &req.subscription)
                .await
        }
        Err(e) => crate::Error::from(e).into(),
    };
    respond("publish_message", result)
}

async fn consume_push(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let data = match &state.authenticator {
        Some(authenticator) => {
            let authorization = headers
                .get(AUTHORIZATION)
                .and_then(|value| value.to_str().ok());
            authenticator.read_push(authorization, &body).await
        }
        None => serde_json::from_slice::<PushRequest>(&body)
            .map(|request| request.message.data)
            .map_err(crate::Error::from),
    };

    let result = match data {
        Ok(data) => state.dispatcher.consume_push(data).await,
        Err(e) => e.into(),
    };
    respond("consume_push", result)
}

async fn consume_pull(State(state): State<GatewayState>, Json(req): Json<PullRequest>) -> Response {
    let mut options = state.pull.clone();
    if let Some(max_messages) = req.max_messages {
        options.max_messages = max_messages;
    }

    let cancel = state.cancel.child_token();
    let result = state
        .dispatcher
        .consume_pull(&req.subscription, &req.topic, &options, &cancel)
        .await;
    respond("consume_pull", result.into())
}

async fn list_queues(State(state): State<GatewayState>) -> Response {
    respond("list_queues", listed(state.task_admin.list_queues().await))
}

async fn delete_queue(State(state): State<GatewayState>, Path(queue): Path<String>) -> Response {
    let result = state.task_admin.delete_queue(&queue).await;
    respond("delete_queue", deleted("Queue", &queue, result))
}

async fn publish_task(State(state): State<GatewayState>, Json(req): Json<TaskRequest>) -> Response {
    let result = match serde_json::to_vec(&req.message) {
        Ok(payload) => {
            state
                .publisher
                .publish_task(payload, &req.queue, &req.uri)
                .await
        }
        Err(e) => crate::Error::from(e).into(),
    };
    respond("publish_task", result)
}

async fn consume_task(State(state): State<GatewayState>, body: Bytes) -> Response {
    let result = state.dispatcher.consume_task(body.to_vec()).await;
    respond("consume_task", result)
}

/// Build the gateway router.
pub fn create_router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/pubsub/topics", post(create_topic).get(list_topics))
        .route("/pubsub/topics/{topic}", delete(delete_topic))
        .route("/pubsub/subscriptions", get(list_subscriptions))
        .route(
            "/pubsub/subscriptions/{subscription}",
            delete(delete_subscription),
        )
        .route("/pubsub/publish", post(publish_message))
        .route("/pubsub/push", post(consume_push))
        .route("/pubsub/pull", post(consume_pull))
        .route("/tasks/queues", get(list_queues))
        .route("/tasks/queues/{queue}", delete(delete_queue))
        .route("/tasks/publish", post(publish_task))
        .route("/tasks/consume", post(consume_task))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the gateway HTTP server
pub async fn start_gateway_server(
    state: GatewayState,
    bind_address: String,
    port: u16,
    shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", bind_address, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Gateway server listening on {}", addr);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown_receiver(shutdown_rx))
        .await
        .map_err(|e| {
            error!("Gateway server error: {}", e);
            anyhow::anyhow!("Gateway server failed: {}", e)
        })?;

    info!("Gateway server shut down gracefully");
    Ok(())
}
