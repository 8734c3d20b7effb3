//! Configuration system for qbridge.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{JwksVerifier, PushAuthenticator, SharedSecretVerifier, TokenVerifier};
use crate::backend::memory::{InMemoryBackend, InMemoryConfig};
use crate::backend::rest::{RestBackend, RestConfig, DEFAULT_PUBSUB_ENDPOINT, DEFAULT_TASKS_ENDPOINT};
use crate::backend::Backends;
use crate::dispatch::{AckMode, DispatchOptions, ResourceLimits};
use crate::publisher::PublishPolicy;
use crate::types::PullOptions;
use crate::{Error, Result};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Server configuration.
    pub server: ServerConfig,
    /// Pub/Sub configuration.
    pub pubsub: PubsubConfig,
    /// Task queue configuration.
    pub tasks: TasksConfig,
    /// Backend selection.
    pub backend: BackendConfig,
    /// Push identity verification.
    pub auth: AuthConfig,
    /// Consumer dispatch.
    pub dispatch: DispatchConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_address: String,
    /// Gateway HTTP port.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Pub/Sub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PubsubConfig {
    /// Project owning topics and subscriptions.
    pub project_id: String,
    /// Existence checks and auto-creation on publish.
    pub publish: PublishPolicy,
    /// Options for each pull call.
    pub pull: PullOptions,
}

impl Default for PubsubConfig {
    fn default() -> Self {
        Self {
            project_id: "local-project".to_string(),
            publish: PublishPolicy::default(),
            pull: PullOptions::default(),
        }
    }
}

/// Task queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    /// Project owning the queues. Falls back to the Pub/Sub project when empty.
    pub project_id: Option<String>,
    /// Queue location.
    pub location_id: String,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            location_id: "europe-west1".to_string(),
        }
    }
}

/// Backend configuration enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// In-process backend.
    InMemory {
        /// Seconds before an unacknowledged message is redelivered.
        #[serde(default = "default_ack_deadline")]
        ack_deadline_seconds: u32,
        /// Recent publishes kept for inspection.
        #[serde(default = "default_published_log_capacity")]
        published_log_capacity: usize,
    },
    /// Google REST APIs or a compatible emulator.
    Rest {
        /// Pub/Sub API base URL.
        #[serde(default = "default_pubsub_endpoint")]
        pubsub_endpoint: String,
        /// Cloud Tasks API base URL.
        #[serde(default = "default_tasks_endpoint")]
        tasks_endpoint: String,
        /// Bearer access token.
        #[serde(default)]
        access_token: Option<String>,
        /// Request timeout in seconds.
        #[serde(default = "default_request_timeout")]
        timeout_seconds: u64,
    },
}

fn default_ack_deadline() -> u32 {
    InMemoryConfig::default().ack_deadline_seconds
}

fn default_published_log_capacity() -> usize {
    InMemoryConfig::default().published_log_capacity
}

fn default_pubsub_endpoint() -> String {
    DEFAULT_PUBSUB_ENDPOINT.to_string()
}

fn default_tasks_endpoint() -> String {
    DEFAULT_TASKS_ENDPOINT.to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::InMemory {
            ack_deadline_seconds: default_ack_deadline(),
            published_log_capacity: default_published_log_capacity(),
        }
    }
}

impl BackendConfig {
    /// Build the configured backend.
    pub fn build(&self) -> Result<Backends> {
        match self {
            BackendConfig::InMemory {
                ack_deadline_seconds,
                published_log_capacity,
            } => Ok(Backends::from_backend(Arc::new(InMemoryBackend::with_config(
                InMemoryConfig {
                    ack_deadline_seconds: *ack_deadline_seconds,
                    published_log_capacity: *published_log_capacity,
                },
            )))),
            BackendConfig::Rest {
                pubsub_endpoint,
                tasks_endpoint,
                access_token,
                timeout_seconds,
            } => {
                let backend = RestBackend::new(RestConfig {
                    pubsub_endpoint: pubsub_endpoint.clone(),
                    tasks_endpoint: tasks_endpoint.clone(),
                    access_token: access_token.clone(),
                    timeout: Duration::from_secs(*timeout_seconds),
                })?;
                Ok(Backends::from_backend(Arc::new(backend)))
            }
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::InMemory { .. } => "in_memory",
            BackendConfig::Rest { .. } => "rest",
        }
    }
}

/// Push identity verification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Verify the bearer token on push deliveries.
    pub enabled: bool,
    /// Service-account email the token must carry.
    pub expected_email: String,
    /// Audience the token must carry.
    pub expected_audience: String,
    /// JWKS endpoint. Defaults to Google's certificates.
    pub jwks_uri: Option<String>,
    /// HS256 secret used instead of JWKS, for emulators.
    pub shared_secret: Option<String>,
    /// Accept unsigned push deliveries with the REST backend.
    pub allow_unauthenticated_push: bool,
}

impl AuthConfig {
    /// Build the push authenticator, or `None` when verification is off.
    pub fn authenticator(&self) -> Option<PushAuthenticator> {
        if !self.enabled {
            return None;
        }

        let verifier: Arc<dyn TokenVerifier> = match (&self.shared_secret, &self.jwks_uri) {
            (Some(secret), _) => Arc::new(SharedSecretVerifier::new(secret.as_bytes())),
            (None, Some(uri)) => Arc::new(JwksVerifier::new(
                uri.clone(),
                crate::auth::GOOGLE_ISSUERS.iter().map(|s| s.to_string()).collect(),
            )),
            (None, None) => Arc::new(JwksVerifier::google()),
        };

        Some(PushAuthenticator::new(
            verifier,
            self.expected_email.clone(),
            self.expected_audience.clone(),
        ))
    }
}

/// Consumer dispatch configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Pull acknowledgement discipline.
    pub ack_mode: AckMode,
    /// Maximum payload size in bytes.
    pub max_payload_bytes: Option<usize>,
    /// Handler timeout in milliseconds.
    pub handler_timeout_ms: Option<u64>,
}

impl DispatchConfig {
    /// Dispatch options for the dispatcher.
    pub fn options(&self) -> DispatchOptions {
        DispatchOptions {
            ack_mode: self.ack_mode,
            limits: ResourceLimits {
                max_payload_bytes: self.max_payload_bytes,
                handler_timeout: self.handler_timeout_ms.map(Duration::from_millis),
            },
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level.
    pub level: String,
    /// Log format (text or json).
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Log format enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text format.
    Text,
    /// JSON format.
    Json,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics.
    pub enabled: bool,
    /// Metrics port.
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9090,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: GatewayConfig = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.pubsub.project_id.trim().is_empty() {
            return Err(Error::Config("pubsub.project_id must not be empty".to_string()));
        }
        if self.tasks.location_id.trim().is_empty() {
            return Err(Error::Config("tasks.location_id must not be empty".to_string()));
        }
        if self.server.port == 0 {
            return Err(Error::Config("server.port must not be 0".to_string()));
        }
        if self.metrics.enabled {
            if self.metrics.port == 0 {
                return Err(Error::Config("metrics.port must not be 0".to_string()));
            }
            if self.metrics.port == self.server.port {
                return Err(Error::Config(
                    "metrics.port must differ from server.port".to_string(),
                ));
            }
        }
        if self.pubsub.pull.max_messages == 0 {
            return Err(Error::Config("pubsub.pull.max_messages must be at least 1".to_string()));
        }
        if self.auth.enabled
            && (self.auth.expected_email.is_empty() || self.auth.expected_audience.is_empty())
        {
            return Err(Error::Config(
                "auth.expected_email and auth.expected_audience are required when auth is enabled"
                    .to_string(),
            ));
        }
        if matches!(self.backend, BackendConfig::Rest { .. })
            && !self.auth.enabled
            && !self.auth.allow_unauthenticated_push
        {
            return Err(Error::Config(
                "auth.enabled is required with the rest backend; set auth.allow_unauthenticated_push to accept unsigned pushes"
                    .to_string(),
            ));
        }
        if self.dispatch.handler_timeout_ms == Some(0) {
            return Err(Error::Config("dispatch.handler_timeout_ms must not be 0".to_string()));
        }
        Ok(())
    }

    /// Project owning task queues.
    pub fn tasks_project_id(&self) -> &str {
        self.tasks
            .project_id
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(&self.pubsub.project_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = GatewayConfig::default();
        config.validate().unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.backend.kind(), "in_memory");
        assert_eq!(config.tasks_project_id(), "local-project");
        assert_eq!(config.dispatch.options(), DispatchOptions::default());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[server]
port = 8081

[pubsub]
project_id = "demo"

[pubsub.publish]
allow_auto_create = false

[tasks]
location_id = "us-central1"

[backend]
type = "rest"
pubsub_endpoint = "http://localhost:8085/v1"

[auth]
enabled = true
expected_email = "pusher@demo.iam.gserviceaccount.com"
expected_audience = "https://gateway.example.com/pubsub/push"
shared_secret = "push-secret"

[dispatch]
ack_mode = "after_processing"
max_payload_bytes = 1024
handler_timeout_ms = 500

[logging]
format = "json"
"#
        )
        .unwrap();

        let config = GatewayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server.port, 8081);
        assert_eq!(config.pubsub.project_id, "demo");
        assert!(!config.pubsub.publish.allow_auto_create);
        assert!(config.pubsub.publish.verify_topic_exists);
        assert_eq!(config.tasks.location_id, "us-central1");
        assert_eq!(config.backend.kind(), "rest");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.auth.authenticator().is_some());

        let options = config.dispatch.options();
        assert_eq!(options.ack_mode, AckMode::AfterProcessing);
        assert_eq!(options.limits.max_payload_bytes, Some(1024));
        assert_eq!(options.limits.handler_timeout, Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_validate_rejects_empty_project() {
        let mut config = GatewayConfig::default();
        config.pubsub.project_id = " ".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_port_clash() {
        let mut config = GatewayConfig::default();
        config.metrics.port = config.server.port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_incomplete_auth() {
        let mut config = GatewayConfig::default();
        config.auth.enabled = true;
        config.auth.expected_email = "pusher@demo.iam.gserviceaccount.com".to_string();
        assert!(config.validate().is_err());

        config.auth.expected_audience = "https://gateway".to_string();
        config.validate().unwrap();
        assert!(config.auth.authenticator().is_some());
    }

    #[test]
    fn test_validate_rest_backend_requires_push_auth() {
        let mut config = GatewayConfig::default();
        config.backend = BackendConfig::Rest {
            pubsub_endpoint: default_pubsub_endpoint(),
            tasks_endpoint: default_tasks_endpoint(),
            access_token: None,
            timeout_seconds: default_request_timeout(),
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.auth.allow_unauthenticated_push = true;
        config.validate().unwrap();
        assert!(config.auth.authenticator().is_none());

        config.auth.allow_unauthenticated_push = false;
        config.auth.enabled = true;
        config.auth.expected_email = "pusher@demo.iam.gserviceaccount.com".to_string();
        config.auth.expected_audience = "https://gateway".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn test_auth_disabled_has_no_authenticator() {
        assert!(AuthConfig::default().authenticator().is_none());
    }
}
