// CLI module for qbridge
/// Command execution handlers
pub mod commands;
/// Output formatting utilities
pub mod output;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::{GatewayConfig, LogFormat, LoggingConfig};
use crate::dispatch::AckMode;

const DEFAULT_GATEWAY_URL: &str = "http://localhost:8080";

/// Command-line interface for qbridge
#[derive(Parser)]
#[command(name = "qbridge")]
#[command(author, version, about = "HTTP gateway between handlers and Pub/Sub topics or Cloud Tasks queues", long_about = None)]
pub struct Cli {
    /// Log level filter (overrides the config file; RUST_LOG takes precedence)
    #[arg(long, global = true, env = "QBRIDGE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log output format
    #[arg(long, global = true, env = "QBRIDGE_LOG_FORMAT", value_enum)]
    pub log_format: Option<LogFormat>,

    /// The command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway server
    Serve(ServeArgs),

    /// Topic management commands
    #[command(subcommand)]
    Topic(TopicCommands),

    /// Subscription management commands
    #[command(subcommand)]
    Subscription(SubscriptionCommands),

    /// Task queue management commands
    #[command(subcommand)]
    Queue(QueueCommands),

    /// Publish a message or a task
    #[command(subcommand)]
    Publish(PublishCommands),

    /// Pull one batch from a subscription and dispatch it
    Pull {
        /// Subscription id
        subscription: String,

        /// Origin topic id failed messages are re-published to
        #[arg(long)]
        topic: String,

        /// Maximum messages in the batch
        #[arg(long)]
        max_messages: Option<u32>,

        #[command(flatten)]
        gateway: GatewayArgs,
    },

    /// Health check
    Health {
        #[command(flatten)]
        gateway: GatewayArgs,
    },

    /// Show the effective configuration
    Config {
        /// Configuration file
        #[arg(long, short, env = "QBRIDGE_CONFIG")]
        config: Option<PathBuf>,
    },
}

/// Location of a running gateway.
#[derive(Args, Clone)]
pub struct GatewayArgs {
    /// Gateway URL
    #[arg(long, env = "QBRIDGE_GATEWAY_URL", default_value = DEFAULT_GATEWAY_URL)]
    pub gateway_url: String,
}

/// Backend selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// In-process backend
    InMemory,
    /// Google REST APIs or an emulator
    Rest,
}

/// Arguments of `serve`. Each flag overrides the config file.
#[derive(Args, Clone, Default)]
pub struct ServeArgs {
    /// Configuration file
    #[arg(long, short, env = "QBRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Bind address (use 0.0.0.0 for all interfaces)
    #[arg(long, env = "QBRIDGE_BIND_ADDRESS")]
    pub bind_address: Option<String>,

    /// Gateway port
    #[arg(long, env = "QBRIDGE_PORT")]
    pub port: Option<u16>,

    /// Metrics port
    #[arg(long, env = "QBRIDGE_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Pub/Sub project id
    #[arg(long, env = "QBRIDGE_PROJECT_ID")]
    pub project_id: Option<String>,

    /// Cloud Tasks location id
    #[arg(long, env = "QBRIDGE_LOCATION_ID")]
    pub location_id: Option<String>,

    /// Backend
    #[arg(long, env = "QBRIDGE_BACKEND", value_enum)]
    pub backend: Option<BackendKind>,

    /// Pub/Sub endpoint for the REST backend
    #[arg(long, env = "QBRIDGE_PUBSUB_ENDPOINT")]
    pub pubsub_endpoint: Option<String>,

    /// Cloud Tasks endpoint for the REST backend
    #[arg(long, env = "QBRIDGE_TASKS_ENDPOINT")]
    pub tasks_endpoint: Option<String>,

    /// Access token for the REST backend
    #[arg(long, env = "QBRIDGE_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// Pull acknowledgement discipline
    #[arg(long, env = "QBRIDGE_ACK_MODE", value_enum)]
    pub ack_mode: Option<AckMode>,

    /// Accept unsigned push deliveries with the REST backend
    #[arg(long, env = "QBRIDGE_ALLOW_UNAUTHENTICATED_PUSH")]
    pub allow_unauthenticated_push: bool,
}

/// Topic management subcommands
#[derive(Subcommand)]
pub enum TopicCommands {
    /// Create a topic and its subscription
    Create {
        /// Topic id
        topic: String,

        /// Subscription id
        #[arg(long)]
        subscription: String,

        /// Subscription type (pull | push)
        #[arg(long, default_value = "pull")]
        mode: String,

        #[command(flatten)]
        gateway: GatewayArgs,
    },

    /// List topics
    List {
        #[command(flatten)]
        gateway: GatewayArgs,

        /// Output format (table | json)
        #[arg(long, short, default_value = "table")]
        format: String,
    },

    /// Delete a topic
    Delete {
        /// Topic id
        topic: String,

        #[command(flatten)]
        gateway: GatewayArgs,
    },
}

/// Subscription management subcommands
#[derive(Subcommand)]
pub enum SubscriptionCommands {
    /// List subscriptions
    List {
        #[command(flatten)]
        gateway: GatewayArgs,

        /// Output format (table | json)
        #[arg(long, short, default_value = "table")]
        format: String,
    },

    /// Delete a subscription
    Delete {
        /// Subscription id
        subscription: String,

        #[command(flatten)]
        gateway: GatewayArgs,
    },
}

/// Task queue management subcommands
#[derive(Subcommand)]
pub enum QueueCommands {
    /// List queues
    List {
        #[command(flatten)]
        gateway: GatewayArgs,

        /// Output format (table | json)
        #[arg(long, short, default_value = "table")]
        format: String,
    },

    /// Delete a queue
    Delete {
        /// Queue id
        queue: String,

        #[command(flatten)]
        gateway: GatewayArgs,
    },
}

/// Publishing subcommands
#[derive(Subcommand)]
pub enum PublishCommands {
    /// Publish a JSON message to a topic
    Message {
        /// JSON payload
        data: String,

        /// Topic id
        #[arg(long)]
        topic: String,

        /// Subscription id
        #[arg(long)]
        subscription: String,

        /// Subscription type (pull | push)
        #[arg(long, default_value = "pull")]
        mode: String,

        #[command(flatten)]
        gateway: GatewayArgs,
    },

    /// Create a task delivering a JSON body to a relative URI
    Task {
        /// JSON payload
        data: String,

        /// Queue id
        #[arg(long)]
        queue: String,

        /// Relative URI the task is delivered to
        #[arg(long, default_value = "/tasks/consume")]
        uri: String,

        #[command(flatten)]
        gateway: GatewayArgs,
    },
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Logging settings: the config file's, overridden by global flags.
    pub fn logging(&self) -> LoggingConfig {
        let path = match &self.command {
            Commands::Serve(args) => args.config.as_deref(),
            Commands::Config { config } => config.as_deref(),
            _ => None,
        };

        let mut logging = path
            .and_then(|p| GatewayConfig::from_file(p).ok())
            .map(|c| c.logging)
            .unwrap_or_default();

        if let Some(level) = &self.log_level {
            logging.level = level.clone();
        }
        if let Some(format) = self.log_format {
            logging.format = format;
        }
        logging
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serve_overrides() {
        let cli = Cli::parse_from([
            "qbridge",
            "serve",
            "--port",
            "8181",
            "--backend",
            "rest",
            "--ack-mode",
            "after-processing",
        ]);

        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.port, Some(8181));
                assert_eq!(args.backend, Some(BackendKind::Rest));
                assert_eq!(args.ack_mode, Some(AckMode::AfterProcessing));
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn test_parse_publish_message() {
        let cli = Cli::parse_from([
            "qbridge",
            "publish",
            "message",
            r#"{"id":1}"#,
            "--topic",
            "orders",
            "--subscription",
            "orders-sub",
        ]);

        match cli.command {
            Commands::Publish(PublishCommands::Message { mode, topic, .. }) => {
                assert_eq!(mode, "pull");
                assert_eq!(topic, "orders");
            }
            _ => panic!("expected publish message"),
        }
    }

    #[test]
    fn test_global_log_flags() {
        let cli = Cli::parse_from(["qbridge", "--log-format", "json", "--log-level", "debug", "health"]);
        let logging = cli.logging();
        assert_eq!(logging.format, LogFormat::Json);
        assert_eq!(logging.level, "debug");
    }
}
