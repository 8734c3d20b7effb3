// Commands module
/// Serve command implementation
pub mod serve;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::cli::{
    output::*, Commands, GatewayArgs, PublishCommands, QueueCommands, SubscriptionCommands,
    TopicCommands,
};
use crate::config::GatewayConfig;
use crate::server::gateway::{
    CreateTopicRequest, HealthResponse, PublishRequest, PullRequest, TaskRequest,
};
use crate::types::{OperationResult, ResourceName};

/// Row of a resource listing
#[derive(Debug, Serialize, Deserialize, Tabled)]
struct ResourceRow {
    id: String,
    name: String,
}

impl ResourceRow {
    fn from_name(name: String) -> Self {
        Self {
            id: ResourceName::short_id(&name).to_string(),
            name,
        }
    }
}

/// HTTP client for a running gateway
struct GatewayClient {
    base_url: String,
    http: reqwest::Client,
}

impl GatewayClient {
    fn new(args: &GatewayArgs) -> Self {
        Self {
            base_url: args.gateway_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read(response: reqwest::Response) -> anyhow::Result<OperationResult> {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        serde_json::from_str(&text)
            .with_context(|| format!("Unexpected gateway response ({}): {}", status, text))
    }

    async fn get(&self, path: &str) -> anyhow::Result<OperationResult> {
        let response = self
            .http
            .get(self.url(path))
            .send()
            .await
            .context("Failed to connect to gateway")?;
        Self::read(response).await
    }

    async fn post<T: Serialize>(&self, path: &str, body: &T) -> anyhow::Result<OperationResult> {
        let response = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .context("Failed to connect to gateway")?;
        Self::read(response).await
    }

    async fn delete(&self, path: &str) -> anyhow::Result<OperationResult> {
        let response = self
            .http
            .delete(self.url(path))
            .send()
            .await
            .context("Failed to connect to gateway")?;
        Self::read(response).await
    }
}

/// Turn a failed envelope into an error after printing it.
fn finish(result: OperationResult) -> anyhow::Result<()> {
    print_result(&result);
    if result.is_info() {
        Ok(())
    } else {
        anyhow::bail!("Gateway returned {}", result.envelope().code)
    }
}

fn print_names(result: OperationResult, format: &str) -> anyhow::Result<()> {
    if !result.is_info() {
        return finish(result);
    }

    let names: Vec<String> = serde_json::from_value(result.envelope().message.clone())
        .context("Failed to parse listing")?;
    let rows: Vec<ResourceRow> = names.into_iter().map(ResourceRow::from_name).collect();
    print_list(&rows, OutputFormat::parse(format))
}

fn parse_payload(data: &str) -> anyhow::Result<serde_json::Value> {
    serde_json::from_str(data).context("Payload must be valid JSON")
}

/// Execute a CLI command
pub async fn execute_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Serve(args) => serve::execute(args).await,
        Commands::Topic(cmd) => execute_topic_command(cmd).await,
        Commands::Subscription(cmd) => execute_subscription_command(cmd).await,
        Commands::Queue(cmd) => execute_queue_command(cmd).await,
        Commands::Publish(cmd) => execute_publish_command(cmd).await,
        Commands::Pull {
            subscription,
            topic,
            max_messages,
            gateway,
        } => {
            let request = PullRequest {
                subscription,
                topic,
                max_messages,
            };
            finish(GatewayClient::new(&gateway).post("/pubsub/pull", &request).await?)
        }
        Commands::Health { gateway } => execute_health(gateway).await,
        Commands::Config { config } => execute_config(config),
    }
}

async fn execute_topic_command(command: TopicCommands) -> anyhow::Result<()> {
    match command {
        TopicCommands::Create {
            topic,
            subscription,
            mode,
            gateway,
        } => {
            let request = CreateTopicRequest {
                topic,
                subscription,
                mode,
            };
            finish(GatewayClient::new(&gateway).post("/pubsub/topics", &request).await?)
        }
        TopicCommands::List { gateway, format } => {
            print_names(GatewayClient::new(&gateway).get("/pubsub/topics").await?, &format)
        }
        TopicCommands::Delete { topic, gateway } => finish(
            GatewayClient::new(&gateway)
                .delete(&format!("/pubsub/topics/{}", topic))
                .await?,
        ),
    }
}

async fn execute_subscription_command(command: SubscriptionCommands) -> anyhow::Result<()> {
    match command {
        SubscriptionCommands::List { gateway, format } => print_names(
            GatewayClient::new(&gateway)
                .get("/pubsub/subscriptions")
                .await?,
            &format,
        ),
        SubscriptionCommands::Delete {
            subscription,
            gateway,
        } => finish(
            GatewayClient::new(&gateway)
                .delete(&format!("/pubsub/subscriptions/{}", subscription))
                .await?,
        ),
    }
}

async fn execute_queue_command(command: QueueCommands) -> anyhow::Result<()> {
    match command {
        QueueCommands::List { gateway, format } => {
            print_names(GatewayClient::new(&gateway).get("/tasks/queues").await?, &format)
        }
        QueueCommands::Delete { queue, gateway } => finish(
            GatewayClient::new(&gateway)
                .delete(&format!("/tasks/queues/{}", queue))
                .await?,
        ),
    }
}

async fn execute_publish_command(command: PublishCommands) -> anyhow::Result<()> {
    match command {
        PublishCommands::Message {
            data,
            topic,
            subscription,
            mode,
            gateway,
        } => {
            let request = PublishRequest {
                topic,
                subscription,
                mode,
                message: parse_payload(&data)?,
            };
            finish(GatewayClient::new(&gateway).post("/pubsub/publish", &request).await?)
        }
        PublishCommands::Task {
            data,
            queue,
            uri,
            gateway,
        } => {
            let request = TaskRequest {
                queue,
                uri,
                message: parse_payload(&data)?,
            };
            finish(GatewayClient::new(&gateway).post("/tasks/publish", &request).await?)
        }
    }
}

async fn execute_health(gateway: GatewayArgs) -> anyhow::Result<()> {
    let client = GatewayClient::new(&gateway);
    let response = client
        .http
        .get(client.url("/health"))
        .send()
        .await
        .context("Failed to connect to gateway")?;

    let health: HealthResponse = response
        .json()
        .await
        .context("Failed to parse response")?;

    if health.status == "healthy" {
        print_success(&format!("Gateway is {}", health.status));
        print_info(&format!("Backend: {}", health.backend));
        Ok(())
    } else {
        print_error(&format!("Gateway is {}", health.status));
        print_warning(&format!("Backend: {}", health.backend));
        anyhow::bail!("Gateway is unhealthy")
    }
}

fn execute_config(path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let config = match &path {
        Some(path) => GatewayConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => {
            print_info("No config file given, showing defaults");
            GatewayConfig::default()
        }
    };

    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
