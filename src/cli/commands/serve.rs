// Serve command implementation
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::backend::rest::{DEFAULT_PUBSUB_ENDPOINT, DEFAULT_TASKS_ENDPOINT};
use crate::cli::{BackendKind, ServeArgs};
use crate::config::{BackendConfig, GatewayConfig};
use crate::dispatch::{EchoHandler, MessageHandler};
use crate::server::gateway::{start_gateway_server, GatewayState};
use crate::server::metrics::start_metrics_server;
use crate::server::shutdown::{wait_for_signal, ShutdownSignal};

/// Time allowed for servers to drain after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Load the config file (or defaults) and apply command-line overrides.
pub fn resolve_config(args: &ServeArgs) -> Result<GatewayConfig> {
    let mut config = match &args.config {
        Some(path) => GatewayConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => GatewayConfig::default(),
    };

    if let Some(bind_address) = &args.bind_address {
        config.server.bind_address = bind_address.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(port) = args.metrics_port {
        config.metrics.port = port;
    }
    if let Some(project_id) = &args.project_id {
        config.pubsub.project_id = project_id.clone();
    }
    if let Some(location_id) = &args.location_id {
        config.tasks.location_id = location_id.clone();
    }
    if let Some(ack_mode) = args.ack_mode {
        config.dispatch.ack_mode = ack_mode;
    }
    if args.allow_unauthenticated_push {
        config.auth.allow_unauthenticated_push = true;
    }

    match args.backend {
        Some(BackendKind::InMemory) if !matches!(config.backend, BackendConfig::InMemory { .. }) => {
            config.backend = BackendConfig::default();
        }
        Some(BackendKind::Rest) if !matches!(config.backend, BackendConfig::Rest { .. }) => {
            config.backend = BackendConfig::Rest {
                pubsub_endpoint: DEFAULT_PUBSUB_ENDPOINT.to_string(),
                tasks_endpoint: DEFAULT_TASKS_ENDPOINT.to_string(),
                access_token: None,
                timeout_seconds: 30,
            };
        }
        _ => {}
    }

    if let BackendConfig::Rest {
        pubsub_endpoint,
        tasks_endpoint,
        access_token,
        ..
    } = &mut config.backend
    {
        if let Some(endpoint) = &args.pubsub_endpoint {
            *pubsub_endpoint = endpoint.clone();
        }
        if let Some(endpoint) = &args.tasks_endpoint {
            *tasks_endpoint = endpoint.clone();
        }
        if let Some(token) = &args.access_token {
            *access_token = Some(token.clone());
        }
    }

    config.validate()?;
    Ok(config)
}

/// Execute the serve command with the built-in echo handler.
pub async fn execute(args: ServeArgs) -> Result<()> {
    let config = resolve_config(&args)?;
    run(config, Arc::new(EchoHandler)).await
}

/// Run the gateway and metrics servers until SIGINT or SIGTERM.
pub async fn run(config: GatewayConfig, handler: Arc<dyn MessageHandler>) -> Result<()> {
    info!("Starting qbridge gateway");
    info!(
        project_id = %config.pubsub.project_id,
        location_id = %config.tasks.location_id,
        backend = config.backend.kind(),
        ack_mode = ?config.dispatch.ack_mode,
        push_auth = config.auth.enabled,
        "Configuration loaded successfully"
    );

    let backends = config
        .backend
        .build()
        .context("Failed to initialize backend")?;

    let shutdown = ShutdownSignal::new();
    let state = GatewayState::new(&backends, &config, handler, shutdown.token());

    let metrics_handle = if config.metrics.enabled {
        let bind_address = config.server.bind_address.clone();
        let port = config.metrics.port;
        let shutdown_rx = shutdown.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = start_metrics_server(bind_address, port, shutdown_rx).await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    let bind_address = config.server.bind_address.clone();
    let port = config.server.port;
    let shutdown_rx = shutdown.subscribe();
    let mut gateway_handle =
        tokio::spawn(
            async move { start_gateway_server(state, bind_address, port, shutdown_rx).await },
        );

    tokio::select! {
        _ = wait_for_signal() => {
            info!("Broadcasting shutdown signal to all servers");
            shutdown.shutdown();
        }
        result = &mut gateway_handle => {
            shutdown.shutdown();
            if let Some(handle) = metrics_handle {
                handle.abort();
            }
            return result.context("Gateway server task panicked")?;
        }
    }

    match tokio::time::timeout(SHUTDOWN_GRACE, gateway_handle).await {
        Ok(result) => result.context("Gateway server task panicked")??,
        Err(_) => warn!("Gateway server did not stop within {:?}", SHUTDOWN_GRACE),
    }
    if let Some(handle) = metrics_handle {
        if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
            warn!("Metrics server did not stop within {:?}", SHUTDOWN_GRACE);
        }
    }

    info!("Shutdown complete");
    Ok(())
}
