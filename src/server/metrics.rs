//! Metrics HTTP server for Prometheus scraping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::metrics;
use crate::server::shutdown::shutdown_receiver;

/// Metrics endpoint handler
async fn metrics_handler() -> Response {
    match metrics::get_metrics().gather() {
        Ok(output) => (StatusCode::OK, output).into_response(),
        Err(e) => {
            error!("Failed to gather metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to gather metrics").into_response()
        }
    }
}

/// Router serving `/metrics`.
pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(
    bind_address: String,
    port: u16,
    shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", bind_address, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Metrics server listening on {}", addr);

    axum::serve(listener, metrics_router())
        .with_graceful_shutdown(shutdown_receiver(shutdown_rx))
        .await
        .map_err(|e| {
            error!("Metrics server error: {}", e);
            anyhow::anyhow!("Metrics server failed: {}", e)
        })?;

    info!("Metrics server shut down gracefully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_metrics_endpoint() {
        metrics::METRICS
            .tasks_created_total
            .with_label_values(&["projects/p/locations/l/queues/q"])
            .inc();

        let request = Request::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let response = metrics_router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(body.contains("qbridge_tasks_created_total"));
    }

    #[tokio::test]
    async fn test_start_metrics_server_shuts_down() {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let server_handle = tokio::spawn(async move {
            start_metrics_server("127.0.0.1".to_string(), 0, shutdown_rx).await
        });

        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        let _ = shutdown_tx.send(());

        let result = server_handle.await.unwrap();
        assert!(result.is_ok());
    }
}
