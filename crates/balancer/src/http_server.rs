//! HTTP server for the Prometheus metrics endpoint.

use crate::error::Result;
use crate::metrics::MetricsRegistry;
use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// HTTP server for metrics endpoint
pub struct MetricsServer {
    /// Metrics registry
    registry: Arc<MetricsRegistry>,
    /// Listen address
    listen_addr: String,
}

impl MetricsServer {
    /// Create a new metrics server
    pub fn new(registry: Arc<MetricsRegistry>, listen_addr: String) -> Self {
        Self {
            registry,
            listen_addr,
        }
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(self.registry.clone())
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        info!(listen_addr = %self.listen_addr, "Metrics server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}

/// Handler for /metrics endpoint
async fn metrics_handler(State(registry): State<Arc<MetricsRegistry>>) -> Response {
    match registry.encode() {
        Ok(buffer) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            buffer,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
                .into_response()
        }
    }
}
