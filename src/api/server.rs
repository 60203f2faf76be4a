//! API server initialization

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::compression::CompressionLayer;

use super::routes::{health, jaeger, otlp};
use crate::app::CoreApp;
use crate::domain::dedup::TraceIdDedup;
use crate::domain::search::SearchConfig;
use crate::metrics;
use crate::storage::TraceStorage;

pub struct ApiServer {
    app: CoreApp,
}

impl ApiServer {
    pub fn new(app: CoreApp) -> Self {
        Self { app }
    }

    pub async fn start(self) -> Result<()> {
        let app = self.app;
        let addr = SocketAddr::new(app.config.server.host.parse()?, app.config.server.port);

        let router = router(
            app.storage.clone(),
            app.dedup.clone(),
            app.config.search.clone(),
            app.config.insert.max_request_size as usize,
        );

        let listener = TcpListener::bind(addr).await?;
        tracing::info!(
            addr = %addr,
            storage = %app.config.storage,
            "tracelake listening"
        );

        let shutdown = app.shutdown.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await?;
        Ok(())
    }
}

/// Assemble the full application router. Shared by the server and the
/// integration tests.
pub fn router(
    storage: Arc<dyn TraceStorage>,
    dedup: Arc<TraceIdDedup>,
    search: SearchConfig,
    max_request_size: usize,
) -> Router {
    Router::new()
        .merge(otlp::routes(storage.clone(), dedup, max_request_size))
        .merge(jaeger::routes(storage, search))
        .route("/health", get(health::health))
        .route("/metrics", get(serve_metrics))
        .layer(CompressionLayer::new())
}

async fn serve_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}
