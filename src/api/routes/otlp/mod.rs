//! OpenTelemetry Protocol (OTLP) HTTP ingestion endpoint.

mod decompress;
mod encoding;
mod envelope;
mod traces;

pub use traces::INSERT_PATH;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::post;
use axum::Router;

use crate::domain::dedup::TraceIdDedup;
use crate::storage::TraceStorage;

#[derive(Clone)]
pub struct OtlpState {
    pub storage: Arc<dyn TraceStorage>,
    pub dedup: Arc<TraceIdDedup>,
}

pub fn routes(
    storage: Arc<dyn TraceStorage>,
    dedup: Arc<TraceIdDedup>,
    max_request_size: usize,
) -> Router {
    let state = OtlpState { storage, dedup };

    Router::new()
        .route(INSERT_PATH, post(traces::export))
        .layer(DefaultBodyLimit::max(max_request_size))
        .with_state(state)
}
