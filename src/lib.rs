//! TraceLake: OpenTelemetry trace ingestion and Jaeger query service on
//! top of a columnar log store.
//!
//! The write path flattens OTLP span trees into flat field rows
//! ([`domain::flatten`]) and maintains a partitioned trace-id index stream
//! gated by an approximate dedup set ([`domain::dedup`]). The read path
//! plans time-window-bounded scans ([`domain::search`]) and reassembles
//! the flat rows into Jaeger spans ([`api::routes::jaeger::model`]).

pub mod api;
pub mod app;
pub mod core;
pub mod domain;
pub mod metrics;
pub mod storage;
pub mod utils;
