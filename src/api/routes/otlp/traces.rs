//! OpenTelemetry trace export endpoint.

use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use opentelemetry_proto::tonic::collector::trace::v1::{
    ExportTraceServiceRequest, ExportTraceServiceResponse,
};
use serde::Deserialize;

use super::decompress::decompress_body;
use super::encoding::{decode_request, success_response, OtlpContentType};
use super::{envelope, OtlpState};
use crate::domain::flatten;
use crate::metrics::INGEST_METRICS;
use crate::storage::Row;

pub const INSERT_PATH: &str = "/insert/opentelemetry/v1/traces";

#[derive(Debug, Default, Deserialize)]
pub struct InsertParams {
    /// Comma-separated field names appended to the mandatory stream fields
    /// of every ingested span, for callers that know a better stream split.
    pub extra_stream_fields: Option<String>,
}

pub async fn export(
    State(state): State<OtlpState>,
    Query(params): Query<InsertParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let start_time = Instant::now();

    let Some(content_type) = OtlpContentType::from_headers(&headers) else {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        return bad_request(format!(
            "Content-Type {content_type:?} isn't supported for opentelemetry format; \
             use protobuf or JSON encoding"
        ));
    };
    let format = content_type.format_label();
    INGEST_METRICS
        .requests_total
        .with_label_values(&[INSERT_PATH, format])
        .inc();

    let content_encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok());
    let body = match decompress_body(content_encoding, body) {
        Ok(body) => body,
        Err(e) => {
            return bad_request(format!("cannot read OpenTelemetry protocol data: {e}"));
        }
    };

    let message_bytes = if content_type.is_enveloped() {
        match envelope::decode(&body) {
            Ok(message) => message,
            Err(e) => return bad_request(e.to_string()),
        }
    } else {
        body.as_ref()
    };

    let request: ExportTraceServiceRequest = match decode_request(message_bytes, content_type) {
        Ok(request) => request,
        Err(e) => {
            INGEST_METRICS
                .errors_total
                .with_label_values(&[INSERT_PATH, format])
                .inc();
            return e.into_response();
        }
    };

    let span_count: usize = request
        .resource_spans
        .iter()
        .flat_map(|rs| &rs.scope_spans)
        .map(|ss| ss.spans.len())
        .sum();

    let extra_stream_fields: Vec<String> = params
        .extra_stream_fields
        .as_deref()
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    let mut rows: Vec<Row> = Vec::new();
    flatten::push_export_request(&request, &mut rows, &state.dedup, &extra_stream_fields);

    if let Err(e) = state.storage.add_rows(rows).await {
        tracing::error!(error = %e, span_count, "cannot insert spans into storage");
        return storage_error_response(content_type, span_count, &e.to_string());
    }

    INGEST_METRICS
        .request_duration_seconds
        .with_label_values(&[INSERT_PATH, format])
        .observe(start_time.elapsed().as_secs_f64());

    let response = ExportTraceServiceResponse {
        partial_success: None,
    };
    success_response(&response, content_type)
}

fn bad_request(message: String) -> Response {
    tracing::warn!(error = %message, "rejecting trace export request");
    (
        StatusCode::BAD_REQUEST,
        [(header::CONTENT_TYPE, "text/plain")],
        message,
    )
        .into_response()
}

/// Post-parse storage failures reject the whole batch; enveloped clients
/// get the partial-success counts in the framed response.
fn storage_error_response(
    content_type: OtlpContentType,
    span_count: usize,
    error_message: &str,
) -> Response {
    if content_type.is_enveloped() {
        use opentelemetry_proto::tonic::collector::trace::v1::ExportTracePartialSuccess;
        use prost::Message;

        let response = ExportTraceServiceResponse {
            partial_success: Some(ExportTracePartialSuccess {
                rejected_spans: span_count as i64,
                error_message: error_message.to_string(),
            }),
        };
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, content_type.as_header_value())],
            envelope::encode(&response.encode_to_vec()),
        )
            .into_response();
    }
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "text/plain")],
        format!("cannot insert {span_count} spans into storage: {error_message}"),
    )
        .into_response()
}
