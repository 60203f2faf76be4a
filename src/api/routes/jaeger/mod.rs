//! Jaeger-compatible query API.
//!
//! Serves the read side of the Jaeger HTTP API: service catalog,
//! operations per service, trace search and single-trace lookup. Span data
//! comes back from the storage engine as flat rows and is reassembled into
//! the Jaeger span model by [`model`].

pub mod model;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};

use crate::domain::fields;
use crate::domain::search::{self, QueryError, SearchConfig, TraceQueryParams};
use crate::storage::TraceStorage;
use crate::utils::time::now_nanos;

use model::{JaegerApiError, JaegerApiResponse, JaegerData};

/// Default number of traces returned by the search endpoint when the
/// caller does not pass `limit`, matching Jaeger's own default.
const DEFAULT_TRACE_SEARCH_LIMIT: usize = 20;

#[derive(Clone)]
pub struct JaegerApiState {
    pub storage: Arc<dyn TraceStorage>,
    pub search: SearchConfig,
}

pub fn routes(storage: Arc<dyn TraceStorage>, search: SearchConfig) -> Router {
    let state = JaegerApiState { storage, search };

    Router::new()
        .route("/select/jaeger/api/services", get(get_services))
        .route(
            "/select/jaeger/api/services/{service}/operations",
            get(get_operations),
        )
        .route("/select/jaeger/api/traces", get(find_traces))
        .route("/select/jaeger/api/traces/{trace_id}", get(get_trace))
        .with_state(state)
}

async fn get_services(State(state): State<JaegerApiState>) -> Response {
    match search::get_service_names(state.storage.as_ref(), &state.search, now_nanos()).await {
        Ok(names) => names_response(names),
        Err(e) => query_error_response(e),
    }
}

async fn get_operations(
    State(state): State<JaegerApiState>,
    Path(service): Path<String>,
) -> Response {
    match search::get_span_names(state.storage.as_ref(), &state.search, now_nanos(), &service)
        .await
    {
        Ok(names) => names_response(names),
        Err(e) => query_error_response(e),
    }
}

async fn get_trace(
    State(state): State<JaegerApiState>,
    Path(trace_id): Path<String>,
) -> Response {
    let rows =
        match search::get_trace(state.storage.as_ref(), &state.search, now_nanos(), &trace_id)
            .await
        {
            Ok(rows) => rows,
            Err(e) => return query_error_response(e),
        };

    let (traces, diagnostics) = model::rows_to_traces(&rows);
    if traces.is_empty() {
        let response = JaegerApiResponse {
            errors: vec![JaegerApiError {
                code: StatusCode::NOT_FOUND.as_u16(),
                msg: format!("trace not found: {trace_id}"),
                trace_id: Some(trace_id),
            }],
            ..Default::default()
        };
        return (StatusCode::NOT_FOUND, Json(response)).into_response();
    }
    traces_response(traces, diagnostics, 0)
}

async fn find_traces(
    State(state): State<JaegerApiState>,
    Query(raw_params): Query<Vec<(String, String)>>,
) -> Response {
    let now = now_nanos();
    let params = match parse_trace_query(&raw_params, &state.search, now) {
        Ok(params) => params,
        Err(msg) => {
            let response = JaegerApiResponse {
                errors: vec![JaegerApiError {
                    code: StatusCode::BAD_REQUEST.as_u16(),
                    msg,
                    trace_id: None,
                }],
                ..Default::default()
            };
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };

    match search::get_trace_list(state.storage.as_ref(), &state.search, now, &params).await {
        Ok((_trace_ids, rows)) => {
            let (traces, diagnostics) = model::rows_to_traces(&rows);
            traces_response(traces, diagnostics, params.limit)
        }
        Err(e) => query_error_response(e),
    }
}

/// Build [`TraceQueryParams`] from the Jaeger query string.
///
/// `tag` may repeat (`tag=k:v`); `tags` carries a JSON object. Durations
/// accept both humane strings (`100ms`, `1.5s`) and plain microsecond
/// integers. `start`/`end` are microseconds since the epoch, defaulting to
/// the catalog lookbehind window ending now.
fn parse_trace_query(
    raw_params: &[(String, String)],
    search: &SearchConfig,
    now: i64,
) -> Result<TraceQueryParams, String> {
    let mut params = TraceQueryParams {
        limit: DEFAULT_TRACE_SEARCH_LIMIT,
        ..Default::default()
    };
    let mut start_min: Option<i64> = None;
    let mut start_max: Option<i64> = None;

    for (key, value) in raw_params {
        match key.as_str() {
            "service" => params.service_name = value.clone(),
            "operation" => params.span_name = value.clone(),
            "tag" => {
                let (tag_key, tag_value) = value
                    .split_once(':')
                    .ok_or_else(|| format!("malformed tag parameter {value:?}; expected key:value"))?;
                params.attributes.push((
                    format!("{}{}", fields::SPAN_ATTR_PREFIX, tag_key),
                    tag_value.to_string(),
                ));
            }
            "tags" => {
                let tags: HashMap<String, String> = serde_json::from_str(value)
                    .map_err(|e| format!("malformed tags parameter {value:?}: {e}"))?;
                for (tag_key, tag_value) in tags {
                    params
                        .attributes
                        .push((format!("{}{}", fields::SPAN_ATTR_PREFIX, tag_key), tag_value));
                }
            }
            "minDuration" => params.duration_min_ns = parse_duration_param(value)?,
            "maxDuration" => params.duration_max_ns = parse_duration_param(value)?,
            "start" => start_min = Some(parse_micros_param("start", value)?),
            "end" => start_max = Some(parse_micros_param("end", value)?),
            "limit" => {
                let limit: usize = value
                    .parse()
                    .map_err(|_| format!("cannot parse limit {value:?}"))?;
                if limit > 0 {
                    params.limit = limit;
                }
            }
            // lookback and friends are Jaeger-UI hints without a server
            // counterpart here
            _ => {}
        }
    }

    params.start_time_max =
        start_max.unwrap_or(now);
    params.start_time_min = start_min.unwrap_or_else(|| {
        params.start_time_max - search.service_and_span_name_lookbehind.as_nanos() as i64
    });
    if params.start_time_min > params.start_time_max {
        return Err(format!(
            "start ({}) must not be after end ({})",
            params.start_time_min, params.start_time_max
        ));
    }
    Ok(params)
}

fn parse_duration_param(value: &str) -> Result<i64, String> {
    if let Ok(duration) = humantime::parse_duration(value) {
        return Ok(duration.as_nanos() as i64);
    }
    // Jaeger clients may send a plain integer of microseconds
    if let Ok(micros) = value.parse::<i64>() {
        return Ok(micros.saturating_mul(1_000));
    }
    Err(format!("cannot parse duration {value:?}"))
}

fn parse_micros_param(name: &str, value: &str) -> Result<i64, String> {
    let micros: i64 = value
        .parse()
        .map_err(|_| format!("cannot parse {name} timestamp {value:?}"))?;
    Ok(micros.saturating_mul(1_000))
}

fn names_response(names: Vec<String>) -> Response {
    let response = JaegerApiResponse {
        total: names.len(),
        data: Some(JaegerData::Names(names)),
        ..Default::default()
    };
    Json(response).into_response()
}

fn traces_response(traces: Vec<model::Trace>, diagnostics: Vec<String>, limit: usize) -> Response {
    let response = JaegerApiResponse {
        total: traces.len(),
        limit,
        data: Some(JaegerData::Traces(traces)),
        errors: diagnostics
            .into_iter()
            .map(|msg| JaegerApiError {
                code: StatusCode::UNPROCESSABLE_ENTITY.as_u16(),
                msg,
                trace_id: None,
            })
            .collect(),
        ..Default::default()
    };
    Json(response).into_response()
}

fn query_error_response(e: QueryError) -> Response {
    tracing::error!(error = %e, "trace query failed");
    let response = JaegerApiResponse {
        errors: vec![JaegerApiError {
            code: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            msg: e.to_string(),
            trace_id: None,
        }],
        ..Default::default()
    };
    (StatusCode::INTERNAL_SERVER_ERROR, Json(response)).into_response()
}
