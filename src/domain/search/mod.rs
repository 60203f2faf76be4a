//! Trace retrieval planner.
//!
//! Every read operation bounds the amount of columnar data scanned by
//! splitting time into windows instead of scanning `[0, now]` at once:
//!
//! - trace-by-id first probes the partitioned trace-id index stream with
//!   receding windows to locate the trace start time, then fans in on a
//!   narrow window around it;
//! - trace list discovery starts from the most recent minute and widens
//!   the window 5x per miss until enough trace ids are gathered.

pub mod collector;

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::domain::fields;
use crate::storage::{Query, Row, StorageError, TraceStorage};
use crate::utils::time::{nanos_to_rfc3339, rfc3339_to_nanos};

use self::collector::RowCollector;

/// Initial window width of the trace-id discovery phase.
const DISCOVERY_INITIAL_STEP: Duration = Duration::from_secs(60);

/// Discovered trace ids are interpolated into the fan-in query string, so
/// anything outside this alphabet is discarded.
static TRACE_ID_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9_\-.:]*$").expect("trace id regex must compile")
});

/// Search tunables, wired from the configuration layer.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Padding around discovered span times so no span of a trace is missed.
    pub max_duration_window: Duration,
    /// Lookbehind window of the service/operation catalogs.
    pub service_and_span_name_lookbehind: Duration,
    /// Window width of receding trace-by-id scans.
    pub search_step: Duration,
    pub max_service_name_list: u64,
    pub max_span_name_list: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_duration_window: Duration::from_secs(45),
            service_and_span_name_lookbehind: Duration::from_secs(3 * 24 * 3600),
            search_step: Duration::from_secs(24 * 3600),
            max_service_name_list: 1000,
            max_span_name_list: 1000,
        }
    }
}

/// Filter parameters of a trace list query.
#[derive(Debug, Clone, Default)]
pub struct TraceQueryParams {
    pub service_name: String,
    pub span_name: String,
    pub attributes: Vec<(String, String)>,
    /// Unix nanoseconds, inclusive.
    pub start_time_min: i64,
    pub start_time_max: i64,
    /// Zero disables the bound.
    pub duration_min_ns: i64,
    pub duration_max_ns: i64,
    pub limit: usize,
}

#[derive(Error, Debug)]
pub enum QueryError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("missing _time column in the result for the query [{query}]")]
    MissingTimeColumn { query: String },

    #[error("cannot parse timestamp {value:?}: not a valid RFC 3339 time")]
    InvalidTimestamp { value: String },
}

impl QueryError {
    fn is_out_of_retention(&self) -> bool {
        matches!(self, QueryError::Storage(e) if e.is_out_of_retention())
    }
}

/// Unique service names seen within the catalog lookbehind window.
pub async fn get_service_names(
    storage: &dyn TraceStorage,
    config: &SearchConfig,
    now: i64,
) -> Result<Vec<String>, QueryError> {
    let mut q = Query::new("*", now);
    q.add_time_filter(
        now - config.service_and_span_name_lookbehind.as_nanos() as i64,
        now,
    );
    let hits = storage
        .stream_field_values(
            &q,
            fields::RESOURCE_ATTR_SERVICE_NAME,
            config.max_service_name_list,
        )
        .await?;
    Ok(hits.into_iter().map(|h| h.value).collect())
}

/// Unique span names of one service within the catalog lookbehind window.
pub async fn get_span_names(
    storage: &dyn TraceStorage,
    config: &SearchConfig,
    now: i64,
    service_name: &str,
) -> Result<Vec<String>, QueryError> {
    let mut q = Query::new(
        format!(
            "_stream:{{{}={:?}}}",
            fields::RESOURCE_ATTR_SERVICE_NAME,
            service_name
        ),
        now,
    );
    q.add_time_filter(
        now - config.service_and_span_name_lookbehind.as_nanos() as i64,
        now,
    );
    let hits = storage
        .stream_field_values(&q, fields::NAME_FIELD, config.max_span_name_list)
        .await?;
    Ok(hits.into_iter().map(|h| h.value).collect())
}

/// All spans of one trace.
///
/// Fast path: the trace-id index stream yields the trace start time, and a
/// single scan over `[start - W, start + W]` collects the spans. Slow path
/// (root span never arrived): step-scan `trace_id` from `now` down to 0.
/// A trace whose data has left the retention period yields an empty result
/// rather than an error.
pub async fn get_trace(
    storage: &dyn TraceStorage,
    config: &SearchConfig,
    now: i64,
    trace_id: &str,
) -> Result<Vec<Row>, QueryError> {
    let bucket = fields::trace_id_index_partition(trace_id);
    let mut probe = Query::new(
        format!(
            "{{{}=\"{}\"}} AND {}:={:?} | fields _time",
            fields::TRACE_ID_INDEX_STREAM_FIELD,
            bucket,
            fields::TRACE_ID_INDEX_FIELD,
            trace_id
        ),
        now,
    );
    probe.add_pipe_limit(1);

    let trace_start = match find_trace_id_time(storage, config, now, &probe).await {
        Ok(ts) => ts,
        Err(e) if e.is_out_of_retention() => None,
        Err(e) => return Err(e),
    };

    let window = config.max_duration_window.as_nanos() as i64;
    if let Some(ts) = trace_start {
        return match find_spans_by_trace_id_and_time(storage, trace_id, ts - window, ts + window)
            .await
        {
            Ok(rows) => Ok(rows),
            Err(e) if e.is_out_of_retention() => Ok(Vec::new()),
            Err(e) => Err(e),
        };
    }

    match find_spans_by_trace_id(storage, config, now, trace_id).await {
        Ok(rows) => Ok(rows),
        Err(e) if e.is_out_of_retention() => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// Trace ids matching the filters plus all spans of those traces.
pub async fn get_trace_list(
    storage: &dyn TraceStorage,
    config: &SearchConfig,
    now: i64,
    params: &TraceQueryParams,
) -> Result<(Vec<String>, Vec<Row>), QueryError> {
    let (trace_ids, min_start_time) = get_trace_id_list(storage, now, params).await?;
    if trace_ids.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }

    let mut q = Query::new(
        format!("{}:in({})", fields::TRACE_ID_FIELD, trace_ids.join(",")),
        now,
    );
    // widen both edges so spans straddling the discovered window survive
    let window = config.max_duration_window.as_nanos() as i64;
    q.add_time_filter(min_start_time - window, params.start_time_max + window);

    let rows = run_collected(storage, &q).await?;
    Ok((trace_ids, rows))
}

/// Discovery phase of the trace list query: one trace id per matching
/// trace, most recent first, capped at the caller's limit. Also returns the
/// minimum `_time` observed, which bounds the fan-in scan.
async fn get_trace_id_list(
    storage: &dyn TraceStorage,
    now: i64,
    params: &TraceQueryParams,
) -> Result<(Vec<String>, i64), QueryError> {
    let mut text = String::from("*");
    if !params.service_name.is_empty() {
        text.push_str(&format!(
            " AND _stream:{{{}={:?}}}",
            fields::RESOURCE_ATTR_SERVICE_NAME,
            params.service_name
        ));
    }
    if !params.span_name.is_empty() {
        text.push_str(&format!(
            " AND _stream:{{{}={:?}}}",
            fields::NAME_FIELD,
            params.span_name
        ));
    }
    for (key, value) in &params.attributes {
        text.push_str(&format!(" AND {key:?}:={value:?}"));
    }
    if params.duration_min_ns > 0 {
        text.push_str(&format!(
            " AND {}:>{}",
            fields::DURATION_FIELD,
            params.duration_min_ns
        ));
    }
    if params.duration_max_ns > 0 {
        text.push_str(&format!(
            " AND {}:<{}",
            fields::DURATION_FIELD,
            params.duration_max_ns
        ));
    }
    text.push_str(&format!(
        " | last 1 by (_time) partition by ({trace_id}) | fields {time}, {trace_id} | sort by ({time}) desc",
        trace_id = fields::TRACE_ID_FIELD,
        time = fields::TIME_FIELD,
    ));

    let mut q = Query::new(text, now);
    q.add_pipe_limit(params.limit as u64);

    find_trace_ids_split_time_range(
        storage,
        &q,
        params.start_time_min,
        params.start_time_max,
        params.limit,
    )
    .await
}

/// Run the discovery query over an expanding window receding from `end`.
///
/// Each miss resets the accumulator before widening the step 5x: the most
/// recent window is authoritative for "last by time", so partial results
/// from narrower windows are discarded by design. Callers with very small
/// limits may observe non-monotone results as the window expands.
async fn find_trace_ids_split_time_range(
    storage: &dyn TraceStorage,
    q: &Query,
    start: i64,
    end: i64,
    limit: usize,
) -> Result<(Vec<String>, i64), QueryError> {
    let now = q.timestamp();
    let mut step = DISCOVERY_INITIAL_STEP.as_nanos() as i64;
    let mut current_start = end - step;

    let trace_ids: Mutex<Vec<String>> = Mutex::new(Vec::with_capacity(limit));
    let min_time_str: Mutex<String> = Mutex::new(nanos_to_rfc3339(end));

    let write_block = |_: u32, block: &crate::storage::DataBlock| {
        for column in &block.columns {
            match column.name.as_str() {
                fields::TRACE_ID_FIELD => {
                    let mut ids = trace_ids.lock();
                    for value in &column.values {
                        ids.push(value.clone());
                    }
                }
                fields::TIME_FIELD => {
                    let mut min_time = min_time_str.lock();
                    for value in &column.values {
                        if *value < *min_time {
                            *min_time = value.clone();
                        }
                    }
                }
                _ => {}
            }
        }
    };

    let cancel = CancellationToken::new();
    while current_start > start {
        let qq = q.clone_with_time_filter(now, current_start, end);
        storage.run_query(&cancel, &qq, &write_block).await?;

        if trace_ids.lock().len() == limit {
            let ids = std::mem::take(&mut *trace_ids.lock());
            let min_time = parse_min_time(min_time_str.lock().as_str())?;
            return Ok((check_trace_id_list(ids), min_time));
        }

        // not enough ids: discard, widen the window and retry
        trace_ids.lock().clear();
        step *= 5;
        current_start -= step;
    }

    // one last try over the full requested range
    let qq = q.clone_with_time_filter(now, start, end);
    storage.run_query(&cancel, &qq, &write_block).await?;

    let ids = std::mem::take(&mut *trace_ids.lock());
    let min_time = parse_min_time(min_time_str.lock().as_str())?;
    Ok((check_trace_id_list(ids), min_time))
}

fn parse_min_time(value: &str) -> Result<i64, QueryError> {
    rfc3339_to_nanos(value).ok_or_else(|| QueryError::InvalidTimestamp {
        value: value.to_string(),
    })
}

/// Probe the trace-id index stream over receding windows and return the
/// trace start time of the first hit. The final window is clamped to zero
/// so the probed windows cover `[0, now]` before the trace is declared
/// absent.
async fn find_trace_id_time(
    storage: &dyn TraceStorage,
    config: &SearchConfig,
    now: i64,
    q: &Query,
) -> Result<Option<i64>, QueryError> {
    let step = config.search_step.as_nanos() as i64;

    let found_time = AtomicI64::new(0);
    let missing_time_column = AtomicBool::new(false);
    let cancel = CancellationToken::new();

    let write_block = |_: u32, block: &crate::storage::DataBlock| {
        if missing_time_column.load(Ordering::Acquire) {
            return;
        }
        let Some(timestamps) = block.timestamps() else {
            missing_time_column.store(true, Ordering::Release);
            cancel.cancel();
            return;
        };
        if let Some(&ts) = timestamps.first() {
            found_time.store(ts, Ordering::Release);
        }
    };

    let mut end = now;
    while end > 0 {
        let window_start = (end - step).max(0);
        let qq = q.clone_with_time_filter(now, window_start, end);
        let result = storage.run_query(&cancel, &qq, &write_block).await;
        if missing_time_column.load(Ordering::Acquire) {
            return Err(QueryError::MissingTimeColumn {
                query: qq.to_string(),
            });
        }
        result?;

        let ts = found_time.load(Ordering::Acquire);
        if ts != 0 {
            return Ok(Some(ts));
        }
        end = window_start;
    }
    Ok(None)
}

/// Step-scan for spans of a trace from `now` toward zero.
///
/// Once a window yields spans, the remaining spans of the trace are assumed
/// to live nearby: one extra scan of `[window_start - W, window_start]`
/// catches stragglers and the descent stops.
async fn find_spans_by_trace_id(
    storage: &dyn TraceStorage,
    config: &SearchConfig,
    now: i64,
    trace_id: &str,
) -> Result<Vec<Row>, QueryError> {
    let step = config.search_step.as_nanos() as i64;
    let window = config.max_duration_window.as_nanos() as i64;

    let mut end = now;
    while end > 0 {
        let start = (end - step).max(0);
        let mut rows = find_spans_by_trace_id_and_time(storage, trace_id, start, end).await?;
        if rows.is_empty() {
            end = start;
            continue;
        }

        let extra = find_spans_by_trace_id_and_time(storage, trace_id, start - window, start).await?;
        rows.extend(extra);
        return Ok(rows);
    }
    Ok(Vec::new())
}

async fn find_spans_by_trace_id_and_time(
    storage: &dyn TraceStorage,
    trace_id: &str,
    start: i64,
    end: i64,
) -> Result<Vec<Row>, QueryError> {
    let mut q = Query::new(
        format!("{}:={:?}", fields::TRACE_ID_FIELD, trace_id),
        end,
    );
    q.add_time_filter(start, end);
    run_collected(storage, &q).await
}

/// Run a query through a [`RowCollector`], surfacing a missing `_time`
/// column as a query failure.
async fn run_collected(storage: &dyn TraceStorage, q: &Query) -> Result<Vec<Row>, QueryError> {
    let cancel = CancellationToken::new();
    let collector = RowCollector::new(cancel.clone());
    let result = storage
        .run_query(&cancel, q, &|block_id, block| {
            collector.write_block(block_id, block)
        })
        .await;
    if collector.missing_time_column() {
        return Err(QueryError::MissingTimeColumn {
            query: q.to_string(),
        });
    }
    result?;
    Ok(collector.into_rows())
}

/// Drop discovered ids that could alter the fan-in query if interpolated.
fn check_trace_id_list(trace_ids: Vec<String>) -> Vec<String> {
    trace_ids
        .into_iter()
        .filter(|id| TRACE_ID_REGEX.is_match(id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;

    use crate::storage::{BlockColumn, BlockHandler, DataBlock, FieldValueHit};

    type Responder =
        Box<dyn Fn(&Query, BlockHandler<'_>) -> Result<(), StorageError> + Send + Sync>;

    /// Storage double that logs every query and answers via a scripted
    /// responder.
    struct ScriptedStorage {
        queries: Mutex<Vec<Query>>,
        field_value_hits: Vec<FieldValueHit>,
        respond: Responder,
    }

    impl ScriptedStorage {
        fn new(respond: Responder) -> Self {
            Self {
                queries: Mutex::new(Vec::new()),
                field_value_hits: Vec::new(),
                respond,
            }
        }

        fn with_field_values(values: &[&str]) -> Self {
            Self {
                queries: Mutex::new(Vec::new()),
                field_value_hits: values
                    .iter()
                    .map(|v| FieldValueHit {
                        value: v.to_string(),
                        hits: 1,
                    })
                    .collect(),
                respond: Box::new(|_, _| Ok(())),
            }
        }

        fn logged(&self) -> Vec<Query> {
            self.queries.lock().clone()
        }
    }

    #[async_trait]
    impl TraceStorage for ScriptedStorage {
        async fn add_rows(&self, _rows: Vec<Row>) -> Result<(), StorageError> {
            Ok(())
        }

        async fn stream_field_values(
            &self,
            query: &Query,
            _field: &str,
            _limit: u64,
        ) -> Result<Vec<FieldValueHit>, StorageError> {
            self.queries.lock().push(query.clone());
            Ok(self.field_value_hits.clone())
        }

        async fn run_query(
            &self,
            _cancel: &CancellationToken,
            query: &Query,
            write_block: BlockHandler<'_>,
        ) -> Result<(), StorageError> {
            self.queries.lock().push(query.clone());
            (self.respond)(query, write_block)
        }
    }

    fn probe_hit_block(ts: i64) -> DataBlock {
        DataBlock::new(
            vec![BlockColumn {
                name: fields::TIME_FIELD.to_string(),
                values: vec![nanos_to_rfc3339(ts)],
            }],
            Some(vec![ts]),
        )
    }

    fn span_block(trace_id: &str, ts: i64) -> DataBlock {
        DataBlock::new(
            vec![BlockColumn {
                name: fields::TRACE_ID_FIELD.to_string(),
                values: vec![trace_id.to_string()],
            }],
            Some(vec![ts]),
        )
    }

    fn discovery_block(trace_id: &str, ts: i64) -> DataBlock {
        DataBlock::new(
            vec![
                BlockColumn {
                    name: fields::TIME_FIELD.to_string(),
                    values: vec![nanos_to_rfc3339(ts)],
                },
                BlockColumn {
                    name: fields::TRACE_ID_FIELD.to_string(),
                    values: vec![trace_id.to_string()],
                },
            ],
            Some(vec![ts]),
        )
    }

    fn small_config() -> SearchConfig {
        SearchConfig {
            max_duration_window: Duration::from_nanos(50),
            service_and_span_name_lookbehind: Duration::from_nanos(5_000),
            search_step: Duration::from_nanos(1_000),
            max_service_name_list: 10,
            max_span_name_list: 10,
        }
    }

    #[tokio::test]
    async fn test_get_service_names_window() {
        let storage = ScriptedStorage::with_field_values(&["svc-b", "svc-a"]);
        let config = small_config();
        let now = 100_000;

        let names = get_service_names(&storage, &config, now).await.unwrap();
        assert_eq!(names, vec!["svc-b", "svc-a"]);

        let logged = storage.logged();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].text(), "*");
        assert_eq!(logged[0].start(), now - 5_000);
        assert_eq!(logged[0].end(), now);
    }

    #[tokio::test]
    async fn test_get_span_names_filters_by_service() {
        let storage = ScriptedStorage::with_field_values(&["op-1"]);
        let config = small_config();

        let names = get_span_names(&storage, &config, 100_000, "checkout")
            .await
            .unwrap();
        assert_eq!(names, vec!["op-1"]);
        assert_eq!(
            storage.logged()[0].text(),
            "_stream:{resource_attr:service.name=\"checkout\"}"
        );
    }

    #[tokio::test]
    async fn test_get_trace_fast_path_probe_windows_recede_until_hit() {
        // index hit lives three windows back
        let now = 10_000_i64;
        let hit_ts = 7_100_i64;
        let storage = ScriptedStorage::new(Box::new(move |q, write_block| {
            if q.text().contains(fields::TRACE_ID_INDEX_FIELD)
                && q.start() <= hit_ts
                && hit_ts <= q.end()
            {
                write_block(0, &probe_hit_block(hit_ts));
            } else if q.text().starts_with("trace_id:=") {
                write_block(0, &span_block("abc", hit_ts));
            }
            Ok(())
        }));

        let config = small_config();
        let rows = get_trace(&storage, &config, now, "abc").await.unwrap();
        assert_eq!(rows.len(), 1);

        let logged = storage.logged();
        // probes: [9000,10000], [8000,9000], [7000,8000] (hit), then fan-in
        let probes: Vec<&Query> = logged
            .iter()
            .filter(|q| q.text().contains(fields::TRACE_ID_INDEX_FIELD))
            .collect();
        assert_eq!(probes.len(), 3);
        assert_eq!((probes[0].start(), probes[0].end()), (9_000, 10_000));
        assert_eq!((probes[1].start(), probes[1].end()), (8_000, 9_000));
        assert_eq!((probes[2].start(), probes[2].end()), (7_000, 8_000));
        // consecutive windows share only their boundary
        for pair in probes.windows(2) {
            assert_eq!(pair[1].end(), pair[0].start());
        }

        let fan_in = logged.last().unwrap();
        assert_eq!(fan_in.text(), "trace_id:=\"abc\"");
        assert_eq!((fan_in.start(), fan_in.end()), (hit_ts - 50, hit_ts + 50));
    }

    #[tokio::test]
    async fn test_get_trace_probe_windows_cover_down_to_zero() {
        let now = 2_500_i64;
        let storage = ScriptedStorage::new(Box::new(|_, _| Ok(())));
        let config = small_config();

        let rows = get_trace(&storage, &config, now, "missing").await.unwrap();
        assert!(rows.is_empty());

        let probes: Vec<Query> = storage
            .logged()
            .into_iter()
            .filter(|q| q.text().contains(fields::TRACE_ID_INDEX_FIELD))
            .collect();
        // [1500,2500], [500,1500], [0,500] — the union covers [0, now]
        assert_eq!(probes.len(), 3);
        assert_eq!((probes[0].start(), probes[0].end()), (1_500, 2_500));
        assert_eq!((probes[1].start(), probes[1].end()), (500, 1_500));
        assert_eq!((probes[2].start(), probes[2].end()), (0, 500));
    }

    #[tokio::test]
    async fn test_get_trace_slow_path_extra_scan_after_first_hit() {
        // no index entry (root span missing); spans two windows back
        let now = 5_000_i64;
        let span_ts = 2_900_i64;
        let storage = ScriptedStorage::new(Box::new(move |q, write_block| {
            if q.text().starts_with("trace_id:=") && q.start() <= span_ts && span_ts <= q.end() {
                write_block(0, &span_block("abc", span_ts));
            }
            Ok(())
        }));

        let config = small_config();
        let rows = get_trace(&storage, &config, now, "abc").await.unwrap();
        // window scan hit plus the extra straggler scan hit nothing extra
        assert_eq!(rows.len(), 1);

        let span_scans: Vec<Query> = storage
            .logged()
            .into_iter()
            .filter(|q| q.text().starts_with("trace_id:="))
            .collect();
        // [4000,5000] miss, [3000,4000] miss, [2000,3000] hit, extra [1950,2000]
        assert_eq!(span_scans.len(), 4);
        assert_eq!(
            (span_scans[2].start(), span_scans[2].end()),
            (2_000, 3_000)
        );
        assert_eq!(
            (span_scans[3].start(), span_scans[3].end()),
            (1_950, 2_000)
        );
    }

    #[tokio::test]
    async fn test_missing_time_column_fails_the_probe() {
        let storage = ScriptedStorage::new(Box::new(|q, write_block| {
            if q.text().contains(fields::TRACE_ID_INDEX_FIELD) {
                write_block(0, &DataBlock::new(vec![], None));
            }
            Ok(())
        }));
        let config = small_config();
        let err = get_trace(&storage, &config, 2_000, "abc").await.unwrap_err();
        assert!(matches!(err, QueryError::MissingTimeColumn { .. }));
        assert!(err.to_string().contains("missing _time column"));
    }

    #[tokio::test]
    async fn test_out_of_retention_yields_empty_trace() {
        let storage = ScriptedStorage::new(Box::new(|q, write_block| {
            if q.text().contains(fields::TRACE_ID_INDEX_FIELD) {
                write_block(0, &probe_hit_block(1_500));
                Ok(())
            } else {
                Err(StorageError::OutOfRetention {
                    start: q.start(),
                    end: q.end(),
                })
            }
        }));
        let config = small_config();
        let rows = get_trace(&storage, &config, 2_000, "abc").await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_trace_list_window_expansion_and_reset() {
        let minute = DISCOVERY_INITIAL_STEP.as_nanos() as i64;
        let end = 100 * minute;
        let start = end - 10 * minute;
        // every discovery scan returns the same single id: with limit 2 the
        // planner keeps widening, resetting the accumulator in between
        let storage = ScriptedStorage::new(Box::new(move |q, write_block| {
            if q.text().contains("partition by") {
                write_block(0, &discovery_block("id-1", end - 30));
            }
            Ok(())
        }));

        let config = small_config();
        let params = TraceQueryParams {
            start_time_min: start,
            start_time_max: end,
            limit: 2,
            ..Default::default()
        };
        let (ids, rows) = get_trace_list(&storage, &config, end, &params)
            .await
            .unwrap();
        // the accumulator reset keeps only the final window's single hit
        assert_eq!(ids, vec!["id-1"]);
        assert!(rows.is_empty());

        let discovery: Vec<Query> = storage
            .logged()
            .into_iter()
            .filter(|q| q.text().contains("partition by"))
            .collect();
        // [end-1m, end], [end-6m, end], then clamped [start, end]
        assert_eq!(discovery.len(), 3);
        assert_eq!(discovery[0].start(), end - minute);
        assert_eq!(discovery[1].start(), end - 6 * minute);
        assert_eq!(discovery[2].start(), start);
        for q in &discovery {
            assert_eq!(q.end(), end);
            assert_eq!(q.limit(), Some(2));
        }

        let fan_in = storage
            .logged()
            .into_iter()
            .find(|q| q.text().starts_with("trace_id:in("))
            .unwrap();
        assert_eq!(fan_in.text(), "trace_id:in(id-1)");
        // [min observed _time - W, start_time_max + W]
        assert_eq!(fan_in.start(), end - 30 - 50);
        assert_eq!(fan_in.end(), end + 50);
    }

    #[tokio::test]
    async fn test_trace_list_filter_composition() {
        let end = 10 * DISCOVERY_INITIAL_STEP.as_nanos() as i64;
        let storage = ScriptedStorage::new(Box::new(move |q, write_block| {
            if q.text().contains("partition by") {
                write_block(0, &discovery_block("id-9", end - 5));
            }
            Ok(())
        }));
        let config = small_config();
        let params = TraceQueryParams {
            service_name: "checkout".to_string(),
            span_name: "charge".to_string(),
            attributes: vec![("attr:http.method".to_string(), "POST".to_string())],
            start_time_min: end - DISCOVERY_INITIAL_STEP.as_nanos() as i64 / 2,
            start_time_max: end,
            duration_min_ns: 1_000,
            duration_max_ns: 2_000,
            limit: 1,
        };
        get_trace_list(&storage, &config, end, &params).await.unwrap();

        let discovery = &storage.logged()[0];
        assert_eq!(
            discovery.text(),
            "* AND _stream:{resource_attr:service.name=\"checkout\"} \
             AND _stream:{name=\"charge\"} \
             AND \"attr:http.method\":=\"POST\" \
             AND duration:>1000 AND duration:<2000 \
             | last 1 by (_time) partition by (trace_id) \
             | fields _time, trace_id | sort by (_time) desc"
        );
    }

    #[tokio::test]
    async fn test_discovered_ids_are_validated_on_every_path() {
        let minute = DISCOVERY_INITIAL_STEP.as_nanos() as i64;
        let end = 100 * minute;
        // early-exit path: limit reached in the first window, one id hostile
        let storage = ScriptedStorage::new(Box::new(move |q, write_block| {
            if q.text().contains("partition by") {
                write_block(0, &discovery_block("good-1", end - 10));
                write_block(
                    0,
                    &discovery_block("bad) OR _stream:{x=\"y\"}", end - 20),
                );
            }
            Ok(())
        }));
        let config = small_config();
        let params = TraceQueryParams {
            start_time_min: 0,
            start_time_max: end,
            limit: 2,
            ..Default::default()
        };
        let (ids, _) = get_trace_list(&storage, &config, end, &params)
            .await
            .unwrap();
        assert_eq!(ids, vec!["good-1"]);
        for id in &ids {
            assert!(TRACE_ID_REGEX.is_match(id));
        }
        let fan_in = storage
            .logged()
            .into_iter()
            .find(|q| q.text().starts_with("trace_id:in("))
            .unwrap();
        assert_eq!(fan_in.text(), "trace_id:in(good-1)");
    }

    #[tokio::test]
    async fn test_check_trace_id_list() {
        let ids = vec![
            "abc-123".to_string(),
            "A.B:C_d".to_string(),
            "has space".to_string(),
            "quote\"".to_string(),
            String::new(),
        ];
        assert_eq!(
            check_trace_id_list(ids),
            vec!["abc-123".to_string(), "A.B:C_d".to_string(), String::new()]
        );
    }

    #[tokio::test]
    async fn test_storage_errors_surface_verbatim() {
        let storage = Arc::new(ScriptedStorage::new(Box::new(|_, _| {
            Err(StorageError::Backend("disk quota exceeded".to_string()))
        })));
        let config = small_config();
        let err = get_trace(storage.as_ref(), &config, 2_000, "abc")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "disk quota exceeded");
    }
}
