//! Columnar log-storage collaborator interface.
//!
//! The actual storage engine is an external component. This module defines
//! the row/query/block types exchanged with it and the [`TraceStorage`]
//! trait the rest of the service is written against. The bundled
//! [`memory::MemoryStorage`] backend implements the trait for development
//! and tests.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// A single named column value within a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub value: String,
}

impl Field {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One row handed to (or returned by) the storage engine.
///
/// `stream_fields` selects the physical stream the row is clustered into.
/// `None` leaves stream selection to the fields configured on the insert
/// path.
#[derive(Debug, Clone)]
pub struct Row {
    pub timestamp: i64,
    pub fields: Vec<Field>,
    pub stream_fields: Option<Vec<Field>>,
}

/// A distinct stream-field value together with its hit count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldValueHit {
    pub value: String,
    pub hits: u64,
}

/// One column of a result data block.
///
/// `values[i]` belongs to row `i` of the block. An empty value means the
/// row does not contain the column.
#[derive(Debug, Clone)]
pub struct BlockColumn {
    pub name: String,
    pub values: Vec<String>,
}

/// A block of query results streamed from the storage engine.
///
/// Block memory is owned by the engine and recycled after the callback
/// returns. Consumers must clone every string they keep.
#[derive(Debug, Clone, Default)]
pub struct DataBlock {
    pub columns: Vec<BlockColumn>,
    timestamps: Option<Vec<i64>>,
}

impl DataBlock {
    pub fn new(columns: Vec<BlockColumn>, timestamps: Option<Vec<i64>>) -> Self {
        Self {
            columns,
            timestamps,
        }
    }

    /// Per-row timestamps of the block, or `None` if the query projection
    /// dropped the `_time` column.
    pub fn timestamps(&self) -> Option<&[i64]> {
        self.timestamps.as_deref()
    }
}

/// A storage query: a filter expression plus the time range and pipe limit
/// applied to it.
///
/// The filter text is opaque to this layer; it is parsed by the storage
/// engine. Time bounds are inclusive unix nanoseconds.
#[derive(Debug, Clone)]
pub struct Query {
    text: String,
    timestamp: i64,
    start: i64,
    end: i64,
    limit: Option<u64>,
}

impl Query {
    /// Create a query parsed relative to the given timestamp (unix nanos).
    pub fn new(text: impl Into<String>, timestamp: i64) -> Self {
        Self {
            text: text.into(),
            timestamp,
            start: i64::MIN,
            end: i64::MAX,
            limit: None,
        }
    }

    pub fn add_time_filter(&mut self, start: i64, end: i64) {
        self.start = start;
        self.end = end;
    }

    pub fn add_pipe_limit(&mut self, limit: u64) {
        self.limit = Some(limit);
    }

    /// Clone the query with a different evaluation timestamp and time range,
    /// keeping the filter text and pipe limit.
    pub fn clone_with_time_filter(&self, timestamp: i64, start: i64, end: i64) -> Self {
        let mut q = self.clone();
        q.timestamp = timestamp;
        q.start = start;
        q.end = end;
        q
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }
}

impl std::fmt::Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.text)
    }
}

/// Errors surfaced by the storage collaborator.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Scan or write rejected by the backend. Surfaced verbatim.
    #[error("{0}")]
    Backend(String),

    /// The requested time range is older than the retention period.
    #[error("cannot query time range [{start}, {end}]: out of retention period")]
    OutOfRetention { start: i64, end: i64 },

    /// The query was cancelled before completion.
    #[error("query cancelled")]
    Cancelled,
}

impl StorageError {
    /// Read paths suppress this error class to an empty result set.
    pub fn is_out_of_retention(&self) -> bool {
        self.to_string().contains("out of retention period")
    }
}

/// Per-block result callback. Invoked concurrently from storage worker
/// threads; block memory is only valid for the duration of the call.
pub type BlockHandler<'a> = &'a (dyn Fn(u32, &DataBlock) + Send + Sync);

/// The columnar storage engine, as seen by the ingestion and query paths.
#[async_trait]
pub trait TraceStorage: Send + Sync + 'static {
    /// Persist a batch of rows.
    async fn add_rows(&self, rows: Vec<Row>) -> Result<(), StorageError>;

    /// Distinct values of a stream field among streams matched by the query,
    /// capped at `limit`.
    async fn stream_field_values(
        &self,
        query: &Query,
        field: &str,
        limit: u64,
    ) -> Result<Vec<FieldValueHit>, StorageError>;

    /// Execute a query, streaming result blocks to `write_block`. The
    /// callback may be invoked from multiple worker threads. Cancelling the
    /// token terminates the scan early.
    async fn run_query(
        &self,
        cancel: &CancellationToken,
        query: &Query,
        write_block: BlockHandler<'_>,
    ) -> Result<(), StorageError>;
}

/// Sink for rows produced by the span flattener.
pub trait RowSink {
    fn add_row(&mut self, timestamp: i64, fields: &[Field], stream_fields: Option<&[Field]>);
}

impl RowSink for Vec<Row> {
    fn add_row(&mut self, timestamp: i64, fields: &[Field], stream_fields: Option<&[Field]>) {
        self.push(Row {
            timestamp,
            fields: fields.to_vec(),
            stream_fields: stream_fields.map(|sf| sf.to_vec()),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_clone_with_time_filter_keeps_text_and_limit() {
        let mut q = Query::new("trace_id:=\"abc\"", 1_000);
        q.add_pipe_limit(7);
        let qq = q.clone_with_time_filter(2_000, 100, 200);
        assert_eq!(qq.text(), "trace_id:=\"abc\"");
        assert_eq!(qq.limit(), Some(7));
        assert_eq!(qq.timestamp(), 2_000);
        assert_eq!(qq.start(), 100);
        assert_eq!(qq.end(), 200);
        // original untouched
        assert_eq!(q.start(), i64::MIN);
    }

    #[test]
    fn test_out_of_retention_detection() {
        let err = StorageError::OutOfRetention { start: 0, end: 10 };
        assert!(err.is_out_of_retention());
        let err = StorageError::Backend("disk on fire".to_string());
        assert!(!err.is_out_of_retention());
        // detection is by error text, so backend-origin strings count too
        let err = StorageError::Backend("range is out of retention period".to_string());
        assert!(err.is_out_of_retention());
    }
}
