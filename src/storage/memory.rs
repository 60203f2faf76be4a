//! In-memory storage backend.
//!
//! Holds rows in a vector and evaluates the query dialect the search
//! planner emits. Serves development runs and the integration tests; it
//! has no durability, replication or retention and is not meant for
//! production data volumes.

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;

use crate::storage::{
    BlockColumn, BlockHandler, DataBlock, Field, FieldValueHit, Query, Row, StorageError,
    TraceStorage,
};
use crate::utils::time::nanos_to_rfc3339;

#[derive(Default)]
pub struct MemoryStorage {
    rows: RwLock<Vec<StoredRow>>,
}

struct StoredRow {
    timestamp: i64,
    fields: Vec<Field>,
    stream_fields: Vec<Field>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_count(&self) -> usize {
        self.rows.read().len()
    }

    /// Rows in the query's time range matching every filter conjunct.
    fn select(&self, query: &Query) -> Result<Vec<SelectedRow>, StorageError> {
        let parsed = ParsedQuery::parse(query)?;
        let rows = self.rows.read();
        let mut selected: Vec<SelectedRow> = rows
            .iter()
            .filter(|row| {
                query.start() <= row.timestamp
                    && row.timestamp <= query.end()
                    && parsed.filters.iter().all(|f| f.matches(row))
            })
            .map(|row| SelectedRow {
                timestamp: row.timestamp,
                fields: row.fields.clone(),
            })
            .collect();

        for pipe in &parsed.pipes {
            match pipe {
                Pipe::LastByTimePartitionBy(partition_field) => {
                    let mut latest: Vec<SelectedRow> = Vec::new();
                    for row in selected.drain(..) {
                        let key = row.field_value(partition_field).unwrap_or("").to_string();
                        match latest
                            .iter_mut()
                            .find(|r| r.field_value(partition_field).unwrap_or("") == key)
                        {
                            Some(existing) if existing.timestamp <= row.timestamp => {
                                *existing = row;
                            }
                            Some(_) => {}
                            None => latest.push(row),
                        }
                    }
                    selected = latest;
                }
                Pipe::SortByTimeDesc => {
                    selected.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                }
                Pipe::Fields(_) => {}
            }
        }

        if let Some(limit) = query.limit() {
            selected.truncate(limit as usize);
        }
        Ok(selected)
    }
}

struct SelectedRow {
    timestamp: i64,
    fields: Vec<Field>,
}

impl SelectedRow {
    fn field_value(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value.as_str())
    }
}

#[async_trait]
impl TraceStorage for MemoryStorage {
    async fn add_rows(&self, rows: Vec<Row>) -> Result<(), StorageError> {
        let mut stored = self.rows.write();
        for row in rows {
            stored.push(StoredRow {
                timestamp: row.timestamp,
                fields: row.fields,
                stream_fields: row.stream_fields.unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn stream_field_values(
        &self,
        query: &Query,
        field: &str,
        limit: u64,
    ) -> Result<Vec<FieldValueHit>, StorageError> {
        let parsed = ParsedQuery::parse(query)?;
        let rows = self.rows.read();

        let mut hits: Vec<FieldValueHit> = Vec::new();
        for row in rows.iter() {
            if row.timestamp < query.start() || query.end() < row.timestamp {
                continue;
            }
            if !parsed.filters.iter().all(|f| f.matches(row)) {
                continue;
            }
            let Some(value) = row
                .stream_fields
                .iter()
                .find(|f| f.name == field)
                .map(|f| f.value.as_str())
            else {
                continue;
            };
            if let Some(hit) = hits.iter_mut().find(|h| h.value == value) {
                hit.hits += 1;
            } else if (hits.len() as u64) < limit {
                hits.push(FieldValueHit {
                    value: value.to_string(),
                    hits: 1,
                });
            }
        }
        Ok(hits)
    }

    async fn run_query(
        &self,
        cancel: &CancellationToken,
        query: &Query,
        write_block: BlockHandler<'_>,
    ) -> Result<(), StorageError> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let selected = self.select(query)?;
        if selected.is_empty() {
            return Ok(());
        }

        let parsed = ParsedQuery::parse(query)?;
        let projection = parsed.pipes.iter().find_map(|p| match p {
            Pipe::Fields(names) => Some(names.clone()),
            _ => None,
        });

        let column_names: Vec<String> = match &projection {
            Some(names) => names.clone(),
            None => {
                let mut names: Vec<String> = Vec::new();
                for row in &selected {
                    for field in &row.fields {
                        if !names.contains(&field.name) {
                            names.push(field.name.clone());
                        }
                    }
                }
                names
            }
        };

        let columns: Vec<BlockColumn> = column_names
            .iter()
            .map(|name| BlockColumn {
                name: name.clone(),
                values: selected
                    .iter()
                    .map(|row| {
                        if name == crate::domain::fields::TIME_FIELD {
                            nanos_to_rfc3339(row.timestamp)
                        } else {
                            row.field_value(name).unwrap_or("").to_string()
                        }
                    })
                    .collect(),
            })
            .collect();
        let timestamps: Vec<i64> = selected.iter().map(|r| r.timestamp).collect();

        write_block(0, &DataBlock::new(columns, Some(timestamps)));
        Ok(())
    }
}

// =============================================================================
// Query dialect
// =============================================================================

/// Parsed form of the planner's query dialect:
///
/// ```text
/// * AND _stream:{f="v"} AND {f="v"} AND f:="v" AND f:>1 AND f:<2 AND f:in(a,b)
///   | last 1 by (_time) partition by (f) | fields a, b | sort by (_time) desc
/// ```
struct ParsedQuery {
    filters: Vec<Filter>,
    pipes: Vec<Pipe>,
}

enum Filter {
    All,
    StreamEq { field: String, value: String },
    FieldEq { field: String, value: String },
    FieldIn { field: String, values: Vec<String> },
    NumGt { field: String, value: i64 },
    NumLt { field: String, value: i64 },
}

enum Pipe {
    LastByTimePartitionBy(String),
    SortByTimeDesc,
    Fields(Vec<String>),
}

impl ParsedQuery {
    fn parse(query: &Query) -> Result<Self, StorageError> {
        let mut segments = query.text().split(" | ");
        let filter_text = segments.next().unwrap_or_default();

        let mut filters = Vec::new();
        for conjunct in filter_text.split(" AND ") {
            filters.push(Filter::parse(conjunct.trim(), query)?);
        }

        let mut pipes = Vec::new();
        for segment in segments {
            pipes.push(Pipe::parse(segment.trim(), query)?);
        }
        Ok(Self { filters, pipes })
    }
}

impl Filter {
    fn parse(conjunct: &str, query: &Query) -> Result<Self, StorageError> {
        if conjunct == "*" {
            return Ok(Filter::All);
        }
        if let Some(inner) = conjunct
            .strip_prefix("_stream:{")
            .or_else(|| conjunct.strip_prefix("{"))
            .and_then(|rest| rest.strip_suffix("}"))
        {
            let (field, value) = inner.split_once('=').ok_or_else(|| bad_query(query))?;
            return Ok(Filter::StreamEq {
                field: field.to_string(),
                value: unquote(value, query)?,
            });
        }
        if let Some((field, values)) = conjunct
            .split_once(":in(")
            .and_then(|(f, rest)| rest.strip_suffix(")").map(|v| (f, v)))
        {
            return Ok(Filter::FieldIn {
                field: field.to_string(),
                values: values.split(',').map(str::to_string).collect(),
            });
        }
        if let Some((field, value)) = conjunct.split_once(":=") {
            return Ok(Filter::FieldEq {
                field: unquote(field, query)?,
                value: unquote(value, query)?,
            });
        }
        if let Some((field, value)) = conjunct.split_once(":>") {
            return Ok(Filter::NumGt {
                field: field.to_string(),
                value: value.parse().map_err(|_| bad_query(query))?,
            });
        }
        if let Some((field, value)) = conjunct.split_once(":<") {
            return Ok(Filter::NumLt {
                field: field.to_string(),
                value: value.parse().map_err(|_| bad_query(query))?,
            });
        }
        Err(bad_query(query))
    }

    fn matches(&self, row: &StoredRow) -> bool {
        let field_value = |name: &str| {
            row.fields
                .iter()
                .find(|f| f.name == name)
                .map(|f| f.value.as_str())
        };
        match self {
            Filter::All => true,
            Filter::StreamEq { field, value } => row
                .stream_fields
                .iter()
                .any(|f| f.name == *field && f.value == *value),
            Filter::FieldEq { field, value } => field_value(field) == Some(value.as_str()),
            Filter::FieldIn { field, values } => field_value(field)
                .map(|v| values.iter().any(|candidate| candidate == v))
                .unwrap_or(false),
            Filter::NumGt { field, value } => field_value(field)
                .and_then(|v| v.parse::<i64>().ok())
                .map(|v| v > *value)
                .unwrap_or(false),
            Filter::NumLt { field, value } => field_value(field)
                .and_then(|v| v.parse::<i64>().ok())
                .map(|v| v < *value)
                .unwrap_or(false),
        }
    }
}

impl Pipe {
    fn parse(segment: &str, query: &Query) -> Result<Self, StorageError> {
        if let Some(rest) = segment.strip_prefix("last 1 by (_time) partition by (") {
            let field = rest.strip_suffix(")").ok_or_else(|| bad_query(query))?;
            return Ok(Pipe::LastByTimePartitionBy(field.to_string()));
        }
        if segment == "sort by (_time) desc" {
            return Ok(Pipe::SortByTimeDesc);
        }
        if let Some(rest) = segment.strip_prefix("fields ") {
            return Ok(Pipe::Fields(
                rest.split(',').map(|s| s.trim().to_string()).collect(),
            ));
        }
        Err(bad_query(query))
    }
}

fn unquote(s: &str, query: &Query) -> Result<String, StorageError> {
    if s.starts_with('"') {
        serde_json::from_str::<String>(s).map_err(|_| bad_query(query))
    } else {
        Ok(s.to_string())
    }
}

fn bad_query(query: &Query) -> StorageError {
    StorageError::Backend(format!("cannot parse query [{query}]"))
}
