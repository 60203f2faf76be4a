//! Block-wise assembly of query results.
//!
//! The storage engine streams result blocks from multiple worker threads
//! and recycles block memory after each callback, so every column name and
//! value is cloned on the way out and rows accumulate under a mutex.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::storage::{DataBlock, Field, Row};

/// Collects rows from result blocks under cancellation.
///
/// A block without per-row timestamps marks the whole query as failed and
/// cancels the token so sibling scans stop early.
pub struct RowCollector {
    cancel: CancellationToken,
    rows: Mutex<Vec<Row>>,
    missing_time_column: AtomicBool,
}

impl RowCollector {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            rows: Mutex::new(Vec::new()),
            missing_time_column: AtomicBool::new(false),
        }
    }

    pub fn write_block(&self, _block_id: u32, block: &DataBlock) {
        if self.missing_time_column.load(Ordering::Acquire) {
            return;
        }

        let cloned_column_names: Vec<String> =
            block.columns.iter().map(|c| c.name.clone()).collect();

        let Some(timestamps) = block.timestamps() else {
            self.missing_time_column.store(true, Ordering::Release);
            self.cancel.cancel();
            return;
        };

        for (i, &timestamp) in timestamps.iter().enumerate() {
            let mut fields = Vec::with_capacity(block.columns.len());
            for (j, column) in block.columns.iter().enumerate() {
                // a column is empty for rows that do not contain the field;
                // only keep non-empty values
                let value = column.values.get(i).map(String::as_str).unwrap_or("");
                if !value.is_empty() {
                    fields.push(Field {
                        name: cloned_column_names[j].clone(),
                        value: value.to_string(),
                    });
                }
            }

            let mut rows = self.rows.lock();
            rows.push(Row {
                timestamp,
                fields,
                stream_fields: None,
            });
        }
    }

    pub fn missing_time_column(&self) -> bool {
        self.missing_time_column.load(Ordering::Acquire)
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows.into_inner()
    }
}
