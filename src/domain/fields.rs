//! Flat field-name grammar for stored spans.
//!
//! These names are the wire-level schema shared by the ingestion path, the
//! query planner and the Jaeger reassembler. They must stay bit-exact:
//! existing data is addressed by them.

use xxhash_rust::xxh64::xxh64;

pub const RESOURCE_ATTR_PREFIX: &str = "resource_attr:";
pub const RESOURCE_ATTR_SERVICE_NAME: &str = "resource_attr:service.name";

pub const SCOPE_NAME_FIELD: &str = "otel.scope.name";
pub const SCOPE_VERSION_FIELD: &str = "otel.scope.version";
pub const SCOPE_ATTR_PREFIX: &str = "scope_attr:";

pub const TRACE_ID_FIELD: &str = "trace_id";
pub const SPAN_ID_FIELD: &str = "span_id";
pub const TRACE_STATE_FIELD: &str = "trace_state";
pub const PARENT_SPAN_ID_FIELD: &str = "parent_span_id";
pub const FLAGS_FIELD: &str = "flags";
pub const NAME_FIELD: &str = "name";
pub const KIND_FIELD: &str = "kind";
pub const START_TIME_UNIX_NANO_FIELD: &str = "start_time_unix_nano";
pub const END_TIME_UNIX_NANO_FIELD: &str = "end_time_unix_nano";
pub const DURATION_FIELD: &str = "duration";

pub const DROPPED_ATTRIBUTES_COUNT_FIELD: &str = "dropped_attributes_count";
pub const DROPPED_EVENTS_COUNT_FIELD: &str = "dropped_events_count";
pub const DROPPED_LINKS_COUNT_FIELD: &str = "dropped_links_count";

pub const STATUS_MESSAGE_FIELD: &str = "status.message";
pub const STATUS_CODE_FIELD: &str = "status.code";

pub const SPAN_ATTR_PREFIX: &str = "attr:";

/// Event fields are emitted as `event:<field>:<idx>`, attributes as
/// `event:attr:<key>:<idx>`.
pub const EVENT_PREFIX: &str = "event:";
pub const EVENT_TIME_UNIX_NANO_FIELD: &str = "time_unix_nano";
pub const EVENT_NAME_FIELD: &str = "name";
pub const EVENT_DROPPED_ATTRIBUTES_COUNT_FIELD: &str = "dropped_attributes_count";
pub const EVENT_ATTR_PREFIX: &str = "attr:";

/// Link fields are emitted as `link:<field>:<idx>`, attributes as
/// `link:attr:<key>:<idx>`.
pub const LINK_PREFIX: &str = "link:";
pub const LINK_TRACE_ID_FIELD: &str = "trace_id";
pub const LINK_SPAN_ID_FIELD: &str = "span_id";
pub const LINK_TRACE_STATE_FIELD: &str = "trace_state";
pub const LINK_DROPPED_ATTRIBUTES_COUNT_FIELD: &str = "dropped_attributes_count";
pub const LINK_FLAGS_FIELD: &str = "flags";
pub const LINK_ATTR_PREFIX: &str = "attr:";

/// Field holding the trace id in the index stream.
pub const TRACE_ID_INDEX_FIELD: &str = "trace_id_idx";
/// Stream field holding the index partition bucket.
pub const TRACE_ID_INDEX_STREAM_FIELD: &str = "trace_id_idx_stream";

pub const MSG_FIELD: &str = "_msg";
pub const TIME_FIELD: &str = "_time";

/// Number of partitions of the trace-id index stream.
///
/// Wire-level constant: the bucket value is stored as a stream field, so
/// changing the count is incompatible with existing data.
pub const TRACE_ID_INDEX_PARTITION_COUNT: u64 = 16;

/// Partition bucket for a trace id, stable across runs and processes.
pub fn trace_id_index_partition(trace_id: &str) -> u64 {
    xxh64(trace_id.as_bytes(), 0) % TRACE_ID_INDEX_PARTITION_COUNT
}
