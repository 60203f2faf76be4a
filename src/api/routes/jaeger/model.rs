//! Jaeger HTTP API data model and the flat-row → span reassembler.
//!
//! The response shape follows Jaeger's `structuredResponse`
//! (<https://github.com/jaegertracing/jaeger/blob/main/cmd/query/app/http_handler.go>).
//! Reassembly inverts the span flattening: one stored row becomes one
//! Jaeger span, with events regrouped into logs and links into references
//! by their `:<idx>` name suffix.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use thiserror::Error;

use crate::domain::fields;
use crate::storage::{Field, Row};

const REF_TYPE_CHILD_OF: &str = "CHILD_OF";
const REF_TYPE_FOLLOWS_FROM: &str = "FOLLOWS_FROM";

/// Link attribute carrying an explicit OpenTracing reference type.
const OPENTRACING_REF_TYPE_ATTR: &str = "opentracing.ref_type";

#[derive(Debug, Default, Serialize, PartialEq)]
pub struct JaegerApiResponse {
    pub data: Option<JaegerData>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
    pub errors: Vec<JaegerApiError>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(untagged)]
pub enum JaegerData {
    Names(Vec<String>),
    Traces(Vec<Trace>),
}

#[derive(Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JaegerApiError {
    pub code: u16,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// A collection of spans sharing one trace id.
#[derive(Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    #[serde(rename = "traceID")]
    pub trace_id: String,
    pub spans: Vec<Span>,
    pub processes: HashMap<String, Process>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    #[serde(rename = "traceID")]
    pub trace_id: String,
    #[serde(rename = "spanID")]
    pub span_id: String,
    pub operation_name: String,
    pub references: Vec<Reference>,
    /// Microseconds since the unix epoch.
    pub start_time: u64,
    /// Microseconds.
    pub duration: u64,
    pub tags: Vec<KeyValue>,
    pub logs: Vec<Log>,
    #[serde(rename = "processID")]
    pub process_id: String,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    #[serde(rename = "traceID")]
    pub trace_id: String,
    #[serde(rename = "spanID")]
    pub span_id: String,
    pub ref_type: String,
}

#[derive(Debug, Default, Serialize, PartialEq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    pub service_name: String,
    pub tags: Vec<KeyValue>,
}

#[derive(Debug, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    /// Microseconds since the unix epoch.
    pub timestamp: u64,
    pub fields: Vec<KeyValue>,
}

/// All flattened values are stored as strings, so the reassembled tag type
/// is always `string`.
#[derive(Debug, Serialize, PartialEq, Clone)]
pub struct KeyValue {
    pub key: String,
    #[serde(rename = "type")]
    pub value_type: &'static str,
    pub value: String,
}

impl KeyValue {
    fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value_type: "string",
            value: value.into(),
        }
    }
}

/// A row that cannot become a span because mandatory columns are missing.
#[derive(Error, Debug)]
#[error("invalid fields: [{}]", format_fields(.fields))]
pub struct InvalidFieldsError {
    pub fields: Vec<Field>,
}

fn format_fields(fields: &[Field]) -> String {
    fields
        .iter()
        .map(|f| format!("{{{} {}}}", f.name, f.value))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A reassembled span together with the process that emitted it. The
/// process is attached to the span (via `process_id`) only when traces are
/// grouped for a response.
#[derive(Debug, Default, PartialEq)]
pub struct ReassembledSpan {
    pub span: Span,
    pub process: Process,
}

#[derive(Default)]
struct LogBuilder {
    timestamp: u64,
    fields: Vec<KeyValue>,
}

#[derive(Default)]
struct LinkBuilder {
    trace_id: String,
    span_id: String,
    ref_type: Option<String>,
}

/// Invert the flattening for one stored row.
///
/// Walks the fields in order, so tag order matches field order. Fields with
/// a leading underscore (`_msg`, `_time`) are storage internals and are
/// ignored.
pub fn fields_to_span(row_fields: &[Field]) -> Result<ReassembledSpan, InvalidFieldsError> {
    let mut span = Span::default();
    let mut process = Process::default();
    let mut start_time_nano: u64 = 0;
    let mut end_time_nano: u64 = 0;
    let mut parent_span_id = String::new();
    let mut logs: BTreeMap<u64, LogBuilder> = BTreeMap::new();
    let mut links: BTreeMap<u64, LinkBuilder> = BTreeMap::new();

    for field in row_fields {
        let name = field.name.as_str();
        let value = field.value.as_str();
        if name.starts_with('_') {
            continue;
        }

        if name == fields::RESOURCE_ATTR_SERVICE_NAME {
            process.service_name = value.to_string();
        } else if let Some(key) = name.strip_prefix(fields::RESOURCE_ATTR_PREFIX) {
            process.tags.push(KeyValue::string(key, value));
        } else if name == fields::SCOPE_NAME_FIELD {
            span.tags.push(KeyValue::string("otel.scope.name", value));
        } else if name == fields::SCOPE_VERSION_FIELD {
            span.tags.push(KeyValue::string("otel.scope.version", value));
        } else if name.starts_with(fields::SCOPE_ATTR_PREFIX) {
            // scope attributes keep their prefix to stay distinguishable
            // from span attributes
            span.tags.push(KeyValue::string(name, value));
        } else if name == fields::TRACE_ID_FIELD {
            span.trace_id = value.to_string();
        } else if name == fields::SPAN_ID_FIELD {
            span.span_id = value.to_string();
        } else if name == fields::TRACE_STATE_FIELD {
            span.tags.push(KeyValue::string("w3c.tracestate", value));
        } else if name == fields::PARENT_SPAN_ID_FIELD {
            parent_span_id = value.to_string();
        } else if name == fields::NAME_FIELD {
            span.operation_name = value.to_string();
        } else if name == fields::KIND_FIELD {
            span.tags
                .push(KeyValue::string("span.kind", kind_to_jaeger(value)));
        } else if name == fields::START_TIME_UNIX_NANO_FIELD {
            start_time_nano = value.parse().unwrap_or(0);
        } else if name == fields::END_TIME_UNIX_NANO_FIELD {
            end_time_nano = value.parse().unwrap_or(0);
        } else if name == fields::STATUS_MESSAGE_FIELD {
            span.tags
                .push(KeyValue::string("otel.status_description", value));
        } else if name == fields::STATUS_CODE_FIELD {
            span.tags.push(KeyValue::string("error", error_tag(value)));
        } else if let Some(rest) = name.strip_prefix(fields::EVENT_PREFIX) {
            let (inner, idx) = attribute_name_and_index(rest);
            let Ok(idx) = idx.parse::<u64>() else {
                continue;
            };
            let log = logs.entry(idx).or_default();
            if inner == fields::EVENT_TIME_UNIX_NANO_FIELD {
                log.timestamp = value.parse::<u64>().unwrap_or(0) / 1_000;
            } else if inner == fields::EVENT_NAME_FIELD {
                log.fields.push(KeyValue::string("event", value));
            } else if let Some(key) = inner.strip_prefix(fields::EVENT_ATTR_PREFIX) {
                log.fields.push(KeyValue::string(key, value));
            }
        } else if let Some(rest) = name.strip_prefix(fields::LINK_PREFIX) {
            let (inner, idx) = attribute_name_and_index(rest);
            let Ok(idx) = idx.parse::<u64>() else {
                continue;
            };
            let link = links.entry(idx).or_default();
            if inner == fields::LINK_TRACE_ID_FIELD {
                link.trace_id = value.to_string();
            } else if inner == fields::LINK_SPAN_ID_FIELD {
                link.span_id = value.to_string();
            } else if let Some(key) = inner.strip_prefix(fields::LINK_ATTR_PREFIX) {
                if key == OPENTRACING_REF_TYPE_ATTR {
                    link.ref_type = Some(value.to_string());
                }
            }
        } else if let Some(key) = name.strip_prefix(fields::SPAN_ATTR_PREFIX) {
            span.tags.push(KeyValue::string(key, value));
        }
        // dropped counts, flags and unknown fields are not represented in
        // the Jaeger model
    }

    if span.trace_id.is_empty() || span.span_id.is_empty() {
        return Err(InvalidFieldsError {
            fields: row_fields.to_vec(),
        });
    }

    span.start_time = start_time_nano / 1_000;
    span.duration = end_time_nano.saturating_sub(start_time_nano) / 1_000;
    span.logs = logs.into_values().map(|l| Log {
        timestamp: l.timestamp,
        fields: l.fields,
    }).collect();

    let link_refs: Vec<Reference> = links
        .into_values()
        .map(|link| Reference {
            ref_type: match &link.ref_type {
                Some(t) if t.eq_ignore_ascii_case("child_of") => REF_TYPE_CHILD_OF.to_string(),
                _ => REF_TYPE_FOLLOWS_FROM.to_string(),
            },
            trace_id: link.trace_id,
            span_id: link.span_id,
        })
        .collect();

    // the parent relation becomes a CHILD_OF reference unless a link
    // already points at the parent span
    if !parent_span_id.is_empty()
        && !link_refs
            .iter()
            .any(|r| r.trace_id == span.trace_id && r.span_id == parent_span_id)
    {
        span.references.push(Reference {
            trace_id: span.trace_id.clone(),
            span_id: parent_span_id,
            ref_type: REF_TYPE_CHILD_OF.to_string(),
        });
    }
    span.references.extend(link_refs);

    Ok(ReassembledSpan { span, process })
}

/// Split a trailing `:<digits>` run off a field name.
///
/// Only the last colon-separated segment counts, and only when it is
/// non-empty and all digits; anything else returns the name unchanged with
/// an empty index.
pub fn attribute_name_and_index(name: &str) -> (&str, &str) {
    match name.rfind(':') {
        Some(pos) if pos + 1 < name.len() => {
            let idx = &name[pos + 1..];
            if idx.bytes().all(|b| b.is_ascii_digit()) {
                (&name[..pos], idx)
            } else {
                (name, "")
            }
        }
        _ => (name, ""),
    }
}

fn kind_to_jaeger(kind: &str) -> &'static str {
    match kind {
        "1" => "internal",
        "2" => "server",
        "3" => "client",
        "4" => "producer",
        "5" => "consumer",
        _ => "unspecified",
    }
}

fn error_tag(status_code: &str) -> &'static str {
    match status_code {
        "2" => "true",
        "1" => "false",
        _ => "unset",
    }
}

/// Group reassembled rows into Jaeger traces.
///
/// Row order within a trace is preserved; traces appear in first-seen
/// order. Rows missing mandatory columns are skipped, and their diagnostics
/// are returned for the response `errors` array.
pub fn rows_to_traces(rows: &[Row]) -> (Vec<Trace>, Vec<String>) {
    let mut traces: Vec<Trace> = Vec::new();
    let mut trace_index: HashMap<String, usize> = HashMap::new();
    let mut diagnostics: Vec<String> = Vec::new();

    for row in rows {
        let reassembled = match fields_to_span(&row.fields) {
            Ok(r) => r,
            Err(e) => {
                diagnostics.push(e.to_string());
                continue;
            }
        };
        let ReassembledSpan { mut span, process } = reassembled;

        let trace_pos = *trace_index
            .entry(span.trace_id.clone())
            .or_insert_with(|| {
                traces.push(Trace {
                    trace_id: span.trace_id.clone(),
                    ..Default::default()
                });
                traces.len() - 1
            });
        let trace = &mut traces[trace_pos];

        // one process entry per distinct service name within the trace
        let process_id = match trace
            .processes
            .iter()
            .find(|(_, p)| p.service_name == process.service_name)
        {
            Some((id, _)) => id.clone(),
            None => {
                let id = format!("p{}", trace.processes.len() + 1);
                trace.processes.insert(id.clone(), process);
                id
            }
        };
        span.process_id = process_id;
        trace.spans.push(span);
    }

    (traces, diagnostics)
}
