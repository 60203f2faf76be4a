//! Span flattening: OTLP trace exports into flat storage rows.
//!
//! Each span becomes one principal row whose fields follow the grammar in
//! [`crate::domain::fields`], plus (once per trace id) an index row in the
//! partitioned trace-id index stream. The common resource- and scope-level
//! fields are built once per group and shared across sibling spans by
//! truncating a single reusable buffer back to snapshot lengths.

use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};
use opentelemetry_proto::tonic::trace::v1::{ScopeSpans, Span};

use crate::domain::dedup::TraceIdDedup;
use crate::domain::fields;
use crate::storage::{Field, RowSink};

/// The storage engine does not support empty field values; they are
/// replaced with this sentinel.
const EMPTY_VALUE_SENTINEL: &str = "-";

/// Flatten every span of the export request into `sink`.
///
/// `extra_stream_field_names` are user-supplied field names appended after
/// the mandatory `[resource_attr:service.name, name]` stream fields of each
/// principal row; names absent from the row are skipped.
pub fn push_export_request(
    req: &ExportTraceServiceRequest,
    sink: &mut dyn RowSink,
    dedup: &TraceIdDedup,
    extra_stream_field_names: &[String],
) {
    let mut common_fields: Vec<Field> = Vec::new();
    for rs in &req.resource_spans {
        common_fields.clear();
        if let Some(resource) = &rs.resource {
            append_key_values_with_prefix(
                &mut common_fields,
                &resource.attributes,
                fields::RESOURCE_ATTR_PREFIX,
                "",
            );
        }
        let resource_fields_len = common_fields.len();
        for ss in &rs.scope_spans {
            common_fields.truncate(resource_fields_len);
            push_fields_from_scope_spans(
                ss,
                &mut common_fields,
                sink,
                dedup,
                extra_stream_field_names,
            );
        }
    }
}

fn push_fields_from_scope_spans(
    ss: &ScopeSpans,
    common_fields: &mut Vec<Field>,
    sink: &mut dyn RowSink,
    dedup: &TraceIdDedup,
    extra_stream_field_names: &[String],
) {
    if let Some(scope) = &ss.scope {
        common_fields.push(Field::new(fields::SCOPE_NAME_FIELD, scope.name.clone()));
        common_fields.push(Field::new(
            fields::SCOPE_VERSION_FIELD,
            scope.version.clone(),
        ));
        append_key_values_with_prefix(
            common_fields,
            &scope.attributes,
            fields::SCOPE_ATTR_PREFIX,
            "",
        );
    }
    let scope_fields_len = common_fields.len();
    for span in &ss.spans {
        common_fields.truncate(scope_fields_len);
        push_fields_from_span(span, common_fields, sink, dedup, extra_stream_field_names);
    }
}

fn push_fields_from_span(
    span: &Span,
    fields_buf: &mut Vec<Field>,
    sink: &mut dyn RowSink,
    dedup: &TraceIdDedup,
    extra_stream_field_names: &[String],
) {
    let trace_id = hex::encode(&span.trace_id);
    let span_id = hex::encode(&span.span_id);
    let (status_message, status_code) = match &span.status {
        Some(status) => (status.message.clone(), status.code),
        None => (String::new(), 0),
    };

    fields_buf.push(Field::new(fields::TRACE_ID_FIELD, trace_id.clone()));
    fields_buf.push(Field::new(fields::SPAN_ID_FIELD, span_id));
    fields_buf.push(Field::new(
        fields::TRACE_STATE_FIELD,
        span.trace_state.clone(),
    ));
    fields_buf.push(Field::new(
        fields::PARENT_SPAN_ID_FIELD,
        hex::encode(&span.parent_span_id),
    ));
    fields_buf.push(Field::new(fields::FLAGS_FIELD, span.flags.to_string()));
    fields_buf.push(Field::new(fields::NAME_FIELD, span.name.clone()));
    fields_buf.push(Field::new(fields::KIND_FIELD, span.kind.to_string()));
    fields_buf.push(Field::new(
        fields::START_TIME_UNIX_NANO_FIELD,
        span.start_time_unix_nano.to_string(),
    ));
    fields_buf.push(Field::new(
        fields::END_TIME_UNIX_NANO_FIELD,
        span.end_time_unix_nano.to_string(),
    ));
    fields_buf.push(Field::new(
        fields::DURATION_FIELD,
        span.end_time_unix_nano
            .saturating_sub(span.start_time_unix_nano)
            .to_string(),
    ));
    fields_buf.push(Field::new(
        fields::DROPPED_ATTRIBUTES_COUNT_FIELD,
        span.dropped_attributes_count.to_string(),
    ));
    fields_buf.push(Field::new(
        fields::DROPPED_EVENTS_COUNT_FIELD,
        span.dropped_events_count.to_string(),
    ));
    fields_buf.push(Field::new(
        fields::DROPPED_LINKS_COUNT_FIELD,
        span.dropped_links_count.to_string(),
    ));
    fields_buf.push(Field::new(fields::STATUS_MESSAGE_FIELD, status_message));
    fields_buf.push(Field::new(
        fields::STATUS_CODE_FIELD,
        status_code.to_string(),
    ));

    append_key_values_with_prefix(fields_buf, &span.attributes, fields::SPAN_ATTR_PREFIX, "");

    for (idx, event) in span.events.iter().enumerate() {
        let suffix = format!(":{idx}");
        fields_buf.push(Field::new(
            format!(
                "{}{}{suffix}",
                fields::EVENT_PREFIX,
                fields::EVENT_TIME_UNIX_NANO_FIELD
            ),
            event.time_unix_nano.to_string(),
        ));
        fields_buf.push(Field::new(
            format!(
                "{}{}{suffix}",
                fields::EVENT_PREFIX,
                fields::EVENT_NAME_FIELD
            ),
            event.name.clone(),
        ));
        fields_buf.push(Field::new(
            format!(
                "{}{}{suffix}",
                fields::EVENT_PREFIX,
                fields::EVENT_DROPPED_ATTRIBUTES_COUNT_FIELD
            ),
            event.dropped_attributes_count.to_string(),
        ));
        append_key_values_with_prefix(
            fields_buf,
            &event.attributes,
            &format!("{}{}", fields::EVENT_PREFIX, fields::EVENT_ATTR_PREFIX),
            &suffix,
        );
    }

    for (idx, link) in span.links.iter().enumerate() {
        let suffix = format!(":{idx}");
        fields_buf.push(Field::new(
            format!(
                "{}{}{suffix}",
                fields::LINK_PREFIX,
                fields::LINK_TRACE_ID_FIELD
            ),
            hex::encode(&link.trace_id),
        ));
        fields_buf.push(Field::new(
            format!(
                "{}{}{suffix}",
                fields::LINK_PREFIX,
                fields::LINK_SPAN_ID_FIELD
            ),
            hex::encode(&link.span_id),
        ));
        fields_buf.push(Field::new(
            format!(
                "{}{}{suffix}",
                fields::LINK_PREFIX,
                fields::LINK_TRACE_STATE_FIELD
            ),
            link.trace_state.clone(),
        ));
        fields_buf.push(Field::new(
            format!(
                "{}{}{suffix}",
                fields::LINK_PREFIX,
                fields::LINK_DROPPED_ATTRIBUTES_COUNT_FIELD
            ),
            link.dropped_attributes_count.to_string(),
        ));
        fields_buf.push(Field::new(
            format!(
                "{}{}{suffix}",
                fields::LINK_PREFIX,
                fields::LINK_FLAGS_FIELD
            ),
            link.flags.to_string(),
        ));
        append_key_values_with_prefix(
            fields_buf,
            &link.attributes,
            &format!("{}{}", fields::LINK_PREFIX, fields::LINK_ATTR_PREFIX),
            &suffix,
        );
    }

    fields_buf.push(Field::new(fields::MSG_FIELD, EMPTY_VALUE_SENTINEL));

    let stream_fields = principal_stream_fields(fields_buf, extra_stream_field_names);
    sink.add_row(
        span.end_time_unix_nano as i64,
        fields_buf,
        Some(&stream_fields),
    );

    // One index-stream entry per trace id. The set is approximate: after
    // eviction a trace id may produce a duplicate entry, never a missing row.
    if !dedup.has(&trace_id) {
        let bucket = fields::trace_id_index_partition(&trace_id);
        sink.add_row(
            span.start_time_unix_nano as i64,
            &[
                Field::new(fields::TRACE_ID_INDEX_FIELD, trace_id.clone()),
                Field::new(fields::MSG_FIELD, EMPTY_VALUE_SENTINEL),
            ],
            Some(&[Field::new(
                fields::TRACE_ID_INDEX_STREAM_FIELD,
                bucket.to_string(),
            )]),
        );
        dedup.insert(&trace_id);
    }
}

/// Stream fields of a principal row: service name and span name first, then
/// any user-requested fields found in the row.
fn principal_stream_fields(row_fields: &[Field], extra_names: &[String]) -> Vec<Field> {
    let lookup = |name: &str| {
        row_fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value.clone())
    };
    let mut stream_fields = vec![
        Field::new(
            fields::RESOURCE_ATTR_SERVICE_NAME,
            lookup(fields::RESOURCE_ATTR_SERVICE_NAME)
                .unwrap_or_else(|| EMPTY_VALUE_SENTINEL.to_string()),
        ),
        Field::new(
            fields::NAME_FIELD,
            lookup(fields::NAME_FIELD).unwrap_or_else(|| EMPTY_VALUE_SENTINEL.to_string()),
        ),
    ];
    for name in extra_names {
        if let Some(value) = lookup(name) {
            stream_fields.push(Field::new(name.clone(), value));
        }
    }
    stream_fields
}

/// Append attributes as `prefix + dotted.path + suffix` fields.
///
/// Map values recurse with the parent key joined by `.`; the walk uses an
/// explicit stack so pathologically nested inputs cannot exhaust the call
/// stack. Other value shapes are rendered to their canonical string, with
/// empty strings replaced by the `"-"` sentinel.
fn append_key_values_with_prefix(
    fields_buf: &mut Vec<Field>,
    kvs: &[KeyValue],
    prefix: &str,
    suffix: &str,
) {
    let mut stack: Vec<(String, &KeyValue)> = kvs
        .iter()
        .rev()
        .map(|kv| (String::new(), kv))
        .collect();
    while let Some((parent, kv)) = stack.pop() {
        let field_name = if parent.is_empty() {
            kv.key.clone()
        } else {
            format!("{parent}.{}", kv.key)
        };

        if let Some(any_value::Value::KvlistValue(list)) =
            kv.value.as_ref().and_then(|v| v.value.as_ref())
        {
            for child in list.values.iter().rev() {
                stack.push((field_name.clone(), child));
            }
            continue;
        }

        let mut value = format_any_value(kv.value.as_ref());
        if value.is_empty() {
            value = EMPTY_VALUE_SENTINEL.to_string();
        }
        fields_buf.push(Field::new(format!("{prefix}{field_name}{suffix}"), value));
    }
}

/// Canonical string form of an attribute value.
///
/// Bytes render as lowercase hex (the decoder already normalized both wire
/// encodings to raw bytes); arrays render as a JSON array of element
/// strings.
pub fn format_any_value(value: Option<&AnyValue>) -> String {
    match value.and_then(|v| v.value.as_ref()) {
        None => String::new(),
        Some(any_value::Value::StringValue(s)) => s.clone(),
        Some(any_value::Value::BoolValue(b)) => b.to_string(),
        Some(any_value::Value::IntValue(i)) => i.to_string(),
        Some(any_value::Value::DoubleValue(d)) => d.to_string(),
        Some(any_value::Value::BytesValue(b)) => hex::encode(b),
        Some(any_value::Value::ArrayValue(array)) => {
            let elements: Vec<String> = array
                .values
                .iter()
                .map(|v| format_any_value(Some(v)))
                .collect();
            serde_json::to_string(&elements).unwrap_or_default()
        }
        Some(any_value::Value::KvlistValue(list)) => {
            // maps are flattened by the caller; this arm is only reached for
            // maps nested inside arrays
            let object: serde_json::Map<String, serde_json::Value> = list
                .values
                .iter()
                .map(|kv| {
                    (
                        kv.key.clone(),
                        serde_json::Value::String(format_any_value(kv.value.as_ref())),
                    )
                })
                .collect();
            serde_json::to_string(&object).unwrap_or_default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_proto::tonic::common::v1::{ArrayValue, InstrumentationScope, KeyValueList};
    use opentelemetry_proto::tonic::resource::v1::Resource;
    use opentelemetry_proto::tonic::trace::v1::span::{Event, Link};
    use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Status};

    use crate::storage::Row;

    fn string_value(s: &str) -> Option<AnyValue> {
        Some(AnyValue {
            value: Some(any_value::Value::StringValue(s.to_string())),
        })
    }

    fn kv(key: &str, value: Option<AnyValue>) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value,
        }
    }

    fn test_request(trace_id: &[u8], span_id: &[u8]) -> ExportTraceServiceRequest {
        ExportTraceServiceRequest {
            resource_spans: vec![ResourceSpans {
                resource: Some(Resource {
                    attributes: vec![kv("service.name", string_value("checkout"))],
                    dropped_attributes_count: 0,
                    ..Default::default()
                }),
                scope_spans: vec![ScopeSpans {
                    scope: Some(InstrumentationScope {
                        name: "otel-sdk".to_string(),
                        version: "1.2.3".to_string(),
                        attributes: vec![],
                        dropped_attributes_count: 0,
                    }),
                    spans: vec![Span {
                        trace_id: trace_id.to_vec(),
                        span_id: span_id.to_vec(),
                        trace_state: String::new(),
                        parent_span_id: vec![],
                        flags: 0,
                        name: "charge-card".to_string(),
                        kind: 1,
                        start_time_unix_nano: 1_000,
                        end_time_unix_nano: 3_500,
                        attributes: vec![kv("http.method", string_value("POST"))],
                        dropped_attributes_count: 0,
                        events: vec![Event {
                            time_unix_nano: 1_200,
                            name: "retry".to_string(),
                            attributes: vec![kv("attempt", string_value("2"))],
                            dropped_attributes_count: 0,
                        }],
                        dropped_events_count: 0,
                        links: vec![Link {
                            trace_id: vec![9, 9],
                            span_id: vec![8, 8],
                            trace_state: String::new(),
                            attributes: vec![],
                            dropped_attributes_count: 0,
                            flags: 0,
                        }],
                        dropped_links_count: 0,
                        status: Some(Status {
                            message: "boom".to_string(),
                            code: 2,
                        }),
                    }],
                    schema_url: String::new(),
                }],
                schema_url: String::new(),
            }],
        }
    }

    fn field_value<'a>(row: &'a Row, name: &str) -> Option<&'a str> {
        row.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value.as_str())
    }

    #[test]
    fn test_principal_row_fields_and_order() {
        let req = test_request(&[1, 2], &[3, 4]);
        let dedup = TraceIdDedup::default();
        let mut rows: Vec<Row> = Vec::new();
        push_export_request(&req, &mut rows, &dedup, &[]);

        assert_eq!(rows.len(), 2, "one principal row plus one index row");
        let principal = &rows[0];
        assert_eq!(principal.timestamp, 3_500);

        let names: Vec<&str> = principal.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "resource_attr:service.name",
                "otel.scope.name",
                "otel.scope.version",
                "trace_id",
                "span_id",
                "trace_state",
                "parent_span_id",
                "flags",
                "name",
                "kind",
                "start_time_unix_nano",
                "end_time_unix_nano",
                "duration",
                "dropped_attributes_count",
                "dropped_events_count",
                "dropped_links_count",
                "status.message",
                "status.code",
                "attr:http.method",
                "event:time_unix_nano:0",
                "event:name:0",
                "event:dropped_attributes_count:0",
                "event:attr:attempt:0",
                "link:trace_id:0",
                "link:span_id:0",
                "link:trace_state:0",
                "link:dropped_attributes_count:0",
                "link:flags:0",
                "_msg",
            ]
        );

        assert_eq!(field_value(principal, "trace_id"), Some("0102"));
        assert_eq!(field_value(principal, "span_id"), Some("0304"));
        assert_eq!(field_value(principal, "duration"), Some("2500"));
        assert_eq!(field_value(principal, "status.code"), Some("2"));
        assert_eq!(field_value(principal, "link:trace_id:0"), Some("0909"));
        assert_eq!(field_value(principal, "_msg"), Some("-"));

        let stream_fields = principal.stream_fields.as_ref().unwrap();
        assert_eq!(
            stream_fields,
            &vec![
                Field::new("resource_attr:service.name", "checkout"),
                Field::new("name", "charge-card"),
            ]
        );
    }

    #[test]
    fn test_index_row_shape() {
        let req = test_request(&[0xab, 0xcd], &[1]);
        let dedup = TraceIdDedup::default();
        let mut rows: Vec<Row> = Vec::new();
        push_export_request(&req, &mut rows, &dedup, &[]);

        let index = &rows[1];
        assert_eq!(index.timestamp, 1_000);
        assert_eq!(field_value(index, "trace_id_idx"), Some("abcd"));
        assert_eq!(field_value(index, "_msg"), Some("-"));
        let stream_fields = index.stream_fields.as_ref().unwrap();
        assert_eq!(stream_fields.len(), 1);
        assert_eq!(stream_fields[0].name, "trace_id_idx_stream");
        let bucket: u64 = stream_fields[0].value.parse().unwrap();
        assert_eq!(bucket, fields::trace_id_index_partition("abcd"));
    }

    #[test]
    fn test_index_row_emitted_once_per_trace() {
        // dedup one-shot: N spans of the same trace produce exactly one
        // index row, even across requests
        let dedup = TraceIdDedup::default();
        let mut rows: Vec<Row> = Vec::new();
        for _ in 0..5 {
            let req = test_request(&[7; 16], &[1; 8]);
            push_export_request(&req, &mut rows, &dedup, &[]);
        }
        let index_rows = rows
            .iter()
            .filter(|r| r.fields.iter().any(|f| f.name == "trace_id_idx"))
            .count();
        assert_eq!(index_rows, 1);
        assert_eq!(rows.len(), 6);
    }

    #[test]
    fn test_extra_stream_fields_appended_after_mandatory() {
        let req = test_request(&[1], &[2]);
        let dedup = TraceIdDedup::default();
        let mut rows: Vec<Row> = Vec::new();
        push_export_request(
            &req,
            &mut rows,
            &dedup,
            &["attr:http.method".to_string(), "no.such.field".to_string()],
        );
        let stream_fields = rows[0].stream_fields.as_ref().unwrap();
        assert_eq!(stream_fields.len(), 3);
        assert_eq!(stream_fields[2], Field::new("attr:http.method", "POST"));
    }

    #[test]
    fn test_nested_map_attributes_use_dotted_paths() {
        let nested = kv(
            "client",
            Some(AnyValue {
                value: Some(any_value::Value::KvlistValue(KeyValueList {
                    values: vec![
                        kv("os", string_value("linux")),
                        kv(
                            "net",
                            Some(AnyValue {
                                value: Some(any_value::Value::KvlistValue(KeyValueList {
                                    values: vec![kv("proto", string_value("h2"))],
                                })),
                            }),
                        ),
                    ],
                })),
            }),
        );
        let mut fields_buf = Vec::new();
        append_key_values_with_prefix(&mut fields_buf, &[nested], "attr:", "");
        let names: Vec<&str> = fields_buf.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["attr:client.os", "attr:client.net.proto"]);
    }

    #[test]
    fn test_empty_attribute_value_becomes_sentinel() {
        let mut fields_buf = Vec::new();
        append_key_values_with_prefix(
            &mut fields_buf,
            &[kv("empty", string_value("")), kv("missing", None)],
            "attr:",
            "",
        );
        assert_eq!(fields_buf[0].value, "-");
        assert_eq!(fields_buf[1].value, "-");
    }

    #[test]
    fn test_format_any_value_scalars() {
        assert_eq!(format_any_value(string_value("x").as_ref()), "x");
        assert_eq!(
            format_any_value(Some(&AnyValue {
                value: Some(any_value::Value::BoolValue(true))
            })),
            "true"
        );
        assert_eq!(
            format_any_value(Some(&AnyValue {
                value: Some(any_value::Value::IntValue(-42))
            })),
            "-42"
        );
        assert_eq!(
            format_any_value(Some(&AnyValue {
                value: Some(any_value::Value::DoubleValue(1.25))
            })),
            "1.25"
        );
        assert_eq!(
            format_any_value(Some(&AnyValue {
                value: Some(any_value::Value::BytesValue(vec![0xde, 0xad]))
            })),
            "dead"
        );
    }

    #[test]
    fn test_format_any_value_array() {
        let array = AnyValue {
            value: Some(any_value::Value::ArrayValue(ArrayValue {
                values: vec![
                    AnyValue {
                        value: Some(any_value::Value::StringValue("a".to_string())),
                    },
                    AnyValue {
                        value: Some(any_value::Value::IntValue(3)),
                    },
                ],
            })),
        };
        assert_eq!(format_any_value(Some(&array)), r#"["a","3"]"#);
    }

    #[test]
    fn test_reassembling_principal_row_inverts_flattening() {
        use crate::api::routes::jaeger::model::fields_to_span;

        let req = test_request(&[0x11, 0x22], &[0x33, 0x44]);
        let dedup = TraceIdDedup::default();
        let mut rows: Vec<Row> = Vec::new();
        push_export_request(&req, &mut rows, &dedup, &[]);

        let reassembled = fields_to_span(&rows[0].fields).unwrap();
        let span = &reassembled.span;
        assert_eq!(span.trace_id, "1122");
        assert_eq!(span.span_id, "3344");
        assert_eq!(span.operation_name, "charge-card");
        assert_eq!(span.logs.len(), 1);
        assert_eq!(span.references.len(), 1);
        assert_eq!(span.duration, 2); // 2500ns rounds down to 2µs
        assert_eq!(reassembled.process.service_name, "checkout");

        let tag = |key: &str| {
            span.tags
                .iter()
                .find(|t| t.key == key)
                .map(|t| t.value.as_str())
        };
        assert_eq!(tag("span.kind"), Some("internal"));
        assert_eq!(tag("error"), Some("true"));
        assert_eq!(tag("otel.status_description"), Some("boom"));
        assert_eq!(tag("http.method"), Some("POST"));
        assert_eq!(tag("otel.scope.name"), Some("otel-sdk"));
    }

    #[test]
    fn test_scope_fields_reset_between_scope_groups() {
        // two scope groups under one resource must not leak each other's
        // scope fields
        let mut req = test_request(&[1], &[2]);
        let mut second = req.resource_spans[0].scope_spans[0].clone();
        second.scope.as_mut().unwrap().name = "other-sdk".to_string();
        second.spans[0].trace_id = vec![0xee];
        req.resource_spans[0].scope_spans.push(second);

        let dedup = TraceIdDedup::default();
        let mut rows: Vec<Row> = Vec::new();
        push_export_request(&req, &mut rows, &dedup, &[]);

        let principals: Vec<&Row> = rows
            .iter()
            .filter(|r| r.fields.iter().any(|f| f.name == "span_id"))
            .collect();
        assert_eq!(principals.len(), 2);
        assert_eq!(field_value(principals[0], "otel.scope.name"), Some("otel-sdk"));
        assert_eq!(
            field_value(principals[1], "otel.scope.name"),
            Some("other-sdk")
        );
        let scope_name_count = principals[1]
            .fields
            .iter()
            .filter(|f| f.name == "otel.scope.name")
            .count();
        assert_eq!(scope_name_count, 1);
    }
}
