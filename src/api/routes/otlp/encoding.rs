//! OTLP content-type handling and request/response codecs.
//!
//! The ingestion endpoint accepts protobuf (`application/x-protobuf`),
//! JSON (`application/json`) and gRPC-framed protobuf (`application/grpc`,
//! `application/grpc+proto`) per the OpenTelemetry Protocol specification.
//! Responses mirror the request encoding.

use std::fmt;

use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use prost::Message;
use serde::{Deserialize, Serialize};

use super::envelope;

/// Content type of an OTLP request/response pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtlpContentType {
    Protobuf,
    Json,
    /// Protobuf wrapped in the 5-byte gRPC message envelope.
    GrpcProtobuf,
}

impl OtlpContentType {
    /// Parse the content type from request headers. Unsupported types yield
    /// `None`; the caller must reject the request.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        if content_type.starts_with("application/x-protobuf") {
            Some(OtlpContentType::Protobuf)
        } else if content_type.starts_with("application/json") {
            Some(OtlpContentType::Json)
        } else if content_type.starts_with("application/grpc") {
            Some(OtlpContentType::GrpcProtobuf)
        } else {
            None
        }
    }

    pub fn as_header_value(self) -> &'static str {
        match self {
            OtlpContentType::Protobuf => "application/x-protobuf",
            OtlpContentType::Json => "application/json",
            OtlpContentType::GrpcProtobuf => "application/grpc+proto",
        }
    }

    /// Label used to partition the ingestion metrics.
    pub fn format_label(self) -> &'static str {
        match self {
            OtlpContentType::Protobuf | OtlpContentType::GrpcProtobuf => "protobuf",
            OtlpContentType::Json => "json",
        }
    }

    pub fn is_enveloped(self) -> bool {
        matches!(self, OtlpContentType::GrpcProtobuf)
    }
}

/// Decode an OTLP request from raw (already unframed) message bytes.
pub fn decode_request<T>(body: &[u8], content_type: OtlpContentType) -> Result<T, DecodeError>
where
    T: Message + Default + for<'de> Deserialize<'de>,
{
    match content_type {
        OtlpContentType::Protobuf | OtlpContentType::GrpcProtobuf => {
            T::decode(body).map_err(|e| DecodeError::Protobuf {
                bytes: body.len(),
                message: e.to_string(),
            })
        }
        OtlpContentType::Json => {
            serde_json::from_slice(body).map_err(|e| DecodeError::Json {
                bytes: body.len(),
                message: e.to_string(),
            })
        }
    }
}

fn encode_response<T>(response: &T, content_type: OtlpContentType) -> Result<Vec<u8>, String>
where
    T: Message + Serialize,
{
    match content_type {
        OtlpContentType::Protobuf => Ok(response.encode_to_vec()),
        OtlpContentType::Json => serde_json::to_vec(response).map_err(|e| e.to_string()),
        OtlpContentType::GrpcProtobuf => Ok(envelope::encode(&response.encode_to_vec())),
    }
}

/// Encode a reply matching the request content type. Enveloped replies also
/// carry the gRPC status headers expected by gRPC-framed HTTP clients.
pub fn success_response<T>(response: &T, content_type: OtlpContentType) -> Response
where
    T: Message + Serialize,
{
    let body = match encode_response(response, content_type) {
        Ok(body) => body,
        Err(e) => {
            tracing::error!(error = %e, "failed to encode OTLP response");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain")],
                "internal server error",
            )
                .into_response();
        }
    };

    if content_type.is_enveloped() {
        return (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, content_type.as_header_value()),
                (HeaderName::from_static("trailer"), "grpc-status, grpc-message"),
                (HeaderName::from_static("grpc-status"), "0"),
            ],
            body,
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type.as_header_value())],
        body,
    )
        .into_response()
}

/// Request body could not be parsed as an OTLP export message.
#[derive(Debug)]
pub enum DecodeError {
    Protobuf { bytes: usize, message: String },
    Json { bytes: usize, message: String },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Protobuf { bytes, message } => {
                write!(f, "cannot unmarshal request from {bytes} protobuf bytes: {message}")
            }
            DecodeError::Json { bytes, message } => {
                write!(f, "cannot unmarshal request from {bytes} JSON bytes: {message}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

impl DecodeError {
    pub fn into_response(self) -> Response {
        tracing::warn!(error = %self, "failed to decode OTLP request");
        (
            StatusCode::BAD_REQUEST,
            [(header::CONTENT_TYPE, "text/plain")],
            self.to_string(),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_proto::tonic::collector::trace::v1::{
        ExportTraceServiceRequest, ExportTraceServiceResponse,
    };

    #[test]
    fn test_content_type_detection() {
        let with = |value: &str| {
            let mut headers = HeaderMap::new();
            headers.insert(header::CONTENT_TYPE, value.parse().unwrap());
            OtlpContentType::from_headers(&headers)
        };
        assert_eq!(
            with("application/x-protobuf"),
            Some(OtlpContentType::Protobuf)
        );
        assert_eq!(with("application/json"), Some(OtlpContentType::Json));
        assert_eq!(
            with("application/json; charset=utf-8"),
            Some(OtlpContentType::Json)
        );
        assert_eq!(
            with("application/grpc"),
            Some(OtlpContentType::GrpcProtobuf)
        );
        assert_eq!(
            with("application/grpc+proto"),
            Some(OtlpContentType::GrpcProtobuf)
        );
        assert_eq!(with("text/plain"), None);
        assert_eq!(OtlpContentType::from_headers(&HeaderMap::new()), None);
    }

    #[test]
    fn test_format_labels() {
        assert_eq!(OtlpContentType::Protobuf.format_label(), "protobuf");
        assert_eq!(OtlpContentType::GrpcProtobuf.format_label(), "protobuf");
        assert_eq!(OtlpContentType::Json.format_label(), "json");
    }

    #[test]
    fn test_decode_protobuf_round_trip() {
        let request = ExportTraceServiceRequest {
            resource_spans: vec![],
        };
        let bytes = request.encode_to_vec();
        let decoded: ExportTraceServiceRequest =
            decode_request(&bytes, OtlpContentType::Protobuf).unwrap();
        assert_eq!(decoded.resource_spans.len(), 0);
    }

    #[test]
    fn test_decode_json() {
        let decoded: ExportTraceServiceRequest =
            decode_request(br#"{"resourceSpans":[]}"#, OtlpContentType::Json).unwrap();
        assert_eq!(decoded.resource_spans.len(), 0);
    }

    #[test]
    fn test_decode_error_cites_byte_count_and_kind() {
        let result: Result<ExportTraceServiceRequest, _> =
            decode_request(b"not valid protobuf", OtlpContentType::Protobuf);
        let err = result.unwrap_err();
        assert!(err
            .to_string()
            .starts_with("cannot unmarshal request from 18 protobuf bytes:"));

        let result: Result<ExportTraceServiceRequest, _> =
            decode_request(b"not json", OtlpContentType::Json);
        let err = result.unwrap_err();
        assert!(err
            .to_string()
            .starts_with("cannot unmarshal request from 8 JSON bytes:"));
    }

    #[test]
    fn test_enveloped_response_is_framed() {
        let response = ExportTraceServiceResponse {
            partial_success: None,
        };
        let body = encode_response(&response, OtlpContentType::GrpcProtobuf).unwrap();
        let inner = envelope::decode(&body).unwrap();
        let decoded = ExportTraceServiceResponse::decode(inner).unwrap();
        assert!(decoded.partial_success.is_none());
    }
}
