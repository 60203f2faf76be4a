//! `Content-Encoding` handling for ingestion request bodies.
//!
//! Ingestion is CPU-bound and latency until the data is searchable is
//! dominated by the storage engine, so bodies are buffered and decompressed
//! in one go rather than streamed.

use std::io::Read;

use axum::body::Bytes;
use flate2::read::{MultiGzDecoder, ZlibDecoder};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecompressError {
    #[error("unsupported Content-Encoding {0:?}; supported encodings are gzip, deflate and zstd")]
    UnsupportedEncoding(String),

    #[error("cannot decompress {encoding} data: {source}")]
    Corrupted {
        encoding: &'static str,
        source: std::io::Error,
    },
}

/// Decompress the request body according to the `Content-Encoding` header
/// value. An empty or `identity` encoding returns the body unchanged.
pub fn decompress_body(encoding: Option<&str>, body: Bytes) -> Result<Bytes, DecompressError> {
    match encoding {
        None | Some("") | Some("identity") => Ok(body),
        Some("gzip" | "x-gzip") => {
            let mut decompressed = Vec::new();
            MultiGzDecoder::new(body.as_ref())
                .read_to_end(&mut decompressed)
                .map_err(|e| DecompressError::Corrupted {
                    encoding: "gzip",
                    source: e,
                })?;
            Ok(Bytes::from(decompressed))
        }
        Some("deflate" | "x-deflate") => {
            let mut decompressed = Vec::new();
            ZlibDecoder::new(body.as_ref())
                .read_to_end(&mut decompressed)
                .map_err(|e| DecompressError::Corrupted {
                    encoding: "deflate",
                    source: e,
                })?;
            Ok(Bytes::from(decompressed))
        }
        Some("zstd") => {
            let decompressed =
                zstd::decode_all(body.as_ref()).map_err(|e| DecompressError::Corrupted {
                    encoding: "zstd",
                    source: e,
                })?;
            Ok(Bytes::from(decompressed))
        }
        Some(other) => Err(DecompressError::UnsupportedEncoding(other.to_string())),
    }
}
