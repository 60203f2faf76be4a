//! Length-prefixed transport envelope for gRPC-framed HTTP exports.
//!
//! Some OTLP clients post to the HTTP endpoint with the gRPC message
//! framing still in place
//! (<https://github.com/grpc/grpc/blob/master/doc/PROTOCOL-HTTP2.md#message-encoding>):
//!
//! ```text
//! +------------+---------------------------------------------+
//! |   1 byte   |                  4 bytes                    |
//! | compressed |            message length (u32 BE)          |
//! +------------+---------------------------------------------+
//! |                 message data (variable)                  |
//! +----------------------------------------------------------+
//! ```
//!
//! Compression inside the envelope is not supported; the flag must be 0.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("invalid grpc header length: {0}")]
    HeaderTooShort(usize),

    #[error("grpc compression is not supported")]
    CompressionUnsupported,

    #[error("invalid message length: {0}")]
    LengthMismatch(u32),
}

/// Strip the 5-byte envelope and return the message payload.
pub fn decode(body: &[u8]) -> Result<&[u8], EnvelopeError> {
    if body.len() < 5 {
        return Err(EnvelopeError::HeaderTooShort(body.len()));
    }
    if body[0] != 0 {
        return Err(EnvelopeError::CompressionUnsupported);
    }
    let message_length = u32::from_be_bytes([body[1], body[2], body[3], body[4]]);
    if body.len() != 5 + message_length as usize {
        return Err(EnvelopeError::LengthMismatch(message_length));
    }
    Ok(&body[5..])
}

/// Frame a reply message with the envelope header, compression flag 0.
pub fn encode(message: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(5 + message.len());
    framed.push(0);
    framed.extend_from_slice(&(message.len() as u32).to_be_bytes());
    framed.extend_from_slice(message);
    framed
}
