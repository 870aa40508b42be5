//! Codec layer: transforms between a batch of ops and the wire messages that
//! carry it.
//!
//! Outbound, a batch may be grouped into one envelope, compressed into one
//! packed message plus placeholders, and split into chunks. [`remote`] undoes
//! all three on the inbound side.

pub mod compressor;
pub mod grouping;
pub mod remote;
pub mod splitter;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::message::MessageType;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Compression error: {0}")]
    CompressionError(String),

    #[error("Decompression error: {0}")]
    DecompressionError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Chunk error: {0}")]
    ChunkError(String),

    #[error("Batch framing error: {0}")]
    FramingError(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),
}

#[derive(Deserialize)]
struct RawRuntimeMessage {
    #[serde(rename = "type")]
    message_type: String,
    #[serde(default)]
    contents: Value,
}

/// Parse a serialized runtime message, rejecting unknown types.
pub fn parse_runtime_message(raw: &str) -> Result<(MessageType, Value), CodecError> {
    let parsed: RawRuntimeMessage =
        serde_json::from_str(raw).map_err(|e| CodecError::SerializationError(e.to_string()))?;
    let message_type = parsed
        .message_type
        .parse::<MessageType>()
        .map_err(|_| CodecError::UnknownMessageType(parsed.message_type.clone()))?;
    Ok((message_type, parsed.contents))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_runtime_message() {
        let (t, contents) = parse_runtime_message(r#"{"type":"GC","contents":[1]}"#).unwrap();
        assert_eq!(t, MessageType::Gc);
        assert_eq!(contents, serde_json::json!([1]));
    }

    #[test]
    fn test_parse_unknown_type() {
        let err = parse_runtime_message(r#"{"type":"mystery","contents":null}"#).unwrap_err();
        assert!(matches!(err, CodecError::UnknownMessageType(t) if t == "mystery"));
    }
}
