//! Batch compression.
//!
//! The contents of every message in the batch are deflated together into the
//! first message as `{"packedContents": <base64>}`. The remaining messages
//! become placeholders that keep their metadata but carry no contents, so
//! the batch keeps its length and its client sequence numbers.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use super::CodecError;
use crate::message::wire::WireMessage;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    Deflate,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackedContents {
    packed_contents: String,
}

/// Compress a batch into one packed message followed by placeholders.
pub fn compress_batch(
    batch: Vec<WireMessage>,
    algorithm: CompressionAlgorithm,
) -> Result<Vec<WireMessage>, CodecError> {
    if batch.is_empty() {
        return Ok(batch);
    }

    let contents = batch
        .iter()
        .map(|m| {
            m.contents.clone().ok_or_else(|| {
                CodecError::CompressionError("batch is already compressed".to_string())
            })
        })
        .collect::<Result<Vec<String>, _>>()?;

    let json = serde_json::to_vec(&contents)
        .map_err(|e| CodecError::SerializationError(e.to_string()))?;
    let packed = match algorithm {
        CompressionAlgorithm::Deflate => deflate(&json)?,
    };
    let packed = serde_json::to_string(&PackedContents {
        packed_contents: STANDARD.encode(packed),
    })
    .map_err(|e| CodecError::SerializationError(e.to_string()))?;

    let mut out = Vec::with_capacity(batch.len());
    for (i, message) in batch.into_iter().enumerate() {
        if i == 0 {
            out.push(WireMessage {
                contents: Some(packed.clone()),
                metadata: message.metadata,
                compression: Some(algorithm),
            });
        } else {
            out.push(WireMessage {
                contents: None,
                metadata: message.metadata,
                compression: None,
            });
        }
    }
    Ok(out)
}

/// Recover every message's contents from a packed first message.
pub fn decompress_contents(
    packed: &str,
    algorithm: CompressionAlgorithm,
) -> Result<Vec<String>, CodecError> {
    let packed: PackedContents = serde_json::from_str(packed)
        .map_err(|e| CodecError::DecompressionError(e.to_string()))?;
    let bytes = STANDARD
        .decode(packed.packed_contents)
        .map_err(|e| CodecError::DecompressionError(e.to_string()))?;
    let json = match algorithm {
        CompressionAlgorithm::Deflate => inflate(&bytes)?,
    };
    serde_json::from_slice(&json).map_err(|e| CodecError::DecompressionError(e.to_string()))
}

fn deflate(input: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(input)
        .map_err(|e| CodecError::CompressionError(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CodecError::CompressionError(e.to_string()))
}

fn inflate(input: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoded = Vec::new();
    DeflateDecoder::new(input)
        .read_to_end(&mut decoded)
        .map_err(|e| CodecError::DecompressionError(e.to_string()))?;
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageMetadata;

    fn wire(contents: &str) -> WireMessage {
        WireMessage::new(contents.to_string(), None)
    }

    #[test]
    fn test_compress_keeps_length_and_metadata() {
        let meta = MessageMetadata::default().with_field("k", serde_json::json!(1));
        let batch = vec![
            wire(r#"{"type":"op","contents":"a"}"#),
            WireMessage::new(r#"{"type":"op","contents":"b"}"#.into(), Some(meta.clone())),
        ];
        let out = compress_batch(batch, CompressionAlgorithm::Deflate).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].compression, Some(CompressionAlgorithm::Deflate));
        assert!(out[1].contents.is_none());
        assert_eq!(out[1].metadata, Some(meta));

        let unpacked =
            decompress_contents(out[0].contents.as_ref().unwrap(), CompressionAlgorithm::Deflate)
                .unwrap();
        assert_eq!(unpacked[1], r#"{"type":"op","contents":"b"}"#);
    }

    #[test]
    fn test_compression_shrinks_repetitive_payload() {
        let big = format!(r#"{{"type":"op","contents":"{}"}}"#, "x".repeat(10_000));
        let out = compress_batch(vec![wire(&big)], CompressionAlgorithm::Deflate).unwrap();
        assert!(out[0].content_size() < big.len() / 10);
    }

    #[test]
    fn test_recompressing_placeholder_fails() {
        let batch = vec![wire("a"), WireMessage::default()];
        assert!(matches!(
            compress_batch(batch, CompressionAlgorithm::Deflate),
            Err(CodecError::CompressionError(_))
        ));
    }

    #[test]
    fn test_decompress_garbage() {
        assert!(decompress_contents(r#"{"packedContents":"!!"}"#, CompressionAlgorithm::Deflate)
            .is_err());
    }
}
