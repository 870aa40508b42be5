//! Chunking of oversized messages.
//!
//! Only the first message of a batch is split: after grouping or compression
//! it is the one carrying the payload. Chunks `1..n-1` are sent ahead of the
//! batch through the transport's chunk channel. The final chunk takes the
//! first message's place in the batch and keeps its metadata, so the batch
//! framing and client sequence numbers line up with an unsplit batch.

use serde::{Deserialize, Serialize};

use super::compressor::CompressionAlgorithm;
use super::CodecError;
use crate::message::wire::WireMessage;
use crate::message::{MessageType, RuntimeMessage};

/// Contents of a `chunkedOp` runtime message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkedOp {
    /// 1-based position of this chunk.
    pub chunk_id: usize,
    pub total_chunks: usize,
    pub contents: String,
    /// Compression of the reassembled message, carried on the final chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_compression: Option<CompressionAlgorithm>,
}

impl ChunkedOp {
    pub fn is_final(&self) -> bool {
        self.chunk_id == self.total_chunks
    }
}

/// Output of [`split_first_message`].
#[derive(Debug)]
pub struct SplitBatch {
    /// Chunks to send before the batch.
    pub chunks: Vec<WireMessage>,
    /// The batch with its first message replaced by the final chunk.
    pub batch: Vec<WireMessage>,
}

/// Split a string into pieces whose JSON-escaped form is at most
/// `chunk_size` bytes, without cutting through a character.
pub fn split_contents(contents: &str, chunk_size: usize) -> Result<Vec<String>, CodecError> {
    if chunk_size == 0 {
        return Err(CodecError::ChunkError("chunk size must be positive".to_string()));
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_size = 0;
    for ch in contents.chars() {
        let size = escaped_len(ch);
        if !current.is_empty() && current_size + size > chunk_size {
            chunks.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current.push(ch);
        current_size += size;
    }
    if !current.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }
    Ok(chunks)
}

/// Bytes `ch` takes inside a serde_json string literal.
fn escaped_len(ch: char) -> usize {
    match ch {
        '"' | '\\' | '\u{08}' | '\u{0c}' | '\n' | '\r' | '\t' => 2,
        c if (c as u32) < 0x20 => 6,
        c => c.len_utf8(),
    }
}

/// Split the first message of `batch` into chunks carrying at most
/// `chunk_size` escaped bytes of its contents.
pub fn split_first_message(
    mut batch: Vec<WireMessage>,
    chunk_size: usize,
) -> Result<SplitBatch, CodecError> {
    if batch.is_empty() {
        return Err(CodecError::ChunkError("cannot split an empty batch".to_string()));
    }

    let first = batch.remove(0);
    let contents = first
        .contents
        .ok_or_else(|| CodecError::ChunkError("first message has no contents".to_string()))?;
    let pieces = split_contents(&contents, chunk_size)?;
    let total_chunks = pieces.len();

    let mut chunks = Vec::with_capacity(total_chunks);
    for (i, piece) in pieces.into_iter().enumerate() {
        let chunk_id = i + 1;
        let is_final = chunk_id == total_chunks;
        let op = ChunkedOp {
            chunk_id,
            total_chunks,
            contents: piece,
            original_compression: if is_final { first.compression } else { None },
        };
        let serialized = serialize_chunk(&op)?;
        let metadata = if is_final { first.metadata.clone() } else { None };
        chunks.push(WireMessage::new(serialized, metadata));
    }

    let last = chunks
        .pop()
        .ok_or_else(|| CodecError::ChunkError("split produced no chunks".to_string()))?;
    batch.insert(0, last);
    Ok(SplitBatch { chunks, batch })
}

fn serialize_chunk(op: &ChunkedOp) -> Result<String, CodecError> {
    let contents =
        serde_json::to_value(op).map_err(|e| CodecError::SerializationError(e.to_string()))?;
    serde_json::to_string(&RuntimeMessage {
        message_type: MessageType::ChunkedOp,
        contents,
    })
    .map_err(|e| CodecError::SerializationError(e.to_string()))
}

/// Per-sender reassembly buffer.
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    parts: Vec<String>,
}

impl ChunkBuffer {
    /// Accept the next chunk. Returns the reassembled contents and their
    /// compression once the final chunk arrives.
    pub fn accept(
        &mut self,
        chunk: ChunkedOp,
    ) -> Result<Option<(String, Option<CompressionAlgorithm>)>, CodecError> {
        let expected = self.parts.len() + 1;
        if chunk.chunk_id != expected {
            return Err(CodecError::ChunkError(format!(
                "expected chunk {} but received chunk {} of {}",
                expected, chunk.chunk_id, chunk.total_chunks
            )));
        }
        let is_final = chunk.is_final();
        self.parts.push(chunk.contents);
        if is_final {
            let joined = std::mem::take(&mut self.parts).concat();
            Ok(Some((joined, chunk.original_compression)))
        } else {
            Ok(None)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::parse_runtime_message;
    use crate::message::MessageMetadata;

    #[test]
    fn test_split_contents_respects_char_boundaries() {
        let chunks = split_contents("ab\u{00e9}cd", 3).unwrap();
        assert_eq!(chunks, vec!["ab".to_string(), "\u{00e9}c".to_string(), "d".to_string()]);
        assert_eq!(chunks.concat(), "ab\u{00e9}cd");
    }

    #[test]
    fn test_split_contents_counts_escapes() {
        let quoted = "\"".repeat(10);
        let chunks = split_contents(&quoted, 4).unwrap();
        assert_eq!(chunks.len(), 5);
        for chunk in &chunks {
            assert!(serde_json::to_string(chunk).unwrap().len() <= 4 + 2);
        }
        let control = split_contents("a\u{1}b", 6).unwrap();
        assert_eq!(control, vec!["a".to_string(), "\u{1}".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_split_contents_empty_input() {
        assert_eq!(split_contents("", 4).unwrap(), vec![String::new()]);
        assert!(split_contents("abc", 0).is_err());
    }

    #[test]
    fn test_final_chunk_replaces_first_message() {
        let meta = MessageMetadata::default().with_field("blobId", serde_json::json!("b"));
        let batch = vec![
            WireMessage {
                contents: Some("0123456789".into()),
                metadata: Some(meta.clone()),
                compression: Some(CompressionAlgorithm::Deflate),
            },
            WireMessage::default(),
        ];
        let split = split_first_message(batch, 4).unwrap();
        assert_eq!(split.chunks.len(), 2);
        assert_eq!(split.batch.len(), 2);
        assert_eq!(split.batch[0].metadata, Some(meta));
        assert!(split.chunks[0].metadata.is_none());

        let (t, contents) =
            parse_runtime_message(split.batch[0].contents.as_ref().unwrap()).unwrap();
        assert_eq!(t, MessageType::ChunkedOp);
        let last: ChunkedOp = serde_json::from_value(contents).unwrap();
        assert!(last.is_final());
        assert_eq!(last.original_compression, Some(CompressionAlgorithm::Deflate));
    }

    #[test]
    fn test_chunk_buffer_reassembles_in_order() {
        let mut buffer = ChunkBuffer::default();
        let chunk = |id, text: &str| ChunkedOp {
            chunk_id: id,
            total_chunks: 2,
            contents: text.to_string(),
            original_compression: None,
        };
        assert!(buffer.accept(chunk(1, "he")).unwrap().is_none());
        let (joined, compression) = buffer.accept(chunk(2, "llo")).unwrap().unwrap();
        assert_eq!(joined, "hello");
        assert_eq!(compression, None);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_chunk_buffer_rejects_gap() {
        let mut buffer = ChunkBuffer::default();
        let err = buffer
            .accept(ChunkedOp {
                chunk_id: 2,
                total_chunks: 3,
                contents: String::new(),
                original_compression: None,
            })
            .unwrap_err();
        assert!(matches!(err, CodecError::ChunkError(_)));
    }
}
