//! Inbound side of the codec layer.
//!
//! [`RemoteMessageProcessor`] consumes sequenced wire messages one at a time
//! and yields complete [`InboundBatch`]es: chunks are reassembled per
//! sender, packed batches are unpacked into their placeholders, grouped
//! envelopes are opened, and `batch` begin/end flags are tracked across
//! messages.

use std::collections::{HashMap, VecDeque};

use super::compressor::decompress_contents;
use super::grouping::ungroup;
use super::splitter::{ChunkBuffer, ChunkedOp};
use super::{parse_runtime_message, CodecError};
use crate::message::wire::{InboundBatch, InboundMessage, SequencedWireMessage};
use crate::message::{MessageMetadata, MessageType};

#[derive(Debug, Default)]
pub struct RemoteMessageProcessor {
    chunks: HashMap<String, ChunkBuffer>,
    /// Contents unpacked from a compressed message, awaiting placeholders.
    unpacked: VecDeque<String>,
    current: Option<InboundBatch>,
}

impl RemoteMessageProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one sequenced message. Returns a batch once it is complete.
    pub fn process(
        &mut self,
        sequenced: SequencedWireMessage,
    ) -> Result<Option<InboundBatch>, CodecError> {
        let SequencedWireMessage {
            client_id,
            sequence_number,
            minimum_sequence_number,
            client_sequence_number,
            reference_sequence_number,
            message: mut wire,
        } = sequenced;

        // Chunks
        if let Some(raw) = wire.contents.as_deref() {
            if let Some(chunk) = as_chunk(raw)? {
                let buffer = self.chunks.entry(client_id.clone()).or_default();
                match buffer.accept(chunk)? {
                    None => return Ok(None),
                    Some((joined, compression)) => {
                        self.chunks.remove(&client_id);
                        wire.contents = Some(joined);
                        wire.compression = compression;
                    }
                }
            }
        }

        // Packed contents and placeholders
        let raw = match (wire.compression, wire.contents) {
            (Some(algorithm), Some(packed)) => {
                if !self.unpacked.is_empty() {
                    return Err(CodecError::FramingError(
                        "compressed message arrived before previous placeholders".to_string(),
                    ));
                }
                let mut all: VecDeque<String> = decompress_contents(&packed, algorithm)?.into();
                let first = all.pop_front().ok_or_else(|| {
                    CodecError::DecompressionError("packed batch is empty".to_string())
                })?;
                self.unpacked = all;
                first
            }
            (None, Some(raw)) => raw,
            (_, None) => self.unpacked.pop_front().ok_or_else(|| {
                CodecError::FramingError("placeholder without a compressed batch".to_string())
            })?,
        };

        let (message_type, contents) = parse_runtime_message(&raw)?;
        let batch_flag = wire.metadata.as_ref().and_then(|m| m.batch);

        if message_type == MessageType::GroupedBatch {
            if self.current.is_some() {
                return Err(CodecError::FramingError(
                    "grouped batch inside an open batch".to_string(),
                ));
            }
            let group = ungroup(contents)?;
            let mut messages = Vec::with_capacity(group.ops.len());
            for op in group.ops {
                let (message_type, contents) = parse_runtime_message(&op.contents)?;
                messages.push(InboundMessage {
                    message_type,
                    contents,
                    raw_contents: op.contents,
                    metadata: op.metadata,
                    client_sequence_number,
                    sequence_number,
                });
            }
            let explicit_batch_id = group
                .batch_id
                .or_else(|| first_batch_id(messages.first().and_then(|m| m.metadata.as_ref())));
            return Ok(Some(InboundBatch {
                client_id,
                batch_start_csn: client_sequence_number,
                explicit_batch_id,
                sequence_number,
                minimum_sequence_number,
                reference_sequence_number,
                messages,
            }));
        }

        let message = InboundMessage {
            message_type,
            contents,
            raw_contents: raw,
            metadata: wire.metadata,
            client_sequence_number,
            sequence_number,
        };

        match (batch_flag, self.current.as_mut()) {
            (Some(true), Some(_)) => Err(CodecError::FramingError(
                "batch start inside an open batch".to_string(),
            )),
            (Some(true), None) => {
                self.current = Some(InboundBatch {
                    client_id,
                    batch_start_csn: client_sequence_number,
                    explicit_batch_id: first_batch_id(message.metadata.as_ref()),
                    sequence_number,
                    minimum_sequence_number,
                    reference_sequence_number,
                    messages: vec![message],
                });
                Ok(None)
            }
            (Some(false), None) => Err(CodecError::FramingError(
                "batch end without a batch start".to_string(),
            )),
            (flag, Some(current)) => {
                if current.client_id != client_id {
                    return Err(CodecError::FramingError(format!(
                        "message from {} interleaved with open batch from {}",
                        client_id, current.client_id
                    )));
                }
                current.messages.push(message);
                current.minimum_sequence_number = minimum_sequence_number;
                if flag == Some(false) {
                    if !self.unpacked.is_empty() {
                        return Err(CodecError::FramingError(format!(
                            "batch ended with {} unclaimed packed messages",
                            self.unpacked.len()
                        )));
                    }
                    Ok(self.current.take())
                } else {
                    Ok(None)
                }
            }
            (None, None) => {
                if !self.unpacked.is_empty() {
                    return Err(CodecError::FramingError(
                        "single message left packed contents unclaimed".to_string(),
                    ));
                }
                Ok(Some(InboundBatch {
                    client_id,
                    batch_start_csn: client_sequence_number,
                    explicit_batch_id: first_batch_id(message.metadata.as_ref()),
                    sequence_number,
                    minimum_sequence_number,
                    reference_sequence_number,
                    messages: vec![message],
                }))
            }
        }
    }

    /// Whether a multi-message batch is still open.
    pub fn in_batch(&self) -> bool {
        self.current.is_some()
    }
}

fn as_chunk(raw: &str) -> Result<Option<ChunkedOp>, CodecError> {
    // Cheap pre-check before parsing potentially large contents.
    if !raw.contains("\"chunkedOp\"") {
        return Ok(None);
    }
    let (message_type, contents) = parse_runtime_message(raw)?;
    if message_type != MessageType::ChunkedOp {
        return Ok(None);
    }
    serde_json::from_value(contents)
        .map(Some)
        .map_err(|e| CodecError::ChunkError(e.to_string()))
}

fn first_batch_id(metadata: Option<&MessageMetadata>) -> Option<crate::message::BatchId> {
    metadata.and_then(|m| m.batch_id.clone())
}
