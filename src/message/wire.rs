//! Wire-level shapes: what the transport carries out and brings back.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{BatchId, ClientSequenceNumber, MessageMetadata, MessageType, SequenceNumber};
use crate::codec::compressor::CompressionAlgorithm;

/// One outbound message after the codec layer has run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    /// Serialized runtime message. `None` marks a placeholder whose contents
    /// travel packed inside the first message of a compressed batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionAlgorithm>,
}

impl WireMessage {
    pub fn new(contents: String, metadata: Option<MessageMetadata>) -> Self {
        Self {
            contents: Some(contents),
            metadata,
            compression: None,
        }
    }

    pub fn content_size(&self) -> usize {
        self.contents.as_ref().map(|c| c.len()).unwrap_or(0)
    }

    /// Set the batch framing flag, creating metadata when absent.
    pub fn set_batch_flag(&mut self, flag: bool) {
        self.metadata.get_or_insert_with(MessageMetadata::default).batch = Some(flag);
    }

    pub fn batch_flag(&self) -> Option<bool> {
        self.metadata.as_ref().and_then(|m| m.batch)
    }
}

/// Total payload size of a wire batch.
pub fn content_size(messages: &[WireMessage]) -> usize {
    messages.iter().map(WireMessage::content_size).sum()
}

/// A wire message as delivered back by the ordering service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencedWireMessage {
    pub client_id: String,
    pub sequence_number: SequenceNumber,
    pub minimum_sequence_number: SequenceNumber,
    pub client_sequence_number: ClientSequenceNumber,
    pub reference_sequence_number: SequenceNumber,
    pub message: WireMessage,
}

/// One op recovered from the inbound stream.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundMessage {
    pub message_type: MessageType,
    pub contents: Value,
    /// Exact serialized form, compared against the pending ledger.
    pub raw_contents: String,
    pub metadata: Option<MessageMetadata>,
    pub client_sequence_number: ClientSequenceNumber,
    pub sequence_number: SequenceNumber,
}

/// A complete inbound batch, reassembled from chunks, packed contents and
/// grouped envelopes.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundBatch {
    pub client_id: String,
    pub batch_start_csn: ClientSequenceNumber,
    /// Explicit id stamped by a resubmission, if any.
    pub explicit_batch_id: Option<BatchId>,
    /// Sequence number of the first message of the batch.
    pub sequence_number: SequenceNumber,
    pub minimum_sequence_number: SequenceNumber,
    pub reference_sequence_number: SequenceNumber,
    /// Empty only for the empty grouped batch a resubmission leaves behind.
    pub messages: Vec<InboundMessage>,
}

impl InboundBatch {
    /// The explicit id if present, otherwise the id derived from the sender.
    pub fn batch_id(&self) -> BatchId {
        self.explicit_batch_id
            .clone()
            .unwrap_or_else(|| BatchId::generate(&self.client_id, self.batch_start_csn))
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(explicit: Option<&str>) -> InboundBatch {
        InboundBatch {
            client_id: "c1".into(),
            batch_start_csn: 4,
            explicit_batch_id: explicit.map(BatchId::from),
            sequence_number: 10,
            minimum_sequence_number: 1,
            reference_sequence_number: 9,
            messages: vec![],
        }
    }

    #[test]
    fn test_effective_batch_id() {
        assert_eq!(batch(None).batch_id().as_str(), "c1_[4]");
        assert_eq!(batch(Some("old_[2]")).batch_id().as_str(), "old_[2]");
    }

    #[test]
    fn test_batch_flag_creates_metadata() {
        let mut msg = WireMessage::new("x".into(), None);
        assert_eq!(msg.batch_flag(), None);
        msg.set_batch_flag(true);
        assert_eq!(msg.batch_flag(), Some(true));
        assert_eq!(content_size(&[msg.clone(), WireMessage::default()]), 1);
    }
}
