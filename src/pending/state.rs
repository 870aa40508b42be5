//! Pending ledger records and their persisted form.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::parse_runtime_message;
use crate::error::{PipelineError, Result};
use crate::message::{
    BatchId, ClientSequenceNumber, LocalMessage, MessageMetadata, MessageType, SequenceNumber,
};

/// Where a message sits within its batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BatchPosition {
    Single,
    Start,
    Middle,
    End,
}

impl BatchPosition {
    pub fn for_index(index: usize, length: usize) -> Self {
        if length <= 1 {
            BatchPosition::Single
        } else if index == 0 {
            BatchPosition::Start
        } else if index + 1 == length {
            BatchPosition::End
        } else {
            BatchPosition::Middle
        }
    }

    pub fn starts_batch(&self) -> bool {
        matches!(self, BatchPosition::Single | BatchPosition::Start)
    }

    pub fn ends_batch(&self) -> bool {
        matches!(self, BatchPosition::Single | BatchPosition::End)
    }
}

/// Batch membership shared by every entry of one flushed batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchInfo {
    /// Sender at flush time; `None` if the batch was only queued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_start_csn: Option<ClientSequenceNumber>,
    pub length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
    #[serde(default)]
    pub staged: bool,
}

/// A flushed message awaiting acknowledgment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMessage {
    pub message_type: MessageType,
    /// Serialized runtime message, exactly as sent.
    pub content: String,
    pub reference_sequence_number: SequenceNumber,
    #[serde(skip)]
    pub local_op_metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_metadata: Option<MessageMetadata>,
    pub batch_info: BatchInfo,
    pub position: BatchPosition,
    /// Stands in for a resubmitted batch that produced no ops.
    #[serde(default)]
    pub empty_batch: bool,
}

impl PendingMessage {
    pub fn is_staged(&self) -> bool {
        self.batch_info.staged
    }

    /// Rebuild the op so its handler can resubmit, roll back or reapply it.
    /// Wire framing (`batch` flags, batch id) is stripped; the outbox
    /// stamps it again.
    pub fn to_local_message(&self) -> Result<LocalMessage> {
        let (message_type, contents) = parse_runtime_message(&self.content)?;
        if message_type != self.message_type {
            return Err(PipelineError::PendingMismatch {
                client_sequence_number: self.batch_info.batch_start_csn,
                reason: format!(
                    "recorded type {} but content holds {}",
                    self.message_type, message_type
                ),
            });
        }

        let metadata = self.op_metadata.clone().and_then(|mut m| {
            m.batch = None;
            m.batch_id = None;
            if m.is_empty() {
                None
            } else {
                Some(m)
            }
        });

        Ok(LocalMessage {
            message_type,
            contents,
            local_op_metadata: self.local_op_metadata.clone(),
            metadata,
            reference_sequence_number: self.reference_sequence_number,
            staged: self.batch_info.staged,
        })
    }
}

/// Persisted pending state, read back verbatim on reload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingLocalState {
    pub pending_states: Vec<PendingMessage>,
}

impl PendingLocalState {
    pub fn is_empty(&self) -> bool {
        self.pending_states.is_empty()
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| PipelineError::SerializationError(e.to_string()))?;
        Ok(buf)
    }

    pub fn from_cbor(data: &[u8]) -> Result<Self> {
        ciborium::from_reader(data).map_err(|e| PipelineError::SerializationError(e.to_string()))
    }
}
