//! Grouped batching: several ops in one `groupedBatch` envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::CodecError;
use crate::message::wire::WireMessage;
use crate::message::{BatchId, MessageMetadata, MessageType, RuntimeMessage};

/// One op inside a grouped envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupedOp {
    pub contents: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
}

/// Contents of a `groupedBatch` runtime message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupedBatch {
    pub ops: Vec<GroupedOp>,
    /// Only set on the empty envelope sent for a fully squashed resubmission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
}

/// Wrap a batch into a single envelope message.
pub fn group_batch(batch: Vec<WireMessage>) -> Result<WireMessage, CodecError> {
    let ops = batch
        .into_iter()
        .map(|m| {
            if m.compression.is_some() {
                return Err(CodecError::FramingError(
                    "cannot group compressed messages".to_string(),
                ));
            }
            let contents = m.contents.ok_or_else(|| {
                CodecError::FramingError("cannot group a placeholder".to_string())
            })?;
            Ok(GroupedOp {
                contents,
                metadata: m.metadata.filter(|meta| !meta.is_empty()),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    envelope(GroupedBatch { ops, batch_id: None })
}

/// The envelope left behind when a resubmitted batch produced no ops, so
/// other copies of this container still observe its id.
pub fn empty_group(batch_id: BatchId) -> Result<WireMessage, CodecError> {
    envelope(GroupedBatch {
        ops: Vec::new(),
        batch_id: Some(batch_id),
    })
}

/// Parse the contents of a `groupedBatch` message.
pub fn ungroup(contents: Value) -> Result<GroupedBatch, CodecError> {
    serde_json::from_value(contents).map_err(|e| CodecError::SerializationError(e.to_string()))
}

fn envelope(group: GroupedBatch) -> Result<WireMessage, CodecError> {
    let contents =
        serde_json::to_value(&group).map_err(|e| CodecError::SerializationError(e.to_string()))?;
    let serialized = serde_json::to_string(&RuntimeMessage {
        message_type: MessageType::GroupedBatch,
        contents,
    })
    .map_err(|e| CodecError::SerializationError(e.to_string()))?;
    Ok(WireMessage::new(serialized, None))
}
