//! Message model shared by every stage of the pipeline.
//!
//! A [`LocalMessage`] is what callers submit. On the way out it is rendered
//! into [`wire::WireMessage`]s; on the way back in the codec layer turns
//! sequenced wire messages into [`wire::InboundBatch`]es.

pub mod wire;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PipelineError;
use crate::handlers::HandlerCategory;

/// Position assigned by the ordering service.
pub type SequenceNumber = i64;

/// Per-client counter assigned by the transport at send time.
pub type ClientSequenceNumber = i64;

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// Logical type of a runtime message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "op")]
    Operation,
    #[serde(rename = "attach")]
    Attach,
    #[serde(rename = "alias")]
    Alias,
    #[serde(rename = "blobAttach")]
    BlobAttach,
    #[serde(rename = "idAllocation")]
    IdAllocation,
    #[serde(rename = "schema")]
    SchemaChange,
    #[serde(rename = "GC")]
    Gc,
    #[serde(rename = "rejoin")]
    Rejoin,
    /// Envelope wrapping several ops into one wire message.
    #[serde(rename = "groupedBatch")]
    GroupedBatch,
    /// One piece of a message too large for a single send.
    #[serde(rename = "chunkedOp")]
    ChunkedOp,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Operation => "op",
            MessageType::Attach => "attach",
            MessageType::Alias => "alias",
            MessageType::BlobAttach => "blobAttach",
            MessageType::IdAllocation => "idAllocation",
            MessageType::SchemaChange => "schema",
            MessageType::Gc => "GC",
            MessageType::Rejoin => "rejoin",
            MessageType::GroupedBatch => "groupedBatch",
            MessageType::ChunkedOp => "chunkedOp",
        }
    }

    /// Handler category responsible for resubmit and rollback.
    ///
    /// Codec envelopes have no category: they never reach a handler.
    pub fn category(&self) -> Option<HandlerCategory> {
        match self {
            MessageType::Operation
            | MessageType::Attach
            | MessageType::Alias
            | MessageType::Rejoin => Some(HandlerCategory::DocumentOps),
            MessageType::BlobAttach => Some(HandlerCategory::BlobAttach),
            MessageType::IdAllocation => Some(HandlerCategory::IdAllocation),
            MessageType::SchemaChange => Some(HandlerCategory::SchemaChange),
            MessageType::Gc => Some(HandlerCategory::Gc),
            MessageType::GroupedBatch | MessageType::ChunkedOp => None,
        }
    }

    /// Whether submitting this type makes the document dirty.
    pub fn is_dirtyable(&self) -> bool {
        matches!(
            self,
            MessageType::Operation
                | MessageType::Attach
                | MessageType::Alias
                | MessageType::BlobAttach
                | MessageType::Rejoin
        )
    }

    /// Types that may be submitted while staging is active.
    pub fn allowed_while_staged(&self) -> bool {
        matches!(
            self,
            MessageType::Operation | MessageType::Gc | MessageType::SchemaChange
        )
    }

    /// Codec envelopes produced by the pipeline itself.
    pub fn is_internal(&self) -> bool {
        matches!(self, MessageType::GroupedBatch | MessageType::ChunkedOp)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "op" => Ok(MessageType::Operation),
            "attach" => Ok(MessageType::Attach),
            "alias" => Ok(MessageType::Alias),
            "blobAttach" => Ok(MessageType::BlobAttach),
            "idAllocation" => Ok(MessageType::IdAllocation),
            "schema" => Ok(MessageType::SchemaChange),
            "GC" => Ok(MessageType::Gc),
            "rejoin" => Ok(MessageType::Rejoin),
            "groupedBatch" => Ok(MessageType::GroupedBatch),
            "chunkedOp" => Ok(MessageType::ChunkedOp),
            other => Err(PipelineError::UnknownMessageType(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Batch identity
// ---------------------------------------------------------------------------

/// Stable identity of a batch once it has been sent.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    /// Derive the id of a freshly sent batch from its sender and the client
    /// sequence number of its first message.
    pub fn generate(client_id: &str, batch_start_csn: ClientSequenceNumber) -> Self {
        BatchId(format!("{}_[{}]", client_id, batch_start_csn))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for BatchId {
    fn from(s: &str) -> Self {
        BatchId(s.to_string())
    }
}

impl From<String> for BatchId {
    fn from(s: String) -> Self {
        BatchId(s)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Metadata and messages
// ---------------------------------------------------------------------------

/// Metadata visible on the wire.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    /// `Some(true)` opens a multi-message batch, `Some(false)` closes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<bool>,
    /// Explicit id carried by resubmitted batches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageMetadata {
    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_none() && self.batch_id.is_none() && self.extra.is_empty()
    }
}

/// The `{type, contents}` envelope every op is serialized as.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuntimeMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub contents: Value,
}

impl RuntimeMessage {
    pub fn to_json(&self) -> Result<String, PipelineError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One op submitted by a subsystem.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalMessage {
    pub message_type: MessageType,
    pub contents: Value,
    /// Local-only bookkeeping. Never serialized.
    pub local_op_metadata: Option<Value>,
    pub metadata: Option<MessageMetadata>,
    pub reference_sequence_number: SequenceNumber,
    pub staged: bool,
}

impl LocalMessage {
    pub fn new(message_type: MessageType, contents: Value) -> Self {
        Self {
            message_type,
            contents,
            local_op_metadata: None,
            metadata: None,
            reference_sequence_number: 0,
            staged: false,
        }
    }

    pub fn with_local_metadata(mut self, local_op_metadata: Value) -> Self {
        self.local_op_metadata = Some(local_op_metadata);
        self
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_reference_sequence_number(mut self, reference_sequence_number: SequenceNumber) -> Self {
        self.reference_sequence_number = reference_sequence_number;
        self
    }

    pub fn staged(mut self, staged: bool) -> Self {
        self.staged = staged;
        self
    }

    /// Serialized form that goes on the wire and into the pending ledger.
    pub fn serialized_contents(&self) -> Result<String, PipelineError> {
        RuntimeMessage {
            message_type: self.message_type,
            contents: self.contents.clone(),
        }
        .to_json()
    }

    /// Blob attach messages must name the blob they attach.
    pub fn has_blob_metadata(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.extra.get("blobId"))
            .map(|v| v.is_string())
            .unwrap_or(false)
    }
}
