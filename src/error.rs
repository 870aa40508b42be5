//! Pipeline error taxonomy.
//!
//! Errors fall into two classes. Policy errors reject a single call and leave
//! every structure untouched. Fatal errors close the runtime: once one has
//! been routed through the close channel the runtime refuses further work.

use thiserror::Error;

use crate::codec::CodecError;
use crate::handlers::{HandlerCategory, HandlerError};
use crate::message::{BatchId, ClientSequenceNumber, MessageType, SequenceNumber};
use crate::persistence::PersistenceError;
use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    // -- policy ---------------------------------------------------------------
    #[error("Already in staging mode")]
    AlreadyStaging,

    #[error("Cannot enter staging mode while detached")]
    Detached,

    #[error("Not in staging mode")]
    NotStaging,

    #[error("Message type {0} is not allowed while staged")]
    DisallowedWhileStaged(MessageType),

    #[error("Cannot flush inside a sequential scope")]
    FlushInsideSequentialScope,

    #[error("Cannot change staging mode inside a sequential scope")]
    StagingInsideSequentialScope,

    #[error("Blob attach message is missing its blob metadata")]
    MissingBlobMetadata,

    #[error("Message type {0} cannot be submitted directly")]
    InternalMessageType(MessageType),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // -- fatal ----------------------------------------------------------------
    #[error("Flush of {message_count} messages at reference sequence number {reference_sequence_number} failed: {source}")]
    FlushFailed {
        message_count: usize,
        reference_sequence_number: SequenceNumber,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("Resubmission of pending batch failed: {0}")]
    ResubmitFailed(String),

    #[error("Rollback failed: {0}")]
    RollbackFailed(String),

    #[error("Forked container: remote batch {batch_id} matches a pending local batch")]
    ForkedContainer { batch_id: BatchId },

    #[error("Duplicate batch {batch_id} at sequence number {sequence_number} (first seen at {other_sequence_number})")]
    DuplicateBatch {
        batch_id: BatchId,
        sequence_number: SequenceNumber,
        other_sequence_number: SequenceNumber,
    },

    #[error("Gave up after {attempts} consecutive reconnects with {pending_count} pending messages")]
    TooManyReconnects { attempts: u32, pending_count: usize },

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Flush called while another flush is in progress")]
    ReentrantFlush,

    #[error("Reference sequence number changed inside a sequential scope: expected {expected}, got {actual}")]
    ReferenceSequenceNumberMismatch {
        expected: SequenceNumber,
        actual: SequenceNumber,
    },

    #[error("Batch of {size} bytes exceeds the maximum of {max} bytes")]
    BatchTooLarge { size: usize, max: usize },

    #[error("Pending state mismatch at client sequence number {client_sequence_number:?}: {reason}")]
    PendingMismatch {
        client_sequence_number: Option<ClientSequenceNumber>,
        reason: String,
    },

    #[error("No handler registered for {0:?}")]
    NoHandler(HandlerCategory),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Codec error: {0}")]
    Codec(CodecError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Runtime is closed: {0}")]
    Closed(String),
}

impl PipelineError {
    /// Whether this error must close the runtime.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PipelineError::AlreadyStaging
                | PipelineError::Detached
                | PipelineError::NotStaging
                | PipelineError::DisallowedWhileStaged(_)
                | PipelineError::FlushInsideSequentialScope
                | PipelineError::StagingInsideSequentialScope
                | PipelineError::MissingBlobMetadata
                | PipelineError::InternalMessageType(_)
                | PipelineError::InvalidConfig(_)
                | PipelineError::Closed(_)
        )
    }
}

impl From<CodecError> for PipelineError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::UnknownMessageType(t) => PipelineError::UnknownMessageType(t),
            other => PipelineError::Codec(other),
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::SerializationError(err.to_string())
    }
}
