//! Per-subsystem hooks for stashed-op application, resubmission and rollback.
//!
//! Each owning subsystem registers one [`MessageHandler`] per
//! [`HandlerCategory`] when the runtime is built. The pending state manager
//! and the runtime dispatch through the table by the message's category.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use crate::error::{PipelineError, Result};
use crate::message::LocalMessage;

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// Which subsystem owns a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HandlerCategory {
    DocumentOps,
    BlobAttach,
    SchemaChange,
    Gc,
    IdAllocation,
}

/// Channel a handler uses to put regenerated ops back into the outbox.
pub trait Submitter {
    fn submit(&mut self, message: LocalMessage) -> Result<()>;
}

pub trait MessageHandler {
    /// Apply an op restored from persisted pending state. Returns fresh
    /// local metadata for the pending entry.
    fn apply_stashed_op(&mut self, message: &LocalMessage)
        -> std::result::Result<Option<Value>, HandlerError>;

    /// Regenerate an unacknowledged op against the current document state.
    /// `squash` allows coalescing staged edits; ignoring it is valid.
    fn resubmit(
        &mut self,
        message: LocalMessage,
        squash: bool,
        submitter: &mut dyn Submitter,
    ) -> Result<()>;

    /// Undo the local effect of an op that will never be sent.
    fn rollback(&mut self, message: &LocalMessage) -> std::result::Result<(), HandlerError>;
}

/// Handler per category, injected at construction.
#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<HandlerCategory, Box<dyn MessageHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, category: HandlerCategory, handler: Box<dyn MessageHandler>) -> Self {
        self.register(category, handler);
        self
    }

    pub fn register(&mut self, category: HandlerCategory, handler: Box<dyn MessageHandler>) {
        self.handlers.insert(category, handler);
    }

    pub fn contains(&self, category: HandlerCategory) -> bool {
        self.handlers.contains_key(&category)
    }

    pub fn get_mut(&mut self, category: HandlerCategory) -> Result<&mut dyn MessageHandler> {
        match self.handlers.get_mut(&category) {
            Some(handler) => Ok(handler.as_mut()),
            None => Err(PipelineError::NoHandler(category)),
        }
    }

    /// Handler for a message, by its type's category.
    pub fn for_message(&mut self, message: &LocalMessage) -> Result<&mut dyn MessageHandler> {
        let category = message
            .message_type
            .category()
            .ok_or(PipelineError::InternalMessageType(message.message_type))?;
        self.get_mut(category)
    }
}
