//! Ordering of identifier allocation ahead of the ops that use it.
//!
//! Identifiers minted locally are only meaningful to other clients once
//! their creation range has been sequenced. The coordinator turns ranges
//! taken from the [`IdCompressor`] into `idAllocation` messages, which the
//! outbox flushes ahead of every other slot.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::handlers::HandlerError;
use crate::message::{LocalMessage, MessageType};

/// A contiguous range of identifiers created by one session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdCreationRange {
    pub session_id: Uuid,
    /// Generation count of the first id in the range.
    pub first_gen_count: u64,
    pub count: u64,
}

impl IdCreationRange {
    pub fn empty(session_id: Uuid) -> Self {
        Self {
            session_id,
            first_gen_count: 0,
            count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn last_gen_count(&self) -> Option<u64> {
        if self.is_empty() {
            None
        } else {
            Some(self.first_gen_count + self.count - 1)
        }
    }
}

/// The identifier-minting subsystem.
pub trait IdCompressor {
    /// Ids minted since the previous call.
    fn take_next_creation_range(&mut self) -> IdCreationRange;

    /// Every id minted locally and not yet finalized, as one range.
    fn take_unfinalized_creation_range(&mut self) -> IdCreationRange;

    /// Record a sequenced range from any session.
    fn finalize_creation_range(
        &mut self,
        range: &IdCreationRange,
    ) -> std::result::Result<(), HandlerError>;
}

/// Wraps an optional compressor; without one every call is a no-op.
#[derive(Default)]
pub struct IdAllocationCoordinator {
    compressor: Option<Box<dyn IdCompressor>>,
}

impl IdAllocationCoordinator {
    pub fn new(compressor: Option<Box<dyn IdCompressor>>) -> Self {
        Self { compressor }
    }

    pub fn is_enabled(&self) -> bool {
        self.compressor.is_some()
    }

    /// Allocation message for ids minted since the last one, if any.
    pub fn next_allocation(&mut self) -> Result<Option<LocalMessage>> {
        match self.compressor.as_mut() {
            Some(compressor) => allocation_message(compressor.take_next_creation_range()),
            None => Ok(None),
        }
    }

    /// One allocation covering every unfinalized id, submitted on reconnect
    /// before any replay.
    pub fn consolidated_allocation(&mut self) -> Result<Option<LocalMessage>> {
        match self.compressor.as_mut() {
            Some(compressor) => allocation_message(compressor.take_unfinalized_creation_range()),
            None => Ok(None),
        }
    }

    /// Finalize the range carried by a sequenced allocation message.
    pub fn process_allocation(&mut self, contents: &Value) -> Result<()> {
        let compressor = match self.compressor.as_mut() {
            Some(compressor) => compressor,
            None => {
                log::warn!("Received an id allocation op without an id compressor");
                return Ok(());
            }
        };
        let range: IdCreationRange = serde_json::from_value(contents.clone())?;
        compressor
            .finalize_creation_range(&range)
            .map_err(PipelineError::from)
    }
}

fn allocation_message(range: IdCreationRange) -> Result<Option<LocalMessage>> {
    if range.is_empty() {
        return Ok(None);
    }
    let contents = serde_json::to_value(&range)?;
    Ok(Some(LocalMessage::new(MessageType::IdAllocation, contents)))
}
