//! Staging mode policy.
//!
//! While staging, submitted ops are recorded in the pending ledger as staged
//! batches and never sent. Commit replays them for real; discard rolls them
//! back. This controller only holds the state machine and its checks; the
//! runtime drives the flushes, replays and rollbacks.

use crate::error::{PipelineError, Result};
use crate::message::{MessageType, SequenceNumber};

/// The live staging session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagingSession {
    /// Last processed sequence number when staging began.
    pub entered_at: SequenceNumber,
    /// Staged batches flushed into the pending ledger so far.
    pub staged_batches: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum StagingState {
    #[default]
    Idle,
    Staging(StagingSession),
}

#[derive(Debug, Default)]
pub struct StagingController {
    state: StagingState,
}

impl StagingController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_staging(&self) -> bool {
        matches!(self.state, StagingState::Staging(_))
    }

    pub fn session(&self) -> Option<&StagingSession> {
        match &self.state {
            StagingState::Staging(session) => Some(session),
            StagingState::Idle => None,
        }
    }

    /// Checks that must pass before the runtime flushes and enters.
    pub fn check_can_enter(&self, attached: bool, in_sequential_scope: bool) -> Result<()> {
        if self.is_staging() {
            return Err(PipelineError::AlreadyStaging);
        }
        if !attached {
            return Err(PipelineError::Detached);
        }
        if in_sequential_scope {
            return Err(PipelineError::StagingInsideSequentialScope);
        }
        Ok(())
    }

    pub fn enter(&mut self, entered_at: SequenceNumber) {
        log::debug!("Entering staging mode at sequence number {}", entered_at);
        self.state = StagingState::Staging(StagingSession {
            entered_at,
            staged_batches: 0,
        });
    }

    pub fn check_can_exit(&self, in_sequential_scope: bool) -> Result<()> {
        if !self.is_staging() {
            return Err(PipelineError::NotStaging);
        }
        if in_sequential_scope {
            return Err(PipelineError::StagingInsideSequentialScope);
        }
        Ok(())
    }

    /// Leave staging, returning the finished session.
    pub fn exit(&mut self) -> Result<StagingSession> {
        match std::mem::take(&mut self.state) {
            StagingState::Staging(session) => {
                log::debug!(
                    "Leaving staging mode after {} staged batches",
                    session.staged_batches
                );
                Ok(session)
            }
            StagingState::Idle => Err(PipelineError::NotStaging),
        }
    }

    /// Reject message types that may not be staged.
    pub fn check_allowed(&self, message_type: MessageType) -> Result<()> {
        if self.is_staging() && !message_type.allowed_while_staged() {
            return Err(PipelineError::DisallowedWhileStaged(message_type));
        }
        Ok(())
    }

    pub fn record_staged_batch(&mut self) {
        if let StagingState::Staging(session) = &mut self.state {
            session.staged_batches += 1;
        }
    }
}
