//! Pending State Manager: the ledger of local work not yet acknowledged by
//! the ordering service.
//!
//! Every flushed batch lands here, sent or not. Local acknowledgments retire
//! entries from the front in order. Reconnects and staging commits replay
//! entries through a [`ReplayTarget`]; staging discards pop them from the
//! back.
//!
//! Staged entries always sit behind every non-staged entry: staging begins
//! with an empty outbox, and a replay that leaves staged batches in place
//! re-appends them after the resubmitted ones.

pub mod state;

use std::collections::VecDeque;

use serde_json::Value;

use crate::error::{PipelineError, Result};
use crate::handlers::{HandlerCategory, HandlerTable};
use crate::message::wire::{InboundBatch, InboundMessage};
use crate::message::{BatchId, LocalMessage, MessageType, SequenceNumber};
use crate::outbox::{FlushedBatch, ResubmitInfo};

pub use state::{BatchInfo, BatchPosition, PendingLocalState, PendingMessage};

/// Options for [`PendingStateManager::replay_pending_states`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplayOptions {
    /// Replay only staged batches instead of only non-staged ones.
    pub committing_staged_batches: bool,
    /// Passed through to handlers.
    pub squash: bool,
}

/// Where replayed ops go.
pub trait ReplayTarget {
    /// Hand one op to its handler for resubmission.
    fn resubmit(&mut self, message: LocalMessage, squash: bool) -> Result<()>;

    /// Flush whatever the resubmitted batch produced.
    fn flush(&mut self, resubmit_info: ResubmitInfo) -> Result<Vec<FlushedBatch>>;
}

/// An inbound message after ledger processing.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessedMessage {
    pub message: InboundMessage,
    pub local: bool,
    /// Local metadata recorded at submit time, for local acks.
    pub local_op_metadata: Option<Value>,
}

#[derive(Debug, Default)]
pub struct PendingStateManager {
    pending: VecDeque<PendingMessage>,
    /// Restored from persisted state and not yet reapplied.
    stashed: VecDeque<PendingMessage>,
    /// Leading `pending` entries reapplied from the stash. While the stash
    /// is not empty these are older than it, and everything behind them is
    /// newer.
    restored: usize,
    disposed: bool,
}

impl PendingStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rehydrate from persisted state. Entries stay stashed until
    /// [`apply_stashed_ops_at`](Self::apply_stashed_ops_at) reapplies them.
    pub fn from_local_state(state: PendingLocalState) -> Self {
        Self {
            pending: VecDeque::new(),
            stashed: state.pending_states.into(),
            restored: 0,
            disposed: false,
        }
    }

    pub fn has_pending_messages(&self) -> bool {
        !self.pending.is_empty() || !self.stashed.is_empty()
    }

    pub fn pending_message_count(&self) -> usize {
        self.pending.len() + self.stashed.len()
    }

    pub fn has_staged_messages(&self) -> bool {
        self.pending.iter().any(PendingMessage::is_staged)
    }

    pub fn minimum_pending_reference_sequence_number(&self) -> Option<SequenceNumber> {
        self.pending
            .iter()
            .chain(self.stashed.iter())
            .map(|m| m.reference_sequence_number)
            .min()
    }

    pub fn pending_messages(&self) -> impl Iterator<Item = &PendingMessage> {
        self.pending.iter()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Drop everything without invoking any handler.
    pub fn dispose(&mut self) {
        self.pending.clear();
        self.stashed.clear();
        self.restored = 0;
        self.disposed = true;
    }

    // -----------------------------------------------------------------------
    // Flush bookkeeping
    // -----------------------------------------------------------------------

    /// Record a flushed batch, sent or only queued.
    pub fn on_flush_batch(&mut self, batch: FlushedBatch) {
        let FlushedBatch {
            messages,
            reference_sequence_number,
            staged,
            client_id,
            batch_start_csn,
            batch_id,
            ..
        } = batch;

        if messages.is_empty() {
            // Only the empty grouped batch of a squashed resubmission has an
            // ack to wait for.
            if batch_id.is_some() && batch_start_csn.is_some() {
                self.pending.push_back(PendingMessage {
                    message_type: MessageType::GroupedBatch,
                    content: String::new(),
                    reference_sequence_number,
                    local_op_metadata: None,
                    op_metadata: None,
                    batch_info: BatchInfo {
                        client_id,
                        batch_start_csn,
                        length: 0,
                        batch_id,
                        staged,
                    },
                    position: BatchPosition::Single,
                    empty_batch: true,
                });
            }
            return;
        }

        let length = messages.len();
        for (index, flushed) in messages.into_iter().enumerate() {
            self.pending.push_back(PendingMessage {
                message_type: flushed.message.message_type,
                content: flushed.content,
                reference_sequence_number,
                local_op_metadata: flushed.message.local_op_metadata,
                op_metadata: flushed.message.metadata,
                batch_info: BatchInfo {
                    client_id: client_id.clone(),
                    batch_start_csn,
                    length,
                    batch_id: batch_id.clone(),
                    staged,
                },
                position: BatchPosition::for_index(index, length),
                empty_batch: false,
            });
        }
    }

    // -----------------------------------------------------------------------
    // Inbound processing
    // -----------------------------------------------------------------------

    /// Process a sequenced batch. Local batches retire pending entries;
    /// remote batches are checked against pending batch ids for a fork.
    pub fn process_inbound_messages(
        &mut self,
        batch: &InboundBatch,
        local: bool,
    ) -> Result<Vec<ProcessedMessage>> {
        if local {
            return self.process_local_batch(batch);
        }

        let batch_id = batch.batch_id();
        if self.has_pending_batch_id(&batch_id) {
            return Err(PipelineError::ForkedContainer { batch_id });
        }
        Ok(batch
            .messages
            .iter()
            .cloned()
            .map(|message| ProcessedMessage {
                message,
                local: false,
                local_op_metadata: None,
            })
            .collect())
    }

    fn has_pending_batch_id(&self, batch_id: &BatchId) -> bool {
        self.pending
            .iter()
            .any(|m| m.batch_info.batch_id.as_ref() == Some(batch_id))
    }

    fn process_local_batch(&mut self, batch: &InboundBatch) -> Result<Vec<ProcessedMessage>> {
        let mismatch = |reason: String| PipelineError::PendingMismatch {
            client_sequence_number: Some(batch.batch_start_csn),
            reason,
        };

        if batch.messages.is_empty() {
            let entry = self
                .pop_front()
                .ok_or_else(|| mismatch("empty local batch with nothing pending".to_string()))?;
            if !entry.empty_batch {
                return Err(mismatch(
                    "empty local batch does not match pending entry".to_string(),
                ));
            }
            return Ok(Vec::new());
        }

        let mut processed = Vec::with_capacity(batch.messages.len());
        for (index, message) in batch.messages.iter().enumerate() {
            let entry = self.pop_front().ok_or_else(|| {
                mismatch(format!("no pending entry for local message {}", index))
            })?;

            if entry.empty_batch || entry.is_staged() {
                return Err(mismatch(format!(
                    "local message {} matched a {} entry",
                    index,
                    if entry.empty_batch { "placeholder" } else { "staged" }
                )));
            }
            if entry.content != message.raw_contents {
                return Err(mismatch(format!(
                    "content of local message {} differs from pending entry",
                    index
                )));
            }
            if index == 0 {
                if !entry.position.starts_batch() || entry.batch_info.length != batch.messages.len()
                {
                    return Err(mismatch(format!(
                        "batch of {} messages does not line up with pending batch of {}",
                        batch.messages.len(),
                        entry.batch_info.length
                    )));
                }
                if let Some(expected) = entry.batch_info.batch_start_csn {
                    if expected != batch.batch_start_csn {
                        return Err(mismatch(format!(
                            "pending batch started at client sequence number {}",
                            expected
                        )));
                    }
                }
            }

            processed.push(ProcessedMessage {
                message: message.clone(),
                local: true,
                local_op_metadata: entry.local_op_metadata,
            });
        }
        Ok(processed)
    }

    fn pop_front(&mut self) -> Option<PendingMessage> {
        let entry = self.pending.pop_front()?;
        self.restored = self.restored.saturating_sub(1);
        Some(entry)
    }

    // -----------------------------------------------------------------------
    // Replay
    // -----------------------------------------------------------------------

    /// Resubmit pending batches in original order.
    ///
    /// Id allocation entries are dropped: the caller submits one
    /// consolidated range before replaying. On failure the batch being
    /// replayed and everything behind it go back into the ledger unchanged.
    pub fn replay_pending_states(
        &mut self,
        options: ReplayOptions,
        target: &mut dyn ReplayTarget,
    ) -> Result<()> {
        if self.disposed {
            return Ok(());
        }

        let mut queue = std::mem::take(&mut self.pending);
        self.restored = 0;
        let mut batches = Vec::new();
        loop {
            match take_batch(&mut queue) {
                Ok(Some(batch)) => batches.push(batch),
                Ok(None) => break,
                Err(e) => {
                    self.pending = batches.into_iter().flatten().chain(queue).collect();
                    return Err(e);
                }
            }
        }

        let mut kept = VecDeque::new();
        let mut to_replay = Vec::new();
        for batch in batches {
            if batch[0].is_staged() == options.committing_staged_batches {
                to_replay.push(batch);
            } else {
                kept.extend(batch);
            }
        }

        // Acked-pending non-staged entries stay ahead of committed ones;
        // staged entries stay behind resubmitted ones.
        if options.committing_staged_batches {
            self.pending = std::mem::take(&mut kept);
        }

        log::info!(
            "Replaying {} pending batches (committing staged: {}, squash: {})",
            to_replay.len(),
            options.committing_staged_batches,
            options.squash
        );

        let mut remaining = to_replay.into_iter();
        while let Some(batch) = remaining.next() {
            if let Err(e) = self.replay_batch(&batch, options.squash, target) {
                log::warn!("Replay failed, restoring {} pending entries", batch.len());
                self.pending.extend(batch);
                self.pending.extend(remaining.flatten());
                self.pending.extend(kept);
                return Err(e);
            }
        }

        self.pending.extend(kept);
        Ok(())
    }

    fn replay_batch(
        &mut self,
        batch: &[PendingMessage],
        squash: bool,
        target: &mut dyn ReplayTarget,
    ) -> Result<()> {
        let mut had_ops = false;
        for entry in batch {
            if entry.empty_batch || entry.message_type == MessageType::IdAllocation {
                continue;
            }
            had_ops = true;
            let message = entry.to_local_message()?;
            target.resubmit(message, squash).map_err(|e| {
                PipelineError::ResubmitFailed(format!("{} message: {}", entry.message_type, e))
            })?;
        }

        if !had_ops && !batch[0].empty_batch {
            return Ok(());
        }

        let flushed = target.flush(ResubmitInfo {
            batch_id: batch[0].batch_info.batch_id.clone(),
            staged: false,
        })?;
        for batch in flushed {
            self.on_flush_batch(batch);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Staging discard
    // -----------------------------------------------------------------------

    /// Pop staged entries newest first, calling `rollback` once per op.
    /// Returns the number of ops rolled back.
    pub fn pop_staged_batches(
        &mut self,
        mut rollback: impl FnMut(&LocalMessage) -> Result<()>,
    ) -> Result<usize> {
        let mut rolled_back = 0;
        while let Some(entry) = self.pending.pop_back() {
            if !entry.is_staged() {
                self.pending.push_back(entry);
                break;
            }
            if entry.empty_batch || entry.message_type == MessageType::IdAllocation {
                continue;
            }
            let message = entry.to_local_message()?;
            rollback(&message)?;
            rolled_back += 1;
        }

        self.restored = self.restored.min(self.pending.len());
        if self.has_staged_messages() {
            return Err(PipelineError::PendingMismatch {
                client_sequence_number: None,
                reason: "staged entry found ahead of non-staged entries".to_string(),
            });
        }
        Ok(rolled_back)
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Non-staged pending state for persistence, oldest first. Entries
    /// generated against a sequence number beyond `upto` are skipped.
    pub fn get_local_state(&self, upto: Option<SequenceNumber>) -> PendingLocalState {
        let restored = self.restored.min(self.pending.len());
        let ordered = self
            .pending
            .range(..restored)
            .chain(self.stashed.iter())
            .chain(self.pending.range(restored..));

        let mut pending_states = Vec::new();
        for entry in ordered {
            if entry.is_staged() || entry.empty_batch {
                continue;
            }
            if let Some(upto) = upto {
                if entry.reference_sequence_number > upto {
                    log::warn!(
                        "Skipping pending {} message at reference sequence number {} beyond {}",
                        entry.message_type,
                        entry.reference_sequence_number,
                        upto
                    );
                    continue;
                }
            }
            pending_states.push(entry.clone());
        }
        PendingLocalState { pending_states }
    }

    /// Reapply stashed entries generated at or before `sequence_number`
    /// (all of them when `None`) and move them into the live ledger.
    pub fn apply_stashed_ops_at(
        &mut self,
        sequence_number: Option<SequenceNumber>,
        handlers: &mut HandlerTable,
    ) -> Result<usize> {
        let mut applied = 0;
        while let Some(front) = self.stashed.front() {
            if let Some(seq) = sequence_number {
                if front.reference_sequence_number > seq {
                    break;
                }
            }
            let mut entry = match self.stashed.pop_front() {
                Some(entry) => entry,
                None => break,
            };

            let skip_handler = entry.empty_batch
                || (entry.message_type == MessageType::IdAllocation
                    && !handlers.contains(HandlerCategory::IdAllocation));
            if !skip_handler {
                let message = entry.to_local_message()?;
                let handler = handlers.for_message(&message)?;
                entry.local_op_metadata = handler.apply_stashed_op(&message)?;
            }
            // Ops submitted since the reload stay behind the stash.
            self.pending.insert(self.restored, entry);
            self.restored += 1;
            applied += 1;
        }
        if self.stashed.is_empty() {
            self.restored = 0;
        }
        Ok(applied)
    }

    pub fn has_stashed_ops(&self) -> bool {
        !self.stashed.is_empty()
    }
}

/// Pop one whole batch off the front of `queue`. On error `queue` is left
/// untouched.
fn take_batch(queue: &mut VecDeque<PendingMessage>) -> Result<Option<Vec<PendingMessage>>> {
    let first = match queue.front() {
        Some(first) => first,
        None => return Ok(None),
    };
    if !first.position.starts_batch() {
        return Err(PipelineError::PendingMismatch {
            client_sequence_number: first.batch_info.batch_start_csn,
            reason: format!("pending batch begins with a {:?} entry", first.position),
        });
    }

    let len = if first.position == BatchPosition::Start {
        match queue.iter().skip(1).position(|m| m.position.ends_batch()) {
            Some(end) => end + 2,
            None => {
                return Err(PipelineError::PendingMismatch {
                    client_sequence_number: first.batch_info.batch_start_csn,
                    reason: "pending batch has no end".to_string(),
                })
            }
        }
    } else {
        1
    };
    Ok(Some(queue.drain(..len).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{HandlerError, MessageHandler, Submitter};
    use crate::message::wire::InboundMessage;
    use crate::outbox::{BatchKind, FlushedMessage};
    use serde_json::json;

    fn op(n: i64) -> LocalMessage {
        LocalMessage::new(MessageType::Operation, json!({ "n": n }))
    }

    fn flushed(messages: Vec<LocalMessage>, csn: Option<i64>, staged: bool) -> FlushedBatch {
        let messages = messages
            .into_iter()
            .map(|m| FlushedMessage {
                content: m.serialized_contents().unwrap(),
                message: m,
            })
            .collect();
        FlushedBatch {
            kind: BatchKind::Main,
            messages,
            reference_sequence_number: 1,
            staged,
            client_id: csn.map(|_| "me".to_string()),
            batch_start_csn: csn,
            batch_id: csn.map(|c| BatchId::generate("me", c)),
        }
    }

    fn inbound(client: &str, csn: i64, messages: &[LocalMessage]) -> InboundBatch {
        InboundBatch {
            client_id: client.to_string(),
            batch_start_csn: csn,
            explicit_batch_id: None,
            sequence_number: 10,
            minimum_sequence_number: 0,
            reference_sequence_number: 1,
            messages: messages
                .iter()
                .map(|m| InboundMessage {
                    message_type: m.message_type,
                    contents: m.contents.clone(),
                    raw_contents: m.serialized_contents().unwrap(),
                    metadata: None,
                    client_sequence_number: csn,
                    sequence_number: 10,
                })
                .collect(),
        }
    }

    /// Resubmits every op as-is and records flushes as queued batches.
    #[derive(Default)]
    struct Recorder {
        resubmitted: Vec<LocalMessage>,
        flushes: Vec<ResubmitInfo>,
        open: Vec<LocalMessage>,
    }

    impl ReplayTarget for Recorder {
        fn resubmit(&mut self, message: LocalMessage, _squash: bool) -> Result<()> {
            self.resubmitted.push(message.clone());
            self.open.push(message.staged(false));
            Ok(())
        }

        fn flush(&mut self, resubmit_info: ResubmitInfo) -> Result<Vec<FlushedBatch>> {
            self.flushes.push(resubmit_info);
            if self.open.is_empty() {
                return Ok(Vec::new());
            }
            Ok(vec![flushed(std::mem::take(&mut self.open), None, false)])
        }
    }

    /// Fails the nth resubmit.
    struct FailingTarget {
        inner: Recorder,
        fail_at: usize,
    }

    impl ReplayTarget for FailingTarget {
        fn resubmit(&mut self, message: LocalMessage, squash: bool) -> Result<()> {
            if self.inner.resubmitted.len() + 1 == self.fail_at {
                return Err(PipelineError::ResubmitFailed("handler gone".to_string()));
            }
            self.inner.resubmit(message, squash)
        }

        fn flush(&mut self, resubmit_info: ResubmitInfo) -> Result<Vec<FlushedBatch>> {
            self.inner.flush(resubmit_info)
        }
    }

    struct Stash;

    impl MessageHandler for Stash {
        fn apply_stashed_op(
            &mut self,
            _message: &LocalMessage,
        ) -> std::result::Result<Option<Value>, HandlerError> {
            Ok(None)
        }

        fn resubmit(
            &mut self,
            message: LocalMessage,
            _squash: bool,
            submitter: &mut dyn Submitter,
        ) -> Result<()> {
            submitter.submit(message)
        }

        fn rollback(&mut self, _message: &LocalMessage) -> std::result::Result<(), HandlerError> {
            Ok(())
        }
    }

    fn numbers(state: &PendingLocalState) -> Vec<i64> {
        state
            .pending_states
            .iter()
            .map(|m| m.to_local_message().unwrap().contents["n"].as_i64().unwrap())
            .collect()
    }

    #[test]
    fn test_local_ack_returns_local_metadata() {
        let mut psm = PendingStateManager::new();
        let a = op(1).with_local_metadata(json!("meta-a"));
        let b = op(2);
        psm.on_flush_batch(flushed(vec![a.clone(), b.clone()], Some(1), false));

        let processed = psm
            .process_inbound_messages(&inbound("me", 1, &[a, b]), true)
            .unwrap();
        assert_eq!(processed.len(), 2);
        assert_eq!(processed[0].local_op_metadata, Some(json!("meta-a")));
        assert!(!psm.has_pending_messages());
    }

    #[test]
    fn test_local_ack_content_mismatch_is_fatal() {
        let mut psm = PendingStateManager::new();
        psm.on_flush_batch(flushed(vec![op(1)], Some(1), false));
        let err = psm
            .process_inbound_messages(&inbound("me", 1, &[op(99)]), true)
            .unwrap_err();
        assert!(matches!(err, PipelineError::PendingMismatch { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_local_ack_csn_mismatch_is_fatal() {
        let mut psm = PendingStateManager::new();
        psm.on_flush_batch(flushed(vec![op(1)], Some(1), false));
        assert!(psm
            .process_inbound_messages(&inbound("me", 2, &[op(1)]), true)
            .is_err());
    }

    #[test]
    fn test_remote_batch_with_pending_id_is_fork() {
        let mut psm = PendingStateManager::new();
        psm.on_flush_batch(flushed(vec![op(1)], Some(4), false));

        let mut remote = inbound("other", 9, &[op(1)]);
        assert!(psm.process_inbound_messages(&remote, false).is_ok());

        remote.explicit_batch_id = Some(BatchId::generate("me", 4));
        let err = psm.process_inbound_messages(&remote, false).unwrap_err();
        assert!(matches!(err, PipelineError::ForkedContainer { .. }));
    }

    #[test]
    fn test_replay_skips_staged_and_keeps_them_last() {
        let mut psm = PendingStateManager::new();
        psm.on_flush_batch(flushed(vec![op(1), op(2)], None, false));
        psm.on_flush_batch(flushed(vec![op(3).staged(true)], None, true));

        let mut target = Recorder::default();
        psm.replay_pending_states(ReplayOptions::default(), &mut target)
            .unwrap();

        assert_eq!(target.resubmitted.len(), 2);
        assert_eq!(target.flushes.len(), 1);
        let staged: Vec<_> = psm.pending_messages().map(|m| m.is_staged()).collect();
        assert_eq!(staged, vec![false, false, true]);
    }

    #[test]
    fn test_commit_replays_only_staged_behind_unacked() {
        let mut psm = PendingStateManager::new();
        psm.on_flush_batch(flushed(vec![op(1)], Some(1), false));
        psm.on_flush_batch(flushed(vec![op(2).staged(true)], None, true));
        psm.on_flush_batch(flushed(vec![op(3).staged(true)], None, true));

        let mut target = Recorder::default();
        let options = ReplayOptions {
            committing_staged_batches: true,
            squash: false,
        };
        psm.replay_pending_states(options, &mut target).unwrap();

        let contents: Vec<_> = target.resubmitted.iter().map(|m| m.contents.clone()).collect();
        assert_eq!(contents, vec![json!({"n": 2}), json!({"n": 3})]);
        assert!(target.resubmitted.iter().all(|m| m.staged));
        assert!(!psm.has_staged_messages());
        let first = psm.pending_messages().next().unwrap();
        assert_eq!(first.batch_info.batch_start_csn, Some(1));
    }

    #[test]
    fn test_failed_replay_restores_ledger() {
        let mut psm = PendingStateManager::new();
        for n in 1..=3 {
            psm.on_flush_batch(flushed(vec![op(n)], None, false));
        }
        psm.on_flush_batch(flushed(vec![op(4).staged(true)], None, true));
        assert_eq!(psm.pending_message_count(), 4);

        let mut target = FailingTarget {
            inner: Recorder::default(),
            fail_at: 2,
        };
        let err = psm
            .replay_pending_states(ReplayOptions::default(), &mut target)
            .unwrap_err();
        assert!(matches!(err, PipelineError::ResubmitFailed(_)));

        // Batch 1 went through the target and came back as a new entry.
        assert_eq!(psm.pending_message_count(), 4);
        let staged: Vec<_> = psm.pending_messages().map(|m| m.is_staged()).collect();
        assert_eq!(staged, vec![false, false, false, true]);
        assert_eq!(numbers(&psm.get_local_state(None)), vec![1, 2, 3]);
    }

    #[test]
    fn test_malformed_ledger_is_left_in_place() {
        let mut psm = PendingStateManager::new();
        psm.on_flush_batch(flushed(vec![op(1)], None, false));
        psm.on_flush_batch(flushed(vec![op(2), op(3)], None, false));
        psm.pending.pop_back();

        let mut target = Recorder::default();
        assert!(psm
            .replay_pending_states(ReplayOptions::default(), &mut target)
            .is_err());
        assert!(target.resubmitted.is_empty());
        assert_eq!(psm.pending_message_count(), 2);
    }

    #[test]
    fn test_replay_drops_id_allocation_entries() {
        let mut psm = PendingStateManager::new();
        let alloc = LocalMessage::new(MessageType::IdAllocation, json!({"count": 2}));
        psm.on_flush_batch(flushed(vec![alloc.clone()], None, false));
        psm.on_flush_batch(flushed(vec![alloc, op(1)], None, false));

        let mut target = Recorder::default();
        psm.replay_pending_states(ReplayOptions::default(), &mut target)
            .unwrap();
        assert_eq!(target.resubmitted.len(), 1);
        assert_eq!(target.flushes.len(), 1);
        assert_eq!(psm.pending_message_count(), 1);
    }

    #[test]
    fn test_pop_staged_is_lifo_and_spares_earlier_entries() {
        let mut psm = PendingStateManager::new();
        psm.on_flush_batch(flushed(vec![op(0)], None, false));
        psm.on_flush_batch(flushed(vec![op(1).staged(true), op(2).staged(true)], None, true));
        psm.on_flush_batch(flushed(vec![op(3).staged(true)], None, true));

        let mut order = Vec::new();
        let count = psm
            .pop_staged_batches(|m| {
                order.push(m.contents["n"].as_i64().unwrap());
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 3);
        assert_eq!(order, vec![3, 2, 1]);
        assert_eq!(psm.pending_message_count(), 1);
    }

    #[test]
    fn test_local_state_excludes_staged_and_future_entries() {
        let mut psm = PendingStateManager::new();
        psm.on_flush_batch(flushed(vec![op(1)], None, false));
        let mut later = flushed(vec![op(2)], None, false);
        later.reference_sequence_number = 50;
        psm.on_flush_batch(later);
        psm.on_flush_batch(flushed(vec![op(3).staged(true)], None, true));

        let state = psm.get_local_state(Some(10));
        assert_eq!(state.pending_states.len(), 1);
        assert_eq!(psm.get_local_state(None).pending_states.len(), 2);
    }

    #[test]
    fn test_local_state_keeps_stash_ahead_of_new_ops() {
        let mut source = PendingStateManager::new();
        source.on_flush_batch(flushed(vec![op(1)], None, false));
        let mut second = flushed(vec![op(2)], None, false);
        second.reference_sequence_number = 5;
        source.on_flush_batch(second);

        let mut psm = PendingStateManager::from_local_state(source.get_local_state(None));
        let mut handlers = HandlerTable::new().with(HandlerCategory::DocumentOps, Box::new(Stash));
        psm.on_flush_batch(flushed(vec![op(3)], None, false));
        assert_eq!(numbers(&psm.get_local_state(None)), vec![1, 2, 3]);

        assert_eq!(psm.apply_stashed_ops_at(Some(1), &mut handlers).unwrap(), 1);
        psm.on_flush_batch(flushed(vec![op(4)], None, false));
        assert_eq!(numbers(&psm.get_local_state(None)), vec![1, 2, 3, 4]);

        assert_eq!(psm.apply_stashed_ops_at(None, &mut handlers).unwrap(), 1);
        assert!(!psm.has_stashed_ops());
        let live: Vec<_> = psm
            .pending_messages()
            .map(|m| m.to_local_message().unwrap().contents["n"].as_i64().unwrap())
            .collect();
        assert_eq!(live, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_empty_batch_placeholder_is_acked() {
        let mut psm = PendingStateManager::new();
        let mut placeholder = flushed(vec![], Some(5), false);
        placeholder.batch_id = Some(BatchId::from("old_[1]"));
        psm.on_flush_batch(placeholder);
        assert_eq!(psm.pending_message_count(), 1);

        let mut ack = inbound("me", 5, &[]);
        ack.explicit_batch_id = Some(BatchId::from("old_[1]"));
        assert!(psm.process_inbound_messages(&ack, true).unwrap().is_empty());
        assert!(!psm.has_pending_messages());
    }

    #[test]
    fn test_dispose_clears_everything() {
        let mut psm = PendingStateManager::from_local_state(PendingLocalState::default());
        psm.on_flush_batch(flushed(vec![op(1)], None, false));
        psm.dispose();
        assert!(psm.is_disposed());
        assert!(!psm.has_pending_messages());
    }
}
