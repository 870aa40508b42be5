//! The outbox: accumulation of submitted ops into typed batches and their
//! atomic flush through the codec layer to the transport.
//!
//! # Flush
//!
//! Slots are flushed in the fixed order id-allocation, main, blob-attach so
//! that an allocation always lands before the ops that reference it. Each
//! flushed slot is returned as a [`FlushedBatch`] for the pending state
//! manager, whether it reached the network or was only queued.

pub mod batch_manager;

use std::collections::HashMap;

use crate::codec::compressor::compress_batch;
use crate::codec::grouping::{empty_group, group_batch};
use crate::codec::splitter::split_first_message;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::message::wire::{content_size, WireMessage};
use crate::message::{BatchId, ClientSequenceNumber, LocalMessage, MessageType, SequenceNumber};
use crate::transport::{Transport, TransportError};

pub use batch_manager::{Batch, BatchCheckpoint, BatchManager};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Independent batch slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BatchKind {
    IdAllocation,
    Main,
    BlobAttach,
}

impl BatchKind {
    pub const FLUSH_ORDER: [BatchKind; 3] =
        [BatchKind::IdAllocation, BatchKind::Main, BatchKind::BlobAttach];

    pub fn for_message(message_type: MessageType) -> Self {
        match message_type {
            MessageType::IdAllocation => BatchKind::IdAllocation,
            MessageType::BlobAttach => BatchKind::BlobAttach,
            _ => BatchKind::Main,
        }
    }
}

/// Identity carried over when a pending batch is replayed.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResubmitInfo {
    pub batch_id: Option<BatchId>,
    pub staged: bool,
}

/// A submitted message together with its serialized form.
#[derive(Clone, Debug, PartialEq)]
pub struct FlushedMessage {
    pub message: LocalMessage,
    pub content: String,
}

/// One flushed slot, handed to the pending state manager.
#[derive(Clone, Debug, PartialEq)]
pub struct FlushedBatch {
    pub kind: BatchKind,
    /// Empty only for the placeholder of a fully squashed resubmission.
    pub messages: Vec<FlushedMessage>,
    pub reference_sequence_number: SequenceNumber,
    pub staged: bool,
    /// Sender, set when the batch reached the transport.
    pub client_id: Option<String>,
    /// Client sequence number of the first wire message, when sent.
    pub batch_start_csn: Option<ClientSequenceNumber>,
    pub batch_id: Option<BatchId>,
}

impl FlushedBatch {
    pub fn was_sent(&self) -> bool {
        self.batch_start_csn.is_some()
    }
}

// ---------------------------------------------------------------------------
// Outbox
// ---------------------------------------------------------------------------

pub struct Outbox {
    config: PipelineConfig,
    transport: Box<dyn Transport>,
    slots: HashMap<BatchKind, BatchManager>,
    /// Reentrancy guard.
    flushing: u32,
    /// Depth of open sequential scopes.
    scope_depth: u32,
    /// Batches taken from their slots and not yet handed out.
    flushed: Vec<FlushedBatch>,
}

impl Outbox {
    pub fn new(config: PipelineConfig, transport: Box<dyn Transport>) -> Self {
        let slots = BatchKind::FLUSH_ORDER
            .iter()
            .map(|kind| (*kind, BatchManager::new()))
            .collect();
        Self {
            config,
            transport,
            slots,
            flushing: 0,
            scope_depth: 0,
            flushed: Vec::new(),
        }
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    fn slot_mut(&mut self, kind: BatchKind) -> &mut BatchManager {
        self.slots.entry(kind).or_default()
    }

    pub fn batch_len(&self, kind: BatchKind) -> usize {
        self.slots.get(&kind).map(BatchManager::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.values().all(BatchManager::is_empty)
    }

    // -- sequential scopes ----------------------------------------------------

    pub fn enter_scope(&mut self) {
        self.scope_depth += 1;
    }

    pub fn exit_scope(&mut self) {
        self.scope_depth = self.scope_depth.saturating_sub(1);
    }

    pub fn in_scope(&self) -> bool {
        self.scope_depth > 0
    }

    /// Snapshot of the main slot.
    pub fn checkpoint(&mut self) -> BatchCheckpoint {
        self.slot_mut(BatchKind::Main).checkpoint()
    }

    /// Remove main-slot messages added after `checkpoint`, newest first.
    pub fn rollback_to(&mut self, checkpoint: BatchCheckpoint) -> Vec<LocalMessage> {
        self.slot_mut(BatchKind::Main).rollback_to(checkpoint)
    }

    // -- submit ---------------------------------------------------------------

    /// Add a message to its slot.
    ///
    /// A message generated against a different reference sequence number
    /// (or staged state) first flushes every open slot in flush order, so an
    /// id allocation still lands ahead of the ops that reference it. Those
    /// flushed batches are returned.
    pub fn submit(&mut self, message: LocalMessage) -> Result<Vec<FlushedBatch>> {
        let kind = BatchKind::for_message(message.message_type);
        let mut flushed = Vec::new();

        if !self.slot_mut(kind).accepts(&message) {
            if self.in_scope() {
                let expected = self
                    .slot_mut(kind)
                    .reference_sequence_number()
                    .unwrap_or_default();
                return Err(PipelineError::ReferenceSequenceNumberMismatch {
                    expected,
                    actual: message.reference_sequence_number,
                });
            }
            log::debug!(
                "Flushing open batches before {:?} message at reference sequence number {}",
                kind,
                message.reference_sequence_number
            );
            flushed = self.guarded(|outbox| outbox.flush_all(None, false))?;
        }

        self.slot_mut(kind).push(message);
        Ok(flushed)
    }

    // -- flush ----------------------------------------------------------------

    /// Flush every non-empty slot. A no-op when nothing is open.
    pub fn flush(&mut self, resubmit_info: Option<ResubmitInfo>) -> Result<Vec<FlushedBatch>> {
        self.guarded(|outbox| outbox.flush_all(resubmit_info.as_ref(), false))
    }

    /// Move every open batch to the pending ledger without sending.
    pub fn queue_all(&mut self) -> Result<Vec<FlushedBatch>> {
        self.guarded(|outbox| outbox.flush_all(None, true))
    }

    /// Batches taken out of their slots by a flush that then failed. They
    /// belong in the pending ledger like any other flushed batch.
    pub fn take_flushed(&mut self) -> Vec<FlushedBatch> {
        std::mem::take(&mut self.flushed)
    }

    /// Send the empty grouped batch that keeps a fully squashed resubmission
    /// visible to other copies of this container. Only in offline mode.
    pub fn flush_empty_batch(
        &mut self,
        batch_id: BatchId,
        reference_sequence_number: SequenceNumber,
    ) -> Result<Option<FlushedBatch>> {
        if !self.config.enable_offline_load || !self.transport.should_send() {
            return Ok(None);
        }
        self.guarded(|outbox| {
            outbox
                .send_empty_batch(batch_id, reference_sequence_number)
                .map(Some)
                .map_err(|source| PipelineError::FlushFailed {
                    message_count: 0,
                    reference_sequence_number,
                    source: Box::new(source),
                })
        })
    }

    fn guarded<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.flushing > 0 {
            return Err(PipelineError::ReentrantFlush);
        }
        self.flushing += 1;
        let result = f(self);
        self.flushing -= 1;
        result
    }

    /// Flush the slots in order. After a failure the remaining slots are
    /// only queued, and every batch taken so far stays in `self.flushed`
    /// for [`Outbox::take_flushed`].
    fn flush_all(
        &mut self,
        resubmit_info: Option<&ResubmitInfo>,
        force_queue: bool,
    ) -> Result<Vec<FlushedBatch>> {
        let mut failure = None;
        for kind in BatchKind::FLUSH_ORDER {
            let info = match kind {
                BatchKind::IdAllocation => None,
                _ => resubmit_info,
            };
            let result = self.flush_slot(kind, info, force_queue || failure.is_some());
            if let Err(e) = result {
                failure.get_or_insert(e);
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(self.take_flushed()),
        }
    }

    fn flush_slot(
        &mut self,
        kind: BatchKind,
        info: Option<&ResubmitInfo>,
        force_queue: bool,
    ) -> Result<()> {
        let mut batch = match self.slot_mut(kind).take() {
            Some(batch) => batch,
            None => return Ok(()),
        };
        let message_count = batch.len();
        let reference_sequence_number = batch.reference_sequence_number;
        let wrap = |source: PipelineError| PipelineError::FlushFailed {
            message_count,
            reference_sequence_number,
            source: Box::new(source),
        };

        let contents: Result<Vec<String>> = batch
            .messages
            .iter()
            .map(LocalMessage::serialized_contents)
            .collect();
        let contents = match contents {
            Ok(contents) => contents,
            Err(e) => {
                self.slot_mut(kind).restore(batch);
                return Err(wrap(e));
            }
        };

        let staged = info.map_or(batch.staged, |i| i.staged);
        let resubmit_id = info.and_then(|i| i.batch_id.clone());
        if let (Some(id), Some(first)) = (resubmit_id.as_ref(), batch.messages.first_mut()) {
            first.metadata.get_or_insert_with(Default::default).batch_id = Some(id.clone());
        }

        let mut flushed = FlushedBatch {
            kind,
            messages: batch
                .messages
                .into_iter()
                .zip(contents)
                .map(|(message, content)| FlushedMessage { message, content })
                .collect(),
            reference_sequence_number,
            staged,
            client_id: None,
            batch_start_csn: None,
            batch_id: resubmit_id,
        };

        let result = if staged || force_queue || !self.transport.should_send() {
            log::debug!(
                "Queued {:?} batch of {} messages without sending (staged: {})",
                kind,
                message_count,
                staged
            );
            Ok(())
        } else {
            self.send_batch(&mut flushed)
        };
        self.flushed.push(flushed);
        result.map_err(wrap)
    }

    /// Run the transforms and hand the batch to the transport. On failure
    /// the batch is left unsent.
    fn send_batch(&mut self, flushed: &mut FlushedBatch) -> Result<()> {
        let reference_sequence_number = flushed.reference_sequence_number;
        let wire: Vec<WireMessage> = flushed
            .messages
            .iter()
            .map(|m| WireMessage::new(m.content.clone(), m.message.metadata.clone()))
            .collect();
        let (chunks, wire) = self.virtualize(flushed.kind, wire)?;

        for chunk in chunks {
            self.transport.send_chunk(chunk, reference_sequence_number)?;
        }
        let batch_start_csn = self.transport.send(wire, reference_sequence_number)?;
        let client_id = self
            .transport
            .client_id()
            .ok_or(TransportError::NotConnected)?;

        flushed.batch_id = if self.config.enable_offline_load {
            Some(
                flushed
                    .batch_id
                    .take()
                    .unwrap_or_else(|| BatchId::generate(&client_id, batch_start_csn)),
            )
        } else {
            None
        };
        flushed.client_id = Some(client_id);
        flushed.batch_start_csn = Some(batch_start_csn);
        Ok(())
    }

    /// Apply grouping, compression and chunking. Returns the leading chunks
    /// and the batch to send.
    fn virtualize(
        &self,
        kind: BatchKind,
        mut wire: Vec<WireMessage>,
    ) -> Result<(Vec<WireMessage>, Vec<WireMessage>)> {
        if self.config.enable_grouped_batching && kind != BatchKind::BlobAttach && wire.len() > 1
        {
            wire = vec![group_batch(wire)?];
        }

        if let Some(algorithm) = self.config.compression.algorithm {
            if content_size(&wire) >= self.config.compression.minimum_batch_size_in_bytes {
                wire = compress_batch(wire, algorithm)?;
            }
        }

        let max = self.config.max_batch_size_in_bytes;
        let mut chunks = Vec::new();
        let size = content_size(&wire);
        if size > max {
            if !self.config.enable_chunking {
                return Err(PipelineError::BatchTooLarge { size, max });
            }
            let split = split_first_message(wire, self.config.chunk_size_in_bytes)?;
            chunks = split.chunks;
            wire = split.batch;
            // Each chunk is a send of its own.
            if let Some(size) = chunks
                .iter()
                .map(WireMessage::content_size)
                .find(|size| *size > max)
            {
                return Err(PipelineError::BatchTooLarge { size, max });
            }
            let size = content_size(&wire);
            if size > max {
                return Err(PipelineError::BatchTooLarge { size, max });
            }
        }

        if wire.len() > 1 {
            let last = wire.len() - 1;
            wire[0].set_batch_flag(true);
            wire[last].set_batch_flag(false);
        }
        Ok((chunks, wire))
    }

    fn send_empty_batch(
        &mut self,
        batch_id: BatchId,
        reference_sequence_number: SequenceNumber,
    ) -> Result<FlushedBatch> {
        let wire = empty_group(batch_id.clone())?;
        let batch_start_csn = self.transport.send(vec![wire], reference_sequence_number)?;
        let client_id = self
            .transport
            .client_id()
            .ok_or(TransportError::NotConnected)?;
        Ok(FlushedBatch {
            kind: BatchKind::Main,
            messages: Vec::new(),
            reference_sequence_number,
            staged: false,
            client_id: Some(client_id),
            batch_start_csn: Some(batch_start_csn),
            batch_id: Some(batch_id),
        })
    }
}
