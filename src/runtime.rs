//! The pipeline runtime: owns every stage and routes calls between them.
//!
//! # Lifecycle
//!
//! A runtime starts detached and disconnected. The host reports attach and
//! connection changes; every reconnect replays the pending ledger behind
//! one consolidated id allocation. Fatal errors go through [`close`], after
//! which every call fails with [`PipelineError::Closed`].
//!
//! [`close`]: PipelineRuntime::close

use crate::codec::remote::RemoteMessageProcessor;
use crate::config::PipelineConfig;
use crate::duplicate_detector::{DuplicateBatchDetector, DuplicateCheck};
use crate::error::{PipelineError, Result};
use crate::handlers::{HandlerTable, Submitter};
use crate::id_allocation::{IdAllocationCoordinator, IdCompressor};
use crate::message::wire::SequencedWireMessage;
use crate::message::{LocalMessage, MessageType, SequenceNumber};
use crate::outbox::{BatchKind, FlushedBatch, Outbox, ResubmitInfo};
use crate::pending::{
    PendingLocalState, PendingStateManager, ProcessedMessage, ReplayOptions, ReplayTarget,
};
use crate::persistence::{PersistedRuntimeState, StateStore};
use crate::scheduler::{FlushMode, Scheduler};
use crate::staging::StagingController;
use crate::transport::Transport;

/// Called once with the error that closed the runtime.
pub type CloseHandler = Box<dyn FnMut(&PipelineError)>;

/// Options for [`PipelineRuntime::commit_changes`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommitOptions {
    pub squash: bool,
}

pub struct PipelineRuntime {
    config: PipelineConfig,
    outbox: Outbox,
    pending: PendingStateManager,
    remote: RemoteMessageProcessor,
    duplicates: DuplicateBatchDetector,
    ids: IdAllocationCoordinator,
    staging: StagingController,
    handlers: HandlerTable,
    scheduler: Box<dyn Scheduler>,
    /// Client id of the connection whose acks count as local.
    client_id: Option<String>,
    connected: bool,
    attached: bool,
    dirty: bool,
    flush_scheduled: bool,
    last_sequence_number: SequenceNumber,
    consecutive_reconnects: u32,
    closed: Option<String>,
    on_close: Option<CloseHandler>,
}

impl PipelineRuntime {
    pub fn new(
        config: PipelineConfig,
        transport: Box<dyn Transport>,
        handlers: HandlerTable,
        scheduler: Box<dyn Scheduler>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            outbox: Outbox::new(config.clone(), transport),
            config,
            pending: PendingStateManager::new(),
            remote: RemoteMessageProcessor::new(),
            duplicates: DuplicateBatchDetector::default(),
            ids: IdAllocationCoordinator::default(),
            staging: StagingController::new(),
            handlers,
            scheduler,
            client_id: None,
            connected: false,
            attached: false,
            dirty: false,
            flush_scheduled: false,
            last_sequence_number: 0,
            consecutive_reconnects: 0,
            closed: None,
            on_close: None,
        })
    }

    pub fn with_id_compressor(mut self, compressor: Box<dyn IdCompressor>) -> Self {
        self.ids = IdAllocationCoordinator::new(Some(compressor));
        self
    }

    /// Rehydrate pending ops and the recent batch ledger. Restored ops stay
    /// stashed until [`apply_stashed_ops_at`](Self::apply_stashed_ops_at).
    pub fn with_persisted_state(mut self, state: PersistedRuntimeState) -> Self {
        self.pending = PendingStateManager::from_local_state(state.pending);
        self.duplicates = DuplicateBatchDetector::new(state.recent_batches);
        self.dirty = self.pending.has_pending_messages() || self.pending.has_stashed_ops();
        self
    }

    pub fn with_close_handler(mut self, handler: CloseHandler) -> Self {
        self.on_close = Some(handler);
        self
    }

    /// Start from a known sequence number, e.g. that of a loaded snapshot.
    pub fn with_sequence_number(mut self, sequence_number: SequenceNumber) -> Self {
        self.last_sequence_number = sequence_number;
        self
    }

    // -----------------------------------------------------------------------
    // State queries
    // -----------------------------------------------------------------------

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    pub fn closed_reason(&self) -> Option<&str> {
        self.closed.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn is_staging(&self) -> bool {
        self.staging.is_staging()
    }

    pub fn last_sequence_number(&self) -> SequenceNumber {
        self.last_sequence_number
    }

    pub fn consecutive_reconnects(&self) -> u32 {
        self.consecutive_reconnects
    }

    pub fn has_pending_messages(&self) -> bool {
        self.pending.has_pending_messages()
    }

    pub fn pending(&self) -> &PendingStateManager {
        &self.pending
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Close channel
    // -----------------------------------------------------------------------

    /// Close the runtime with a fatal error. Only the first reason sticks.
    pub fn close(&mut self, error: PipelineError) -> PipelineError {
        if self.closed.is_none() {
            log::error!("Closing pipeline runtime: {}", error);
            self.closed = Some(error.to_string());
            if let Some(handler) = self.on_close.as_mut() {
                handler(&error);
            }
        }
        error
    }

    /// Route an error: fatal ones close the runtime, policy ones pass through.
    fn fail(&mut self, error: PipelineError) -> PipelineError {
        if error.is_fatal() {
            self.close(error)
        } else {
            error
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match &self.closed {
            Some(reason) => Err(PipelineError::Closed(reason.clone())),
            None => Ok(()),
        }
    }

    /// Drop all pending state without side effects and stop accepting work.
    pub fn dispose(&mut self) {
        self.pending.dispose();
        if self.closed.is_none() {
            self.closed = Some("disposed".to_string());
        }
    }

    // -----------------------------------------------------------------------
    // Submit and flush
    // -----------------------------------------------------------------------

    /// Submit one op from a subsystem.
    pub fn submit(&mut self, mut message: LocalMessage) -> Result<()> {
        self.ensure_open()?;
        if message.message_type.is_internal() {
            return Err(PipelineError::InternalMessageType(message.message_type));
        }
        if message.message_type == MessageType::BlobAttach && !message.has_blob_metadata() {
            return Err(PipelineError::MissingBlobMetadata);
        }
        self.staging.check_allowed(message.message_type)?;

        message.staged = self.staging.is_staging();
        message.reference_sequence_number = self.last_sequence_number;

        if !message.staged && message.message_type != MessageType::IdAllocation {
            self.submit_id_allocation(false)?;
        }
        if message.message_type.is_dirtyable() {
            self.dirty = true;
        }
        self.enqueue(message)?;
        self.schedule_flush()
    }

    fn enqueue(&mut self, message: LocalMessage) -> Result<()> {
        let result = self.outbox.submit(message);
        let flushed = self.settle(result)?;
        self.record_flushed(flushed);
        Ok(())
    }

    fn submit_id_allocation(&mut self, consolidated: bool) -> Result<()> {
        let allocation = if consolidated {
            self.ids.consolidated_allocation()
        } else {
            self.ids.next_allocation()
        };
        match allocation.map_err(|e| self.fail(e))? {
            Some(message) => {
                self.enqueue(message.with_reference_sequence_number(self.last_sequence_number))
            }
            None => Ok(()),
        }
    }

    /// Record whatever a failed outbox flush already took from its slots,
    /// then route the error.
    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        let stranded = self.outbox.take_flushed();
        if !stranded.is_empty() {
            log::warn!("Recording {} batches from a failed flush", stranded.len());
            self.record_flushed(stranded);
        }
        result.map_err(|e| self.fail(e))
    }

    fn record_flushed(&mut self, batches: Vec<FlushedBatch>) {
        for batch in batches {
            if batch.staged {
                self.staging.record_staged_batch();
            }
            self.pending.on_flush_batch(batch);
        }
    }

    fn schedule_flush(&mut self) -> Result<()> {
        if self.outbox.in_scope() || self.outbox.is_empty() {
            return Ok(());
        }
        match self.config.flush_mode {
            FlushMode::Immediate => self.flush(),
            mode => {
                if !self.flush_scheduled {
                    self.flush_scheduled = true;
                    self.scheduler.schedule_once(mode);
                }
                Ok(())
            }
        }
    }

    /// Flush every open batch now.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.outbox.in_scope() {
            return Err(PipelineError::FlushInsideSequentialScope);
        }
        self.flush_outbox()
    }

    /// Host callback for a flush requested through the scheduler.
    pub fn flush_scheduled(&mut self) -> Result<()> {
        if !self.flush_scheduled {
            return Ok(());
        }
        self.flush()
    }

    fn flush_outbox(&mut self) -> Result<()> {
        self.flush_scheduled = false;
        let result = self.outbox.flush(None);
        let flushed = self.settle(result)?;
        self.record_flushed(flushed);
        Ok(())
    }

    /// Run `f` as one unit: its ops share a batch, and if it fails every op
    /// it submitted to the main batch is rolled back, newest first.
    pub fn order_sequentially<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.ensure_open()?;
        let checkpoint = self.outbox.checkpoint();
        self.outbox.enter_scope();
        let result = f(self);
        self.outbox.exit_scope();

        match result {
            Ok(value) => {
                self.schedule_flush()?;
                Ok(value)
            }
            Err(error) => {
                if self.is_closed() {
                    return Err(error);
                }
                for message in self.outbox.rollback_to(checkpoint) {
                    let rolled_back = self.handlers.for_message(&message).and_then(|handler| {
                        handler.rollback(&message).map_err(PipelineError::from)
                    });
                    if let Err(e) = rolled_back {
                        return Err(self.close(PipelineError::RollbackFailed(format!(
                            "{} message: {}",
                            message.message_type, e
                        ))));
                    }
                }
                Err(error)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Connection and attach state
    // -----------------------------------------------------------------------

    pub fn set_connection_state(&mut self, connected: bool) -> Result<()> {
        self.ensure_open()?;
        if connected == self.connected {
            log::debug!("Connection state unchanged (connected: {})", connected);
            return Ok(());
        }

        if !connected {
            self.connected = false;
            // Open batches join the ledger now so replay keeps them in order.
            let result = self.outbox.queue_all();
            let flushed = self.settle(result)?;
            self.record_flushed(flushed);
            log::info!(
                "Disconnected with {} pending messages",
                self.pending.pending_message_count()
            );
            return Ok(());
        }

        self.connected = true;
        self.client_id = self.outbox.transport().client_id();

        if self.pending.has_pending_messages() {
            self.consecutive_reconnects += 1;
            if self.consecutive_reconnects > self.config.max_consecutive_reconnects {
                let error = PipelineError::TooManyReconnects {
                    attempts: self.consecutive_reconnects,
                    pending_count: self.pending.pending_message_count(),
                };
                return Err(self.close(error));
            }
        }

        self.replay_on_reconnect()
    }

    pub fn set_attached(&mut self, attached: bool) -> Result<()> {
        self.ensure_open()?;
        let was_attached = self.attached;
        self.attached = attached;
        if attached && !was_attached && self.connected {
            self.replay_on_reconnect()?;
        }
        Ok(())
    }

    fn replay_on_reconnect(&mut self) -> Result<()> {
        if !self.attached || !self.outbox.transport().is_active_connection() {
            log::debug!("Skipping replay: attached={}, connection inactive", self.attached);
            return Ok(());
        }
        if self.pending.has_stashed_ops() {
            log::warn!("Reconnected before stashed ops were applied; they will not be replayed yet");
        }

        let result = self.outbox.queue_all();
        let flushed = self.settle(result)?;
        self.record_flushed(flushed);

        self.submit_id_allocation(true)?;
        self.replay(ReplayOptions::default())?;
        self.flush_outbox()
    }

    fn replay(&mut self, options: ReplayOptions) -> Result<()> {
        let mut context = ReplayContext {
            outbox: &mut self.outbox,
            handlers: &mut self.handlers,
            reference_sequence_number: self.last_sequence_number,
            spilled: Vec::new(),
        };
        let result = self.pending.replay_pending_states(options, &mut context);
        if result.is_err() {
            // The ledger already holds the failed batch in its original form.
            let dropped = self.outbox.take_flushed();
            if !dropped.is_empty() {
                log::warn!("Dropping {} batches flushed by a failed replay", dropped.len());
            }
        }
        result.map_err(|e| self.fail(e))
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Process one sequenced message. Returns the ops of any batch it
    /// completed, with local metadata attached to acknowledged local ops.
    pub fn process(&mut self, message: SequencedWireMessage) -> Result<Vec<ProcessedMessage>> {
        self.ensure_open()?;
        self.last_sequence_number = self.last_sequence_number.max(message.sequence_number);

        let result = self.remote.process(message).map_err(PipelineError::from);
        let batch = match result {
            Ok(Some(batch)) => batch,
            Ok(None) => return Ok(Vec::new()),
            Err(e) => return Err(self.close(e)),
        };

        if self.config.enable_offline_load {
            if let DuplicateCheck::Duplicate {
                other_sequence_number,
            } = self.duplicates.process_inbound_batch(&batch)
            {
                let error = PipelineError::DuplicateBatch {
                    batch_id: batch.batch_id(),
                    sequence_number: batch.sequence_number,
                    other_sequence_number,
                };
                return Err(self.close(error));
            }
        }

        let local = self.client_id.as_deref() == Some(batch.client_id.as_str());
        let result = self.pending.process_inbound_messages(&batch, local);
        let processed = result.map_err(|e| self.fail(e))?;
        if local {
            self.consecutive_reconnects = 0;
        }

        for message in &processed {
            if message.message.message_type == MessageType::IdAllocation {
                let result = self.ids.process_allocation(&message.message.contents);
                result.map_err(|e| self.fail(e))?;
            }
        }

        self.update_dirty();
        Ok(processed)
    }

    fn update_dirty(&mut self) {
        if self.dirty && !self.pending.has_pending_messages() && self.outbox.is_empty() {
            self.dirty = false;
        }
    }

    // -----------------------------------------------------------------------
    // Staging
    // -----------------------------------------------------------------------

    pub fn enter_staging_mode(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.staging
            .check_can_enter(self.attached, self.outbox.in_scope())?;
        self.flush_outbox()?;
        self.staging.enter(self.last_sequence_number);
        Ok(())
    }

    /// Send everything staged, in order, as ordinary batches.
    pub fn commit_changes(&mut self, options: CommitOptions) -> Result<()> {
        self.ensure_open()?;
        self.staging.check_can_exit(self.outbox.in_scope())?;
        self.flush_outbox()?;
        self.staging.exit()?;

        self.submit_id_allocation(false)?;
        self.replay(ReplayOptions {
            committing_staged_batches: true,
            squash: options.squash,
        })?;
        self.flush_outbox()
    }

    /// Roll back everything staged, newest first. Nothing staged is sent.
    pub fn discard_changes(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.staging.check_can_exit(self.outbox.in_scope())?;
        self.flush_outbox()?;
        self.staging.exit()?;

        let handlers = &mut self.handlers;
        let result = self.pending.pop_staged_batches(|message| {
            let handler = handlers
                .for_message(message)
                .map_err(|e| PipelineError::RollbackFailed(e.to_string()))?;
            handler.rollback(message).map_err(|e| {
                PipelineError::RollbackFailed(format!("{} message: {}", message.message_type, e))
            })
        });
        let rolled_back = result.map_err(|e| self.fail(e))?;
        log::debug!("Discarded {} staged messages", rolled_back);
        self.update_dirty();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub fn get_pending_local_state(&self, upto: Option<SequenceNumber>) -> PendingLocalState {
        self.pending.get_local_state(upto)
    }

    pub fn persisted_state(&self, upto: Option<SequenceNumber>) -> PersistedRuntimeState {
        PersistedRuntimeState {
            pending: self.pending.get_local_state(upto),
            recent_batches: self.duplicates.get_recent_batch_info_for_summary(),
        }
    }

    pub fn save_to(
        &self,
        store: &mut dyn StateStore,
        document_id: &str,
        upto: Option<SequenceNumber>,
    ) -> Result<()> {
        store.save(document_id, &self.persisted_state(upto))?;
        Ok(())
    }

    /// Reapply stashed ops generated at or before `sequence_number`.
    pub fn apply_stashed_ops_at(&mut self, sequence_number: Option<SequenceNumber>) -> Result<usize> {
        self.ensure_open()?;
        let result = self
            .pending
            .apply_stashed_ops_at(sequence_number, &mut self.handlers);
        let applied = result.map_err(|e| self.fail(e))?;
        if applied > 0 {
            self.dirty = true;
        }
        Ok(applied)
    }
}

// ---------------------------------------------------------------------------
// Replay plumbing
// ---------------------------------------------------------------------------

struct ReplayContext<'a> {
    outbox: &'a mut Outbox,
    handlers: &'a mut HandlerTable,
    reference_sequence_number: SequenceNumber,
    /// Batches flushed early by a reference sequence number change.
    spilled: Vec<FlushedBatch>,
}

struct OutboxSubmitter<'a> {
    outbox: &'a mut Outbox,
    reference_sequence_number: SequenceNumber,
    spilled: &'a mut Vec<FlushedBatch>,
}

impl Submitter for OutboxSubmitter<'_> {
    fn submit(&mut self, mut message: LocalMessage) -> Result<()> {
        message.reference_sequence_number = self.reference_sequence_number;
        message.staged = false;
        let flushed = self.outbox.submit(message)?;
        self.spilled.extend(flushed);
        Ok(())
    }
}

impl ReplayTarget for ReplayContext<'_> {
    fn resubmit(&mut self, message: LocalMessage, squash: bool) -> Result<()> {
        let handler = self.handlers.for_message(&message)?;
        let mut submitter = OutboxSubmitter {
            outbox: &mut *self.outbox,
            reference_sequence_number: self.reference_sequence_number,
            spilled: &mut self.spilled,
        };
        handler.resubmit(message, squash, &mut submitter)
    }

    fn flush(&mut self, resubmit_info: ResubmitInfo) -> Result<Vec<FlushedBatch>> {
        let mut flushed = std::mem::take(&mut self.spilled);
        let batch_id = resubmit_info.batch_id.clone();
        let produced = self.outbox.flush(Some(resubmit_info))?;
        let had_ops = produced.iter().any(|b| b.kind != BatchKind::IdAllocation);
        flushed.extend(produced);

        if !had_ops {
            if let Some(batch_id) = batch_id {
                let empty = self
                    .outbox
                    .flush_empty_batch(batch_id, self.reference_sequence_number)?;
                flushed.extend(empty);
            }
        }
        Ok(flushed)
    }
}
