//! Boundary to the ordering service connection.

use thiserror::Error;

use crate::message::wire::WireMessage;
use crate::message::{ClientSequenceNumber, SequenceNumber};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// Outbound connection used by the outbox.
pub trait Transport {
    /// Id assigned by the ordering service to the current connection.
    fn client_id(&self) -> Option<String>;

    /// Whether the connection is live and caught up.
    fn is_active_connection(&self) -> bool;

    /// Whether flushes should reach the network. When false, flushed batches
    /// only enter the pending ledger.
    fn should_send(&self) -> bool;

    /// Send a batch. Returns the client sequence number of its first
    /// message; the rest follow consecutively.
    fn send(
        &mut self,
        messages: Vec<WireMessage>,
        reference_sequence_number: SequenceNumber,
    ) -> Result<ClientSequenceNumber, TransportError>;

    /// Send one leading chunk of a split message.
    fn send_chunk(
        &mut self,
        chunk: WireMessage,
        reference_sequence_number: SequenceNumber,
    ) -> Result<ClientSequenceNumber, TransportError>;
}
