//! Accumulation of one batch slot.

use crate::message::{LocalMessage, SequenceNumber};

/// An ordered, non-empty run of messages sharing one reference sequence
/// number and one staged state.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub messages: Vec<LocalMessage>,
    pub reference_sequence_number: SequenceNumber,
    pub staged: bool,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Position to roll a slot back to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchCheckpoint {
    length: usize,
}

#[derive(Debug, Default)]
pub struct BatchManager {
    messages: Vec<LocalMessage>,
}

impl BatchManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `message` may join the open batch without breaking its
    /// shared reference sequence number or staged state.
    pub fn accepts(&self, message: &LocalMessage) -> bool {
        match self.messages.first() {
            None => true,
            Some(first) => {
                first.reference_sequence_number == message.reference_sequence_number
                    && first.staged == message.staged
            }
        }
    }

    pub fn push(&mut self, message: LocalMessage) {
        self.messages.push(message);
    }

    pub fn reference_sequence_number(&self) -> Option<SequenceNumber> {
        self.messages.first().map(|m| m.reference_sequence_number)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Take the open batch, leaving the slot empty.
    pub fn take(&mut self) -> Option<Batch> {
        let first = self.messages.first()?;
        let reference_sequence_number = first.reference_sequence_number;
        let staged = first.staged;
        Some(Batch {
            messages: std::mem::take(&mut self.messages),
            reference_sequence_number,
            staged,
        })
    }

    /// Put a taken batch back ahead of anything pushed since.
    pub fn restore(&mut self, batch: Batch) {
        let newer = std::mem::replace(&mut self.messages, batch.messages);
        self.messages.extend(newer);
    }

    pub fn checkpoint(&self) -> BatchCheckpoint {
        BatchCheckpoint {
            length: self.messages.len(),
        }
    }

    /// Remove every message added after `checkpoint`, newest first.
    pub fn rollback_to(&mut self, checkpoint: BatchCheckpoint) -> Vec<LocalMessage> {
        let mut removed = Vec::new();
        while self.messages.len() > checkpoint.length {
            if let Some(message) = self.messages.pop() {
                removed.push(message);
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use serde_json::json;

    fn msg(n: i64, rsn: SequenceNumber) -> LocalMessage {
        LocalMessage::new(MessageType::Operation, json!(n)).with_reference_sequence_number(rsn)
    }

    #[test]
    fn test_accepts_only_matching_reference_sequence_number() {
        let mut manager = BatchManager::new();
        assert!(manager.accepts(&msg(1, 3)));
        manager.push(msg(1, 3));
        assert!(manager.accepts(&msg(2, 3)));
        assert!(!manager.accepts(&msg(2, 4)));
        assert!(!manager.accepts(&msg(2, 3).staged(true)));
    }

    #[test]
    fn test_take_empties_slot() {
        let mut manager = BatchManager::new();
        assert!(manager.take().is_none());
        manager.push(msg(1, 5));
        manager.push(msg(2, 5));
        let batch = manager.take().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.reference_sequence_number, 5);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_restore_puts_batch_back() {
        let mut manager = BatchManager::new();
        manager.push(msg(1, 5));
        let batch = manager.take().unwrap();
        manager.restore(batch);
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.reference_sequence_number(), Some(5));
    }

    #[test]
    fn test_rollback_is_newest_first() {
        let mut manager = BatchManager::new();
        manager.push(msg(1, 0));
        let checkpoint = manager.checkpoint();
        manager.push(msg(2, 0));
        manager.push(msg(3, 0));
        let removed = manager.rollback_to(checkpoint);
        let values: Vec<_> = removed.iter().map(|m| m.contents.clone()).collect();
        assert_eq!(values, vec![json!(3), json!(2)]);
        assert_eq!(manager.len(), 1);
    }
}
