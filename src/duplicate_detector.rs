//! Fork detection by duplicate batch ids.
//!
//! Two live copies of one container that resubmit the same pending state
//! produce the same batch id at two different sequence numbers. The ledger
//! only has to cover the collaboration window: a batch sequenced below the
//! minimum sequence number can no longer be resubmitted by anyone.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::message::wire::InboundBatch;
use crate::message::{BatchId, SequenceNumber};

/// One ledger entry, as persisted alongside the document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentBatchInfo {
    pub sequence_number: SequenceNumber,
    pub batch_id: BatchId,
}

/// Outcome of checking one inbound batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DuplicateCheck {
    Unique,
    Duplicate { other_sequence_number: SequenceNumber },
}

impl DuplicateCheck {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, DuplicateCheck::Duplicate { .. })
    }
}

#[derive(Debug, Default)]
pub struct DuplicateBatchDetector {
    batch_ids: HashMap<BatchId, SequenceNumber>,
    by_sequence_number: BTreeMap<SequenceNumber, BatchId>,
}

impl DuplicateBatchDetector {
    /// Build from a persisted ledger.
    pub fn new(recent: Vec<RecentBatchInfo>) -> Self {
        let mut detector = Self::default();
        for info in recent {
            detector.record(info.batch_id, info.sequence_number);
        }
        detector
    }

    /// Check an inbound batch, recording its id if unseen.
    pub fn process_inbound_batch(&mut self, batch: &InboundBatch) -> DuplicateCheck {
        self.check(
            batch.batch_id(),
            batch.sequence_number,
            batch.minimum_sequence_number,
        )
    }

    pub fn check(
        &mut self,
        batch_id: BatchId,
        sequence_number: SequenceNumber,
        minimum_sequence_number: SequenceNumber,
    ) -> DuplicateCheck {
        self.trim(minimum_sequence_number);

        if let Some(&other) = self.batch_ids.get(&batch_id) {
            if other == sequence_number {
                return DuplicateCheck::Unique;
            }
            return DuplicateCheck::Duplicate {
                other_sequence_number: other,
            };
        }

        self.record(batch_id, sequence_number);
        DuplicateCheck::Unique
    }

    fn record(&mut self, batch_id: BatchId, sequence_number: SequenceNumber) {
        self.by_sequence_number
            .insert(sequence_number, batch_id.clone());
        self.batch_ids.insert(batch_id, sequence_number);
    }

    /// Drop entries sequenced below the minimum sequence number.
    fn trim(&mut self, minimum_sequence_number: SequenceNumber) {
        let live = self.by_sequence_number.split_off(&minimum_sequence_number);
        for (_, batch_id) in std::mem::replace(&mut self.by_sequence_number, live) {
            self.batch_ids.remove(&batch_id);
        }
    }

    /// Ledger contents for the document summary, oldest first.
    pub fn get_recent_batch_info_for_summary(&self) -> Vec<RecentBatchInfo> {
        self.by_sequence_number
            .iter()
            .map(|(sequence_number, batch_id)| RecentBatchInfo {
                sequence_number: *sequence_number,
                batch_id: batch_id.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.batch_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch_ids.is_empty()
    }
}
