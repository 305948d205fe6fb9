//! Batch composition for continuous batching
//!
//! A tick builds at most one prefill batch and one decode batch. Both mix
//! rows from different sessions, so every requested logit row is tagged with
//! the session that owns it. Scheduling order rotates over context slots so
//! that no session is starved when a batch bound is smaller than the number
//! of ready sessions.

use crate::model::Logits;
use seqloop_common::error::{Result, SeqloopError};
use seqloop_proto::{SeqSlot, SessionId, TokenId};

/// One token written into the execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    /// Context row the token belongs to
    pub seq_slot: SeqSlot,

    /// Token to write
    pub token: TokenId,

    /// Position of the token inside its row
    pub position: u32,

    /// Whether the model must return logits for this entry
    pub want_logits: bool,
}

/// Ordered batch handed to the model's compute capability
///
/// Carries a parallel owner list: the n-th returned logit row belongs to
/// `logit_owners()[n]`.
#[derive(Debug, Clone)]
pub struct BatchDescriptor {
    entries: Vec<BatchEntry>,
    logit_owners: Vec<SessionId>,
    capacity: usize,
}

impl BatchDescriptor {
    /// Create an empty batch bounded to `capacity` entries
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            logit_owners: Vec::new(),
            capacity,
        }
    }

    /// Add a token that only needs to be written
    pub fn push_input(&mut self, seq_slot: SeqSlot, token: TokenId, position: u32) -> Result<()> {
        self.push(BatchEntry {
            seq_slot,
            token,
            position,
            want_logits: false,
        })
    }

    /// Add a token whose logits will be sampled for `owner`
    pub fn push_for_logits(
        &mut self,
        owner: SessionId,
        seq_slot: SeqSlot,
        token: TokenId,
        position: u32,
    ) -> Result<()> {
        self.push(BatchEntry {
            seq_slot,
            token,
            position,
            want_logits: true,
        })?;
        self.logit_owners.push(owner);
        Ok(())
    }

    fn push(&mut self, entry: BatchEntry) -> Result<()> {
        if self.entries.len() >= self.capacity {
            return Err(SeqloopError::internal(format!(
                "batch capacity {} exceeded",
                self.capacity
            )));
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Entries in submission order
    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    /// Owners of the requested logit rows, in entry order
    pub fn logit_owners(&self) -> &[SessionId] {
        &self.logit_owners
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the batch is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries that still fit
    pub fn remaining(&self) -> usize {
        self.capacity - self.entries.len()
    }

    /// Pair returned logit rows with their owning sessions
    pub fn attribute(&self, rows: Vec<Logits>) -> Result<Vec<(SessionId, Logits)>> {
        if rows.len() != self.logit_owners.len() {
            return Err(SeqloopError::compute(format!(
                "model returned {} logit rows for {} requested",
                rows.len(),
                self.logit_owners.len()
            )));
        }
        Ok(self.logit_owners.iter().copied().zip(rows).collect())
    }
}

/// Rotating cursor over context slots
///
/// Candidates are visited starting at the first slot at or after the cursor,
/// wrapping around. Moving the cursor past the last scheduled slot gives every
/// ready session a turn within `ceil(ready / bound)` ticks.
#[derive(Debug, Clone, Default)]
pub struct RoundRobin {
    next: usize,
}

impl RoundRobin {
    /// Create a cursor at slot 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Order candidate slots for this tick
    pub fn schedule_order(&self, mut slots: Vec<SeqSlot>) -> Vec<SeqSlot> {
        slots.sort_unstable();
        let split = slots.partition_point(|slot| slot.index() < self.next);
        slots.rotate_left(split);
        slots
    }

    /// Start the next tick at `slot`
    pub fn resume_at(&mut self, slot: SeqSlot) {
        self.next = slot.index();
    }

    /// Start the next tick after `slot`
    pub fn resume_after(&mut self, slot: SeqSlot) {
        self.next = slot.index() + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slots(ids: &[u32]) -> Vec<SeqSlot> {
        ids.iter().copied().map(SeqSlot).collect()
    }

    #[test]
    fn test_batch_capacity() {
        let mut batch = BatchDescriptor::with_capacity(2);
        batch.push_input(SeqSlot(0), 1, 0).unwrap();
        batch.push_for_logits(SessionId(9), SeqSlot(1), 2, 5).unwrap();

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.remaining(), 0);
        assert!(batch.push_input(SeqSlot(0), 3, 1).is_err());
        assert_eq!(batch.logit_owners(), &[SessionId(9)]);
        assert!(batch.entries()[1].want_logits);
        assert!(!batch.entries()[0].want_logits);
    }

    #[test]
    fn test_attribute_pairs_rows_with_owners() {
        let mut batch = BatchDescriptor::with_capacity(4);
        batch.push_for_logits(SessionId(2), SeqSlot(1), 10, 0).unwrap();
        batch.push_input(SeqSlot(0), 11, 3).unwrap();
        batch.push_for_logits(SessionId(1), SeqSlot(0), 12, 4).unwrap();

        let pairs = batch.attribute(vec![vec![0.5], vec![1.5]]).unwrap();
        assert_eq!(pairs[0], (SessionId(2), vec![0.5]));
        assert_eq!(pairs[1], (SessionId(1), vec![1.5]));
    }

    #[test]
    fn test_attribute_rejects_row_count_mismatch() {
        let mut batch = BatchDescriptor::with_capacity(1);
        batch.push_for_logits(SessionId(1), SeqSlot(0), 1, 0).unwrap();

        let result = batch.attribute(vec![]);
        assert!(matches!(result, Err(SeqloopError::ComputeFailure(_))));
    }

    #[test]
    fn test_round_robin_rotation() {
        let mut cursor = RoundRobin::new();
        assert_eq!(cursor.schedule_order(slots(&[2, 0, 1])), slots(&[0, 1, 2]));

        cursor.resume_after(SeqSlot(0));
        assert_eq!(cursor.schedule_order(slots(&[0, 1, 2])), slots(&[1, 2, 0]));

        cursor.resume_after(SeqSlot(2));
        assert_eq!(cursor.schedule_order(slots(&[0, 1, 2])), slots(&[0, 1, 2]));

        cursor.resume_at(SeqSlot(2));
        assert_eq!(cursor.schedule_order(slots(&[0, 2, 5])), slots(&[2, 5, 0]));
    }

    #[test]
    fn test_round_robin_bounded_starvation() {
        // One decode slot per tick, four ready sessions.
        let ready = slots(&[0, 1, 2, 3]);
        let mut cursor = RoundRobin::new();
        let mut served = Vec::new();

        for _ in 0..ready.len() {
            let pick = cursor.schedule_order(ready.clone())[0];
            cursor.resume_after(pick);
            served.push(pick);
        }

        served.sort_unstable();
        assert_eq!(served, ready);
    }
}
