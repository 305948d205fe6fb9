//! Per-session generation state
//!
//! A session is owned by exactly one worker and lives in that worker's slot
//! arena. The last pending token is never prefilled: it is the input of the
//! session's next decode step, and every sampled token is queued back as that
//! input. Each token therefore reaches the context exactly once, at the
//! session's current position.

use crate::sampler::SamplerState;
use crate::stream::{DeltaDecoder, StreamSink};
use seqloop_proto::{SeqSlot, SessionId, SessionPhase, TokenId};
use std::collections::VecDeque;

/// Active generation of one session
#[derive(Debug)]
pub struct Generation {
    /// Tokens still allowed
    pub budget_remaining: u32,

    /// Set by `cancel_generate`; observed on the next tick
    pub cancel_requested: bool,

    /// Tokens produced so far
    pub produced: u32,

    /// Caller's stream
    pub sink: StreamSink,

    /// Incremental detokenizer
    pub decoder: DeltaDecoder,
}

impl Generation {
    pub fn new(max_new_tokens: u32, sink: StreamSink) -> Self {
        Self {
            budget_remaining: max_new_tokens,
            cancel_requested: false,
            produced: 0,
            sink,
            decoder: DeltaDecoder::new(),
        }
    }
}

/// Conversation state pinned to one worker
#[derive(Debug)]
pub struct Session {
    pub session_id: SessionId,
    pub seq_slot: SeqSlot,

    /// Tokens of this session resident in the context
    pub position: u32,

    /// Tokens not yet written to the context
    pub pending_input: VecDeque<TokenId>,

    pub sampler: SamplerState,
    pub generation: Option<Generation>,

    /// Cause of input dropped by a failed prefill, reported by the next generation
    pub input_error: Option<String>,
}

impl Session {
    pub fn new(session_id: SessionId, seq_slot: SeqSlot, sampler: SamplerState) -> Self {
        Self {
            session_id,
            seq_slot,
            position: 0,
            pending_input: VecDeque::new(),
            sampler,
            generation: None,
            input_error: None,
        }
    }

    /// Current scheduling phase
    pub fn phase(&self) -> SessionPhase {
        if self.prefill_ready() > 0 {
            SessionPhase::Prefilling
        } else if self.generation.is_some() {
            SessionPhase::Generating
        } else {
            SessionPhase::Idle
        }
    }

    /// Queue tokenized input
    pub fn enqueue(&mut self, tokens: impl IntoIterator<Item = TokenId>) {
        self.pending_input.extend(tokens);
    }

    /// Tokens that may be written by prefill
    pub fn prefill_ready(&self) -> usize {
        self.pending_input.len().saturating_sub(1)
    }

    /// Whether this session takes part in the next decode batch
    pub fn decode_ready(&self) -> bool {
        self.pending_input.len() == 1
            && self
                .generation
                .as_ref()
                .is_some_and(|g| !g.cancel_requested && g.budget_remaining > 0)
    }

    /// Record that the first `count` pending tokens were written
    pub fn commit_prefill(&mut self, count: usize) {
        debug_assert!(count <= self.prefill_ready());
        self.pending_input.drain(..count);
        self.position += count as u32;
    }

    /// Drop the first `count` pending tokens without writing them
    pub fn discard_pending(&mut self, count: usize) {
        let count = count.min(self.pending_input.len());
        self.pending_input.drain(..count);
    }

    /// Record that the decode input token was written
    pub fn commit_decode(&mut self) -> Option<TokenId> {
        let token = self.pending_input.pop_front()?;
        self.position += 1;
        Some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqloop_common::config::SamplingConfig;
    use crate::stream::stream_channel;

    fn session() -> Session {
        Session::new(
            SessionId(1),
            SeqSlot(0),
            SamplerState::new(SamplingConfig::greedy()),
        )
    }

    #[test]
    fn test_phase_transitions() {
        let mut s = session();
        assert_eq!(s.phase(), SessionPhase::Idle);

        s.enqueue([1, 2, 3]);
        assert_eq!(s.phase(), SessionPhase::Prefilling);
        assert_eq!(s.prefill_ready(), 2);

        s.commit_prefill(2);
        assert_eq!(s.position, 2);
        assert_eq!(s.phase(), SessionPhase::Idle);
        assert!(!s.decode_ready());

        let (sink, _handle) = stream_channel(s.session_id, 4);
        s.generation = Some(Generation::new(3, sink));
        assert_eq!(s.phase(), SessionPhase::Generating);
        assert!(s.decode_ready());

        assert_eq!(s.commit_decode(), Some(3));
        assert_eq!(s.position, 3);
        assert!(!s.decode_ready());
    }

    #[test]
    fn test_cancelled_generation_is_not_decode_ready() {
        let mut s = session();
        s.enqueue([1]);
        let (sink, _handle) = stream_channel(s.session_id, 4);
        let mut generation = Generation::new(3, sink);
        generation.cancel_requested = true;
        s.generation = Some(generation);
        assert!(!s.decode_ready());
    }

    #[test]
    fn test_discard_pending_keeps_position() {
        let mut s = session();
        s.enqueue([1, 2, 3]);
        s.discard_pending(2);
        assert_eq!(s.position, 0);
        assert_eq!(s.pending_input, VecDeque::from(vec![3]));
        s.discard_pending(5);
        assert!(s.pending_input.is_empty());
    }
}
