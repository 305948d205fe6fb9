//! Deterministic byte-level reference backend
//!
//! Used by the demo binary, benches and tests. Tokens 0..=255 are raw bytes
//! and [`END_OF_GENERATION`] closes a generation. The context keeps one token
//! row per slot and refuses any write that is not at the row's current length,
//! so a skipped or repeated position surfaces as a compute failure.
//!
//! Logits peak on a lowercase letter chosen from a hash of the row tail, so
//! greedy decoding is a pure function of a session's own history.

use crate::batching::BatchDescriptor;
use crate::model::{ExecutionContext, Logits, ModelBackend};
use seqloop_common::error::{Result, SeqloopError};
use seqloop_proto::{SeqSlot, TokenId};
use std::collections::HashMap;
use std::time::Duration;

/// End-of-generation token id
pub const END_OF_GENERATION: TokenId = 256;

const VOCAB_SIZE: usize = 257;
const HASH_WINDOW: usize = 16;
const PEAK_LOGIT: f32 = 10.0;
const LETTER_LOGIT: f32 = 1.0;
const EOG_LOGIT: f32 = 20.0;

/// Byte-level toy model
#[derive(Debug, Clone, Default)]
pub struct ByteLevelModel {
    eos_after: Option<usize>,
    fail_on: Option<u8>,
    step_delay: Option<Duration>,
}

impl ByteLevelModel {
    /// Create a model that never ends a generation by itself
    pub fn new() -> Self {
        Self::default()
    }

    /// Favor end-of-generation once a row holds `tokens` tokens
    pub fn with_eos_after(mut self, tokens: usize) -> Self {
        self.eos_after = Some(tokens);
        self
    }

    /// Fail every compute call whose batch contains `byte`
    pub fn with_failure_on(mut self, byte: u8) -> Self {
        self.fail_on = Some(byte);
        self
    }

    /// Sleep this long in every compute call
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = Some(delay);
        self
    }

    fn logits_for(&self, row: &[TokenId]) -> Logits {
        let mut logits = vec![f32::NEG_INFINITY; VOCAB_SIZE];
        for letter in b'a'..=b'z' {
            logits[letter as usize] = LETTER_LOGIT;
        }

        let tail = &row[row.len().saturating_sub(HASH_WINDOW)..];
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325 ^ row.len() as u64;
        for &token in tail {
            hash ^= token as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        let peak = b'a' + (hash % 26) as u8;
        logits[peak as usize] = PEAK_LOGIT;

        if matches!(self.eos_after, Some(limit) if row.len() >= limit) {
            logits[END_OF_GENERATION as usize] = EOG_LOGIT;
        }
        logits
    }
}

/// Token rows for every slot of one worker
#[derive(Debug, Clone)]
pub struct ByteLevelContext {
    rows: Vec<Vec<TokenId>>,
}

impl ByteLevelContext {
    /// Tokens resident in `slot`
    pub fn row(&self, slot: SeqSlot) -> &[TokenId] {
        self.rows.get(slot.index()).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl ExecutionContext for ByteLevelContext {
    fn n_slots(&self) -> usize {
        self.rows.len()
    }

    fn resident_len(&self, slot: SeqSlot) -> usize {
        self.row(slot).len()
    }

    fn remove_slot(&mut self, slot: SeqSlot) {
        if let Some(row) = self.rows.get_mut(slot.index()) {
            row.clear();
        }
    }
}

impl ModelBackend for ByteLevelModel {
    type Context = ByteLevelContext;

    fn name(&self) -> &str {
        "byte-level"
    }

    fn vocab_size(&self) -> usize {
        VOCAB_SIZE
    }

    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>> {
        Ok(text.bytes().map(TokenId::from).collect())
    }

    fn detokenize(&self, tokens: &[TokenId]) -> Result<String> {
        let mut bytes = Vec::with_capacity(tokens.len());
        for &token in tokens {
            match token {
                0..=255 => bytes.push(token as u8),
                END_OF_GENERATION => {}
                _ => {
                    return Err(SeqloopError::tokenization(format!(
                        "token {} outside vocabulary",
                        token
                    )))
                }
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == END_OF_GENERATION
    }

    fn new_context(&self, n_slots: usize) -> Result<Self::Context> {
        Ok(ByteLevelContext {
            rows: vec![Vec::new(); n_slots],
        })
    }

    fn compute(&self, context: &mut Self::Context, batch: &BatchDescriptor) -> Result<Vec<Logits>> {
        if let Some(delay) = self.step_delay {
            std::thread::sleep(delay);
        }

        // Validate the whole batch before writing anything.
        let mut next_position: HashMap<SeqSlot, usize> = HashMap::new();
        for entry in batch.entries() {
            let row = context.rows.get(entry.seq_slot.index()).ok_or_else(|| {
                SeqloopError::compute(format!("{} outside context", entry.seq_slot))
            })?;
            if entry.token as usize >= VOCAB_SIZE {
                return Err(SeqloopError::compute(format!(
                    "token {} outside vocabulary",
                    entry.token
                )));
            }
            if matches!(self.fail_on, Some(byte) if entry.token == byte as TokenId) {
                return Err(SeqloopError::compute(format!(
                    "injected failure on token {}",
                    entry.token
                )));
            }
            let expected = next_position.entry(entry.seq_slot).or_insert(row.len());
            if entry.position as usize != *expected {
                return Err(SeqloopError::compute(format!(
                    "{} expected position {}, got {}",
                    entry.seq_slot, expected, entry.position
                )));
            }
            *expected += 1;
        }

        let mut logits = Vec::with_capacity(batch.logit_owners().len());
        for entry in batch.entries() {
            let row = &mut context.rows[entry.seq_slot.index()];
            row.push(entry.token);
            if entry.want_logits {
                logits.push(self.logits_for(row));
            }
        }
        Ok(logits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqloop_proto::SessionId;

    #[test]
    fn test_tokenize_roundtrip_ascii() {
        let model = ByteLevelModel::new();
        let tokens = model.tokenize("hello").unwrap();
        assert_eq!(tokens, vec![104, 101, 108, 108, 111]);
        assert_eq!(model.detokenize(&tokens).unwrap(), "hello");
    }

    #[test]
    fn test_detokenize_skips_end_of_generation() {
        let model = ByteLevelModel::new();
        assert_eq!(model.detokenize(&[104, END_OF_GENERATION]).unwrap(), "h");
        assert!(model.detokenize(&[999]).is_err());
    }

    #[test]
    fn test_compute_writes_rows_and_returns_requested_logits() {
        let model = ByteLevelModel::new();
        let mut ctx = model.new_context(2).unwrap();

        let mut batch = BatchDescriptor::with_capacity(8);
        batch.push_input(SeqSlot(0), 1, 0).unwrap();
        batch.push_for_logits(SessionId(1), SeqSlot(0), 2, 1).unwrap();
        batch.push_for_logits(SessionId(2), SeqSlot(1), 3, 0).unwrap();

        let logits = model.compute(&mut ctx, &batch).unwrap();
        assert_eq!(logits.len(), 2);
        assert_eq!(logits[0].len(), model.vocab_size());
        assert_eq!(ctx.row(SeqSlot(0)), &[1, 2]);
        assert_eq!(ctx.row(SeqSlot(1)), &[3]);
    }

    #[test]
    fn test_compute_enforces_position_discipline() {
        let model = ByteLevelModel::new();
        let mut ctx = model.new_context(1).unwrap();

        let mut skip = BatchDescriptor::with_capacity(1);
        skip.push_input(SeqSlot(0), 1, 1).unwrap();
        assert!(matches!(
            model.compute(&mut ctx, &skip),
            Err(SeqloopError::ComputeFailure(_))
        ));
        assert_eq!(ctx.resident_len(SeqSlot(0)), 0);

        let mut first = BatchDescriptor::with_capacity(1);
        first.push_input(SeqSlot(0), 1, 0).unwrap();
        model.compute(&mut ctx, &first).unwrap();

        // Writing position 0 again is a double write.
        assert!(model.compute(&mut ctx, &first).is_err());
        assert_eq!(ctx.resident_len(SeqSlot(0)), 1);
    }

    #[test]
    fn test_failed_batch_writes_nothing() {
        let model = ByteLevelModel::new().with_failure_on(b'!');
        let mut ctx = model.new_context(2).unwrap();

        let mut batch = BatchDescriptor::with_capacity(4);
        batch.push_input(SeqSlot(0), b'a' as TokenId, 0).unwrap();
        batch.push_input(SeqSlot(1), b'!' as TokenId, 0).unwrap();

        assert!(model.compute(&mut ctx, &batch).is_err());
        assert_eq!(ctx.resident_len(SeqSlot(0)), 0);
        assert_eq!(ctx.resident_len(SeqSlot(1)), 0);
    }

    #[test]
    fn test_remove_slot_is_scoped() {
        let model = ByteLevelModel::new();
        let mut ctx = model.new_context(2).unwrap();

        let mut batch = BatchDescriptor::with_capacity(2);
        batch.push_input(SeqSlot(0), 1, 0).unwrap();
        batch.push_input(SeqSlot(1), 2, 0).unwrap();
        model.compute(&mut ctx, &batch).unwrap();

        ctx.remove_slot(SeqSlot(0));
        assert_eq!(ctx.resident_len(SeqSlot(0)), 0);
        assert_eq!(ctx.row(SeqSlot(1)), &[2]);
    }

    #[test]
    fn test_logits_favor_letters_and_eos_after_limit() {
        let model = ByteLevelModel::new().with_eos_after(2);

        let short = model.logits_for(&[1]);
        assert_eq!(short[END_OF_GENERATION as usize], f32::NEG_INFINITY);
        let best = short
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert!((b'a' as usize..=b'z' as usize).contains(&best));

        let long = model.logits_for(&[1, 2]);
        assert_eq!(long[END_OF_GENERATION as usize], EOG_LOGIT);
    }
}
