//! Model capability seam
//!
//! Weights, tokenizer and the batch compute primitive live behind
//! [`ModelBackend`]. One backend instance is loaded once and shared read-only
//! by every worker through [`SharedModel`]; each worker creates its own
//! [`ExecutionContext`] on its own thread and is the only caller of
//! `compute` against it.

use crate::batching::BatchDescriptor;
use seqloop_common::error::Result;
use seqloop_proto::{SeqSlot, TokenId};
use std::sync::Arc;

/// Logit row over the vocabulary
pub type Logits = Vec<f32>;

/// Read-only model handle shared by all workers
pub type SharedModel<M> = Arc<M>;

/// Mutable decode state owned by exactly one worker
///
/// Organized as fixed slots, one token row per session. Not required to be
/// `Send`: contexts are created on the worker thread and never leave it.
pub trait ExecutionContext: 'static {
    /// Number of slots the context was created with
    fn n_slots(&self) -> usize;

    /// Tokens currently resident in `slot`
    fn resident_len(&self, slot: SeqSlot) -> usize;

    /// Drop every row of `slot`, leaving all other slots untouched
    fn remove_slot(&mut self, slot: SeqSlot);
}

/// Loaded model: weights plus vocabulary
pub trait ModelBackend: Send + Sync + 'static {
    /// Per-worker execution context type
    type Context: ExecutionContext;

    /// Human-readable model name
    fn name(&self) -> &str;

    /// Vocabulary size (length of every logit row)
    fn vocab_size(&self) -> usize;

    /// Convert text into token ids
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>>;

    /// Convert token ids back into text
    fn detokenize(&self, tokens: &[TokenId]) -> Result<String>;

    /// Whether `token` ends a generation
    fn is_end_of_generation(&self, token: TokenId) -> bool;

    /// Create an execution context with `n_slots` session rows
    fn new_context(&self, n_slots: usize) -> Result<Self::Context>;

    /// Write every batch entry into the context and return one logit row per
    /// entry with `want_logits`, in entry order
    fn compute(&self, context: &mut Self::Context, batch: &BatchDescriptor) -> Result<Vec<Logits>>;
}
