//! Seqloop Worker
//!
//! Inference worker that exclusively owns one execution context and runs a
//! continuous-batching loop over every session pinned to it. Prefill and
//! decode rows from different sessions share batches; each session keeps its
//! own context slot, position counter and sampler.

pub mod batching;
pub mod command;
pub mod inference;
pub mod model;
pub mod reference;
pub mod sampler;
pub mod session;
pub mod slots;
pub mod stream;

pub use batching::{BatchDescriptor, BatchEntry, RoundRobin};
pub use command::{Ack, EndOutcome, WorkerCommand};
pub use inference::{InferenceWorker, TickReport, WorkerHandle};
pub use model::{ExecutionContext, Logits, ModelBackend, SharedModel};
pub use reference::{ByteLevelModel, END_OF_GENERATION};
pub use sampler::SamplerState;
pub use stream::{stream_channel, CollectedStream, StreamHandle, StreamSink};
