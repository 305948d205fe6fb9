//! Seqloop protocol types
//!
//! Plain data exchanged between callers, the router and inference workers.
//! Nothing in here owns a channel or a context, so a transport layer can
//! serialize these types as-is.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Token identifier in the model vocabulary
pub type TokenId = u32;

/// Globally unique session identifier
///
/// Minted by the router from a monotonically increasing counter and never
/// reused within one engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Index of an inference worker in the engine's worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Row of a session inside its worker's execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeqSlot(pub u32);

impl SeqSlot {
    /// Slot number as an index
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SeqSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// Why a generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// `max_new_tokens` budget exhausted
    Length,

    /// The model produced an end-of-generation token
    EndOfGeneration,

    /// `cancel_generate` was observed by the worker
    Cancelled,

    /// The stream consumer fell behind or went away
    SinkUnavailable,

    /// The session was ended while generating
    SessionEnded,

    /// The worker is shutting down
    Shutdown,
}

impl FinishReason {
    /// Stable label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Length => "length",
            FinishReason::EndOfGeneration => "end_of_generation",
            FinishReason::Cancelled => "cancelled",
            FinishReason::SinkUnavailable => "sink_unavailable",
            FinishReason::SessionEnded => "session_ended",
            FinishReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event on a generation stream
///
/// A stream carries any number of `Chunk`s followed by exactly one
/// terminal `Done` or `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental generated text
    Chunk(String),

    /// Generation completed
    Done(FinishReason),

    /// Generation failed
    Error(String),
}

impl StreamEvent {
    /// Whether this event ends the stream
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Chunk(_))
    }
}

/// Scheduling phase of a session inside its worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Nothing to do until more input or a generation request arrives
    Idle,

    /// Queued input is being written into the context
    Prefilling,

    /// One token per tick is being produced
    Generating,
}

/// Point-in-time view of a session, taken on its worker thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub worker_id: WorkerId,
    pub seq_slot: SeqSlot,

    /// Tokens written into the context for this session
    pub position: u32,

    /// Tokens queued but not yet written
    pub pending_tokens: usize,

    /// Row length reported by the execution context
    pub resident_tokens: usize,

    pub phase: SessionPhase,

    /// Number of tokens drawn from this session's sampler
    pub sampler_draws: u64,
}

/// Point-in-time view of a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: WorkerId,

    /// Sessions pinned to this worker
    pub sessions: usize,

    /// Sessions with an active generation
    pub generating: usize,

    /// Maximum number of sessions (context slots)
    pub capacity: usize,

    /// Scheduling ticks that did work
    pub ticks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_events() {
        assert!(!StreamEvent::Chunk("a".into()).is_terminal());
        assert!(StreamEvent::Done(FinishReason::Length).is_terminal());
        assert!(StreamEvent::Error("boom".into()).is_terminal());
    }

    #[test]
    fn test_stream_event_json_shape() {
        let json = serde_json::to_string(&StreamEvent::Done(FinishReason::Cancelled)).unwrap();
        assert_eq!(json, r#"{"type":"done","data":"cancelled"}"#);

        let json = serde_json::to_string(&StreamEvent::Chunk("hi".into())).unwrap();
        assert_eq!(json, r#"{"type":"chunk","data":"hi"}"#);
    }

    #[test]
    fn test_id_display() {
        assert_eq!(SessionId(7).to_string(), "session-7");
        assert_eq!(WorkerId(1).to_string(), "worker-1");
        assert_eq!(SeqSlot(3).to_string(), "slot-3");
        assert_eq!(SeqSlot(3).index(), 3);
    }
}
