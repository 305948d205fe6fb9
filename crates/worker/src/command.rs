//! Commands accepted by a worker thread

use crate::stream::StreamSink;
use seqloop_common::config::SamplingConfig;
use seqloop_common::error::Result;
use seqloop_proto::{SeqSlot, SessionId, SessionSnapshot, WorkerStatus};
use tokio::sync::oneshot;

/// Reply channel for a command
pub type Ack<T> = oneshot::Sender<Result<T>>;

/// Result of ending a session on its worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOutcome {
    /// Session was live and its slot is now free
    Removed,
    /// Session was not present
    AlreadyGone,
}

/// Message from the router to one worker
#[derive(Debug)]
pub enum WorkerCommand {
    /// Allocate a slot for a new session
    CreateSession {
        session_id: SessionId,
        sampling: SamplingConfig,
        ack: Ack<SeqSlot>,
    },

    /// Tokenize and queue text; acked with the number of tokens queued
    AppendInput {
        session_id: SessionId,
        text_delta: String,
        ack: Ack<usize>,
    },

    /// Start a generation that reports through `sink`
    Generate {
        session_id: SessionId,
        max_new_tokens: u32,
        sink: StreamSink,
    },

    /// Flag the active generation for cancellation; acked with whether one existed
    Cancel {
        session_id: SessionId,
        ack: Ack<bool>,
    },

    /// Drop the session and its context rows
    EndSession {
        session_id: SessionId,
        ack: Ack<EndOutcome>,
    },

    Snapshot {
        session_id: SessionId,
        ack: Ack<SessionSnapshot>,
    },

    Status {
        ack: Ack<WorkerStatus>,
    },

    /// Finish live generations and exit the loop
    Shutdown,
}

impl WorkerCommand {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerCommand::CreateSession { .. } => "create_session",
            WorkerCommand::AppendInput { .. } => "append_input",
            WorkerCommand::Generate { .. } => "generate",
            WorkerCommand::Cancel { .. } => "cancel",
            WorkerCommand::EndSession { .. } => "end_session",
            WorkerCommand::Snapshot { .. } => "snapshot",
            WorkerCommand::Status { .. } => "status",
            WorkerCommand::Shutdown => "shutdown",
        }
    }
}
