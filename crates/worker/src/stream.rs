//! Per-generation output streams
//!
//! The worker holds a [`StreamSink`], the caller holds the matching
//! [`StreamHandle`]. Chunks are only sent while two slots are free, so the
//! terminal event always fits and every stream ends with exactly one
//! `Done` or `Error`.

use crate::model::ModelBackend;
use seqloop_common::error::Result;
use seqloop_proto::{SessionId, StreamEvent, TokenId};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_stream::wrappers::ReceiverStream;

/// Tokens held back at most while waiting for a multi-byte character
const MAX_HELD_TOKENS: usize = 4;

/// Create a connected sink and handle with room for `capacity` events
pub fn stream_channel(session_id: SessionId, capacity: usize) -> (StreamSink, StreamHandle) {
    let (tx, rx) = mpsc::channel(capacity.max(2));
    (
        StreamSink { session_id, tx },
        StreamHandle { session_id, rx },
    )
}

/// Outcome of offering a chunk to a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkDelivery {
    Sent,
    /// Consumer is not keeping up; only the terminal slot is left
    Full,
    /// Consumer dropped the handle
    Closed,
}

/// Worker side of a generation stream
#[derive(Debug)]
pub struct StreamSink {
    session_id: SessionId,
    tx: mpsc::Sender<StreamEvent>,
}

impl StreamSink {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Offer a text chunk without blocking
    pub fn try_chunk(&self, text: String) -> ChunkDelivery {
        if self.tx.is_closed() {
            return ChunkDelivery::Closed;
        }
        if self.tx.capacity() < 2 {
            return ChunkDelivery::Full;
        }
        match self.tx.try_send(StreamEvent::Chunk(text)) {
            Ok(()) => ChunkDelivery::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => ChunkDelivery::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => ChunkDelivery::Closed,
        }
    }

    /// Deliver the terminal event, consuming the sink
    ///
    /// Returns false if the consumer is gone.
    pub fn finish(self, event: StreamEvent) -> bool {
        debug_assert!(event.is_terminal());
        self.tx.try_send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Everything a finished stream delivered
#[derive(Debug, Clone, PartialEq)]
pub struct CollectedStream {
    /// Concatenated chunk text
    pub text: String,
    /// Number of chunks
    pub chunks: usize,
    /// `Done` or `Error`; `None` if the stream closed without one
    pub terminal: Option<StreamEvent>,
}

/// Caller side of a generation stream
#[derive(Debug)]
pub struct StreamHandle {
    session_id: SessionId,
    rx: mpsc::Receiver<StreamEvent>,
}

impl StreamHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Next event, or `None` once the stream is closed
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Next event if one is buffered
    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn into_stream(self) -> ReceiverStream<StreamEvent> {
        ReceiverStream::new(self.rx)
    }

    /// Drain the stream up to and including its terminal event
    pub async fn collect(mut self) -> CollectedStream {
        let mut collected = CollectedStream {
            text: String::new(),
            chunks: 0,
            terminal: None,
        };
        while let Some(event) = self.rx.recv().await {
            match event {
                StreamEvent::Chunk(text) => {
                    collected.text.push_str(&text);
                    collected.chunks += 1;
                }
                terminal => {
                    collected.terminal = Some(terminal);
                    break;
                }
            }
        }
        collected
    }
}

/// Incremental detokenizer for one generation
///
/// Text ending in a replacement character is held back until a later token
/// completes the character or [`MAX_HELD_TOKENS`] accumulate.
#[derive(Debug, Default)]
pub struct DeltaDecoder {
    held: Vec<TokenId>,
}

impl DeltaDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a generated token and return any text it completes
    pub fn push<M: ModelBackend>(&mut self, model: &M, token: TokenId) -> Result<Option<String>> {
        self.held.push(token);
        let text = model.detokenize(&self.held)?;
        if text.ends_with(char::REPLACEMENT_CHARACTER) && self.held.len() < MAX_HELD_TOKENS {
            return Ok(None);
        }
        self.held.clear();
        Ok(Some(text).filter(|t| !t.is_empty()))
    }

    /// Text of any held tokens
    pub fn flush<M: ModelBackend>(&mut self, model: &M) -> Result<Option<String>> {
        if self.held.is_empty() {
            return Ok(None);
        }
        let text = model.detokenize(&self.held)?;
        self.held.clear();
        Ok(Some(text).filter(|t| !t.is_empty()))
    }
}
