//! Inference worker loop
//!
//! Each worker thread exclusively owns one execution context and every
//! session pinned to it. The loop alternates between draining commands and
//! running a scheduling tick:
//!
//! ```text
//! commands ─► handle_command ─┐
//!                             ▼
//!          ┌─► sweep ─► prefill batch ─► decode batch ─► sample/stream ─┐
//!          └──────────────── idle backoff when nothing ran ◄────────────┘
//! ```
//!
//! No other thread ever calls `compute` against the context.

use crate::batching::{BatchDescriptor, RoundRobin};
use crate::command::{EndOutcome, WorkerCommand};
use crate::model::{ExecutionContext, ModelBackend, SharedModel};
use crate::sampler::SamplerState;
use crate::session::{Generation, Session};
use crate::slots::SlotArena;
use crate::stream::{ChunkDelivery, StreamSink};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use seqloop_common::config::{SamplingConfig, WorkerConfig};
use seqloop_common::error::{Result, SeqloopError};
use seqloop_common::metrics::METRICS;
use seqloop_proto::{
    FinishReason, SeqSlot, SessionId, SessionSnapshot, StreamEvent, TokenId, WorkerId,
    WorkerStatus,
};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

/// What one tick accomplished
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TickReport {
    /// Sessions whose input was written, with token counts
    pub prefilled: Vec<(SessionId, usize)>,

    /// Sessions that received a token
    pub decoded: Vec<SessionId>,

    /// Generations that reached a terminal event
    pub finished: Vec<(SessionId, StreamEvent)>,
}

impl TickReport {
    /// Whether the loop should tick again without waiting
    pub fn did_work(&self) -> bool {
        !self.prefilled.is_empty() || !self.decoded.is_empty() || !self.finished.is_empty()
    }
}

/// Single-threaded owner of one execution context
pub struct InferenceWorker<M: ModelBackend> {
    worker_id: WorkerId,
    model: SharedModel<M>,
    context: M::Context,
    config: WorkerConfig,
    sessions: SlotArena<Session>,
    index: HashMap<SessionId, SeqSlot>,
    prefill_cursor: RoundRobin,
    decode_cursor: RoundRobin,
    ticks: u64,
}

impl<M: ModelBackend> InferenceWorker<M> {
    /// Create a worker around a freshly created context
    pub fn new(
        worker_id: WorkerId,
        model: SharedModel<M>,
        context: M::Context,
        config: WorkerConfig,
    ) -> Self {
        let slots = config.max_sessions.min(context.n_slots());
        Self {
            worker_id,
            model,
            context,
            config,
            sessions: SlotArena::new(slots),
            index: HashMap::new(),
            prefill_cursor: RoundRobin::new(),
            decode_cursor: RoundRobin::new(),
            ticks: 0,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Execution context, for inspection
    pub fn context(&self) -> &M::Context {
        &self.context
    }

    /// Apply one command; `Break` ends the loop
    pub fn handle_command(&mut self, command: WorkerCommand) -> ControlFlow<()> {
        trace!("{} handling {}", self.worker_id, command.kind());
        match command {
            WorkerCommand::CreateSession {
                session_id,
                sampling,
                ack,
            } => {
                let _ = ack.send(self.create_session(session_id, sampling));
            }
            WorkerCommand::AppendInput {
                session_id,
                text_delta,
                ack,
            } => {
                let _ = ack.send(self.append_input(session_id, &text_delta));
            }
            WorkerCommand::Generate {
                session_id,
                max_new_tokens,
                sink,
            } => self.start_generation(session_id, max_new_tokens, sink),
            WorkerCommand::Cancel { session_id, ack } => {
                let _ = ack.send(Ok(self.cancel(session_id)));
            }
            WorkerCommand::EndSession { session_id, ack } => {
                let _ = ack.send(Ok(self.end_session(session_id)));
            }
            WorkerCommand::Snapshot { session_id, ack } => {
                let _ = ack.send(self.snapshot(session_id));
            }
            WorkerCommand::Status { ack } => {
                let _ = ack.send(Ok(self.status()));
            }
            WorkerCommand::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    fn create_session(
        &mut self,
        session_id: SessionId,
        sampling: SamplingConfig,
    ) -> Result<SeqSlot> {
        if self.index.contains_key(&session_id) {
            return Err(SeqloopError::internal(format!(
                "{} already exists on {}",
                session_id, self.worker_id
            )));
        }
        sampling.validate()?;

        let slot = self
            .sessions
            .insert_with(|slot| Session::new(session_id, slot, SamplerState::new(sampling)))
            .ok_or(SeqloopError::WorkerAtCapacity {
                worker_id: self.worker_id,
                capacity: self.sessions.capacity(),
            })?;
        self.index.insert(session_id, slot);
        METRICS.worker.active_sessions.inc();

        debug!("{} created {} in {}", self.worker_id, session_id, slot);
        Ok(slot)
    }

    fn append_input(&mut self, session_id: SessionId, text_delta: &str) -> Result<usize> {
        let slot = self.slot_of(session_id)?;
        let tokens = self.model.tokenize(text_delta)?;
        let count = tokens.len();
        if let Some(session) = self.sessions.get_mut(slot) {
            session.enqueue(tokens);
        }
        trace!("{} queued {} tokens", session_id, count);
        Ok(count)
    }

    fn start_generation(
        &mut self,
        session_id: SessionId,
        max_new_tokens: u32,
        sink: StreamSink,
    ) {
        let Some(session) = self
            .index
            .get(&session_id)
            .and_then(|slot| self.sessions.get_mut(*slot))
        else {
            sink.finish(StreamEvent::Error(
                SeqloopError::UnknownSession(session_id).to_string(),
            ));
            return;
        };

        if session.generation.is_some() {
            sink.finish(StreamEvent::Error(format!(
                "{} already has an active generation",
                session_id
            )));
            return;
        }
        if let Some(cause) = session.input_error.take() {
            sink.finish(StreamEvent::Error(format!(
                "{} lost queued input: {}",
                session_id, cause
            )));
            return;
        }
        if session.pending_input.is_empty() {
            sink.finish(StreamEvent::Error(format!(
                "{} has no input to generate from",
                session_id
            )));
            return;
        }
        if max_new_tokens == 0 {
            METRICS
                .stream
                .generations_finished
                .with_label_values(&[FinishReason::Length.as_str()])
                .inc();
            sink.finish(StreamEvent::Done(FinishReason::Length));
            return;
        }

        session.generation = Some(Generation::new(max_new_tokens, sink));
        METRICS.worker.active_generations.inc();
        debug!(
            "{} generating up to {} tokens",
            session_id, max_new_tokens
        );
    }

    fn cancel(&mut self, session_id: SessionId) -> bool {
        let generation = self
            .index
            .get(&session_id)
            .and_then(|slot| self.sessions.get_mut(*slot))
            .and_then(|session| session.generation.as_mut());
        match generation {
            Some(generation) => {
                generation.cancel_requested = true;
                true
            }
            None => false,
        }
    }

    fn end_session(&mut self, session_id: SessionId) -> EndOutcome {
        let Some(slot) = self.index.remove(&session_id) else {
            return EndOutcome::AlreadyGone;
        };
        if let Some(mut session) = self.sessions.remove(slot) {
            finish_generation(
                &*self.model,
                &mut session,
                StreamEvent::Done(FinishReason::SessionEnded),
            );
        }
        self.context.remove_slot(slot);
        METRICS.worker.active_sessions.dec();

        debug!("{} ended {}, freed {}", self.worker_id, session_id, slot);
        EndOutcome::Removed
    }

    /// Current state of one session
    pub fn snapshot(&self, session_id: SessionId) -> Result<SessionSnapshot> {
        let slot = self.slot_of(session_id)?;
        let session = self
            .sessions
            .get(slot)
            .ok_or(SeqloopError::UnknownSession(session_id))?;
        Ok(SessionSnapshot {
            session_id,
            worker_id: self.worker_id,
            seq_slot: slot,
            position: session.position,
            pending_tokens: session.pending_input.len(),
            resident_tokens: self.context.resident_len(slot),
            phase: session.phase(),
            sampler_draws: session.sampler.draws(),
        })
    }

    /// Load and counters of this worker
    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            worker_id: self.worker_id,
            sessions: self.sessions.len(),
            generating: self
                .sessions
                .iter()
                .filter(|(_, s)| s.generation.is_some())
                .count(),
            capacity: self.sessions.capacity(),
            ticks: self.ticks,
        }
    }

    fn slot_of(&self, session_id: SessionId) -> Result<SeqSlot> {
        self.index
            .get(&session_id)
            .copied()
            .ok_or(SeqloopError::UnknownSession(session_id))
    }

    /// Run one scheduling pass: sweep, prefill, decode
    pub fn tick(&mut self) -> TickReport {
        self.ticks += 1;
        let mut report = TickReport::default();

        self.sweep(&mut report);
        if let Err(e) = self.run_prefill(&mut report) {
            error!("{} prefill planning failed: {}", self.worker_id, e);
        }
        if let Err(e) = self.run_decode(&mut report) {
            error!("{} decode planning failed: {}", self.worker_id, e);
        }
        report
    }

    /// Finish generations that were cancelled or lost their consumer
    fn sweep(&mut self, report: &mut TickReport) {
        let model = &*self.model;
        for (_, session) in self.sessions.iter_mut() {
            let event = match &session.generation {
                Some(g) if g.cancel_requested => StreamEvent::Done(FinishReason::Cancelled),
                Some(g) if g.sink.is_closed() => StreamEvent::Done(FinishReason::SinkUnavailable),
                _ => continue,
            };
            finish_generation(model, session, event.clone());
            report.finished.push((session.session_id, event));
        }
    }

    fn run_prefill(&mut self, report: &mut TickReport) -> Result<()> {
        let ready: Vec<SeqSlot> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.prefill_ready() > 0)
            .map(|(slot, _)| slot)
            .collect();
        if ready.is_empty() {
            return Ok(());
        }

        let mut batch = BatchDescriptor::with_capacity(self.config.batching.max_prefill_tokens);
        let mut plan: Vec<(SeqSlot, usize)> = Vec::new();
        for slot in self.prefill_cursor.schedule_order(ready) {
            if batch.remaining() == 0 {
                break;
            }
            let Some(session) = self.sessions.get(slot) else {
                continue;
            };
            let take = session.prefill_ready().min(batch.remaining());
            for (offset, &token) in session.pending_input.iter().take(take).enumerate() {
                batch.push_input(slot, token, session.position + offset as u32)?;
            }
            plan.push((slot, take));
            if take < session.prefill_ready() {
                self.prefill_cursor.resume_at(slot);
            } else {
                self.prefill_cursor.resume_after(slot);
            }
        }

        METRICS.worker.prefill_batch_tokens.observe(batch.len() as f64);
        let timer = METRICS.worker.compute_duration.start_timer();
        let result = self.model.compute(&mut self.context, &batch);
        timer.observe_duration();

        let model = &*self.model;
        match result {
            Ok(_) => {
                for (slot, count) in plan {
                    if let Some(session) = self.sessions.get_mut(slot) {
                        session.commit_prefill(count);
                        report.prefilled.push((session.session_id, count));
                    }
                }
                METRICS
                    .worker
                    .tokens_prefilled_total
                    .inc_by(batch.len() as u64);
                trace!(
                    "{} prefilled {} tokens across {} sessions",
                    self.worker_id,
                    batch.len(),
                    report.prefilled.len()
                );
            }
            Err(e) => {
                METRICS.worker.compute_failures.inc();
                warn!(
                    "{} prefill of {} tokens failed: {}",
                    self.worker_id,
                    batch.len(),
                    e
                );
                for (slot, count) in plan {
                    if let Some(session) = self.sessions.get_mut(slot) {
                        session.discard_pending(count);
                        if session.generation.is_some() {
                            let event = StreamEvent::Error(e.to_string());
                            finish_generation(model, session, event.clone());
                            report.finished.push((session.session_id, event));
                        } else {
                            session.input_error = Some(e.to_string());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn run_decode(&mut self, report: &mut TickReport) -> Result<()> {
        let ready: Vec<SeqSlot> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.decode_ready())
            .map(|(slot, _)| slot)
            .collect();
        if ready.is_empty() {
            return Ok(());
        }

        let bound = self.config.batching.max_decode_sequences;
        let mut batch = BatchDescriptor::with_capacity(bound);
        for slot in self.decode_cursor.schedule_order(ready).into_iter().take(bound) {
            let Some(session) = self.sessions.get(slot) else {
                continue;
            };
            let Some(&token) = session.pending_input.front() else {
                continue;
            };
            batch.push_for_logits(session.session_id, slot, token, session.position)?;
            self.decode_cursor.resume_after(slot);
        }

        METRICS
            .worker
            .decode_batch_sequences
            .observe(batch.len() as f64);
        let timer = METRICS.worker.compute_duration.start_timer();
        let result = self
            .model
            .compute(&mut self.context, &batch)
            .and_then(|rows| batch.attribute(rows));
        timer.observe_duration();

        let model = &*self.model;
        let rows = match result {
            Ok(rows) => rows,
            Err(e) => {
                METRICS.worker.compute_failures.inc();
                warn!(
                    "{} decode of {} sequences failed: {}",
                    self.worker_id,
                    batch.len(),
                    e
                );
                for owner in batch.logit_owners() {
                    let Some(session) = self
                        .index
                        .get(owner)
                        .and_then(|slot| self.sessions.get_mut(*slot))
                    else {
                        continue;
                    };
                    let event = StreamEvent::Error(e.to_string());
                    finish_generation(model, session, event.clone());
                    report.finished.push((*owner, event));
                }
                return Ok(());
            }
        };

        for (owner, logits) in rows {
            let Some(session) = self
                .index
                .get(&owner)
                .and_then(|slot| self.sessions.get_mut(*slot))
            else {
                continue;
            };
            session.commit_decode();
            report.decoded.push(owner);

            let token = match session.sampler.sample(&logits) {
                Ok(token) => token,
                Err(e) => {
                    let event = StreamEvent::Error(e.to_string());
                    finish_generation(model, session, event.clone());
                    report.finished.push((owner, event));
                    continue;
                }
            };
            session.enqueue([token]);
            METRICS.worker.tokens_generated_total.inc();

            if let Some(event) = advance_generation(model, session, token) {
                finish_generation(model, session, event.clone());
                report.finished.push((owner, event));
            }
        }
        Ok(())
    }

    /// Main loop; returns after `Shutdown` or once every sender is gone
    pub fn run(mut self, commands: Receiver<WorkerCommand>) {
        info!(
            "{} running {} with {} slots",
            self.worker_id,
            self.model.name(),
            self.sessions.capacity()
        );
        let backoff = self.config.batching.idle_backoff();

        'outer: loop {
            loop {
                match commands.try_recv() {
                    Ok(command) => {
                        if self.handle_command(command).is_break() {
                            break 'outer;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break 'outer,
                }
            }

            if self.tick().did_work() {
                continue;
            }

            match commands.recv_timeout(backoff) {
                Ok(command) => {
                    if self.handle_command(command).is_break() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.shutdown();
    }

    /// Terminate live generations and release every session
    pub fn shutdown(&mut self) {
        let model = &*self.model;
        let mut released = 0;
        for (_, session) in self.sessions.iter_mut() {
            finish_generation(model, session, StreamEvent::Done(FinishReason::Shutdown));
            released += 1;
        }
        for (_, slot) in self.index.drain() {
            self.sessions.remove(slot);
            self.context.remove_slot(slot);
        }
        METRICS.worker.active_sessions.sub(released);
        info!(
            "{} stopped after {} ticks, released {} sessions",
            self.worker_id, self.ticks, released
        );
    }
}

/// Book-keep one sampled token; returns the terminal event if the generation is over
fn advance_generation<M: ModelBackend>(
    model: &M,
    session: &mut Session,
    token: TokenId,
) -> Option<StreamEvent> {
    let generation = session.generation.as_mut()?;
    generation.budget_remaining = generation.budget_remaining.saturating_sub(1);
    generation.produced += 1;

    if model.is_end_of_generation(token) {
        return Some(StreamEvent::Done(FinishReason::EndOfGeneration));
    }

    match generation.decoder.push(model, token) {
        Ok(Some(text)) => match generation.sink.try_chunk(text) {
            ChunkDelivery::Sent => {}
            ChunkDelivery::Full | ChunkDelivery::Closed => {
                return Some(StreamEvent::Done(FinishReason::SinkUnavailable));
            }
        },
        Ok(None) => {}
        Err(e) => return Some(StreamEvent::Error(e.to_string())),
    }

    if generation.budget_remaining == 0 {
        return Some(StreamEvent::Done(FinishReason::Length));
    }
    None
}

/// Close a session's generation with `event`, flushing held text first
fn finish_generation<M: ModelBackend>(model: &M, session: &mut Session, event: StreamEvent) {
    let Some(mut generation) = session.generation.take() else {
        return;
    };

    if matches!(event, StreamEvent::Done(_)) {
        match generation.decoder.flush(model) {
            Ok(Some(text)) => {
                let _ = generation.sink.try_chunk(text);
            }
            Ok(None) => {}
            Err(e) => warn!("{} dropped held text: {}", session.session_id, e),
        }
    }

    match &event {
        StreamEvent::Done(reason) => METRICS
            .stream
            .generations_finished
            .with_label_values(&[reason.as_str()])
            .inc(),
        StreamEvent::Error(_) => METRICS.stream.generations_failed.inc(),
        StreamEvent::Chunk(_) => {}
    }
    METRICS.worker.active_generations.dec();

    debug!(
        "{} finished after {} tokens: {:?}",
        session.session_id, generation.produced, event
    );
    generation.sink.finish(event);
}

/// Router-side handle to a worker thread
#[derive(Debug)]
pub struct WorkerHandle {
    worker_id: WorkerId,
    commands: Sender<WorkerCommand>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn a worker thread
    ///
    /// The context is created on the new thread; the returned receiver
    /// resolves once that succeeded or failed.
    pub fn spawn<M: ModelBackend>(
        worker_id: WorkerId,
        model: SharedModel<M>,
        config: WorkerConfig,
    ) -> Result<(Self, oneshot::Receiver<Result<()>>)> {
        let (tx, rx) = channel::bounded(config.command_queue_size);
        let (ready_tx, ready_rx) = oneshot::channel();

        let thread = std::thread::Builder::new()
            .name(format!("seqloop-worker-{}", worker_id.0))
            .spawn(move || {
                let context = match model.new_context(config.max_sessions) {
                    Ok(context) => context,
                    Err(e) => {
                        error!("{} failed to create context: {}", worker_id, e);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let worker = InferenceWorker::new(worker_id, model, context, config);
                let _ = ready_tx.send(Ok(()));
                worker.run(rx);
            })?;

        Ok((
            Self {
                worker_id,
                commands: tx,
                thread: Some(thread),
            },
            ready_rx,
        ))
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Enqueue a command without blocking
    pub fn try_send(&self, command: WorkerCommand) -> Result<()> {
        self.commands.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => {
                SeqloopError::queue_full(format!("{} command queue", self.worker_id))
            }
            TrySendError::Disconnected(_) => {
                SeqloopError::worker_unavailable(format!("{} has stopped", self.worker_id))
            }
        })
    }

    /// Close the command queue and wait for the worker thread to exit
    ///
    /// The worker drains queued commands, then stops on the disconnect, so
    /// this returns even when a `Shutdown` could not be enqueued.
    pub fn join(self) -> Result<()> {
        let Self {
            worker_id,
            commands,
            thread,
        } = self;
        drop(commands);
        match thread {
            Some(thread) => thread
                .join()
                .map_err(|_| SeqloopError::internal(format!("{} panicked", worker_id))),
            None => Ok(()),
        }
    }
}
