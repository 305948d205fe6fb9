//! Ingress router
//!
//! A single task owns the `SessionId -> WorkerId` pinning table and is the
//! only writer of it. Administrative commands are processed one at a time in
//! arrival order, so commands for one session reach its worker in the order
//! they were submitted. Token payloads never pass through here; streams go
//! straight from the worker to the caller.

use crate::worker_client::WorkerClient;
use seqloop_common::config::{SamplingConfig, SeqloopConfig, WorkerSelection};
use seqloop_common::error::{Result, SeqloopError};
use seqloop_common::metrics::METRICS;
use seqloop_proto::{SessionId, SessionSnapshot, WorkerId, WorkerStatus};
use seqloop_worker::{stream_channel, EndOutcome, StreamHandle};
use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Reply channel for a router command
pub type Reply<T> = oneshot::Sender<Result<T>>;

/// Request from an [`Engine`](crate::Engine) handle to the router task
#[derive(Debug)]
pub enum RouterCommand {
    CreateSession {
        sampling: SamplingConfig,
        reply: Reply<SessionId>,
    },
    AppendInput {
        session_id: SessionId,
        text_delta: String,
        reply: Reply<usize>,
    },
    Generate {
        session_id: SessionId,
        max_new_tokens: u32,
        reply: Reply<StreamHandle>,
    },
    Cancel {
        session_id: SessionId,
        reply: Reply<()>,
    },
    EndSession {
        session_id: SessionId,
        reply: Reply<()>,
    },
    Snapshot {
        session_id: SessionId,
        reply: Reply<SessionSnapshot>,
    },
    Status {
        reply: Reply<Vec<WorkerStatus>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Routing view of one worker
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub worker_id: WorkerId,

    /// Sessions pinned to this worker
    pub sessions: usize,

    /// Cleared once the worker's queue is found disconnected
    pub healthy: bool,
}

impl WorkerInfo {
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            sessions: 0,
            healthy: true,
        }
    }

    /// Load score for routing (lower is better)
    pub fn load_score(&self) -> f64 {
        if !self.healthy {
            return f64::INFINITY;
        }
        self.sessions as f64
    }
}

/// Pinning table plus worker selection policy
pub struct Router {
    clients: Vec<WorkerClient>,
    workers: Vec<WorkerInfo>,
    sessions: HashMap<SessionId, WorkerId>,
    next_session: u64,
    /// Ids retired by a create that timed out; never handed to a caller
    abandoned: HashSet<SessionId>,
    cursor: usize,
    selection: WorkerSelection,
    stream_buffer_size: usize,
}

impl Router {
    pub fn new(clients: Vec<WorkerClient>, config: &SeqloopConfig) -> Self {
        let workers = clients
            .iter()
            .map(|client| WorkerInfo::new(client.worker_id()))
            .collect();
        Self {
            clients,
            workers,
            sessions: HashMap::new(),
            next_session: 1,
            abandoned: HashSet::new(),
            cursor: 0,
            selection: config.engine.selection,
            stream_buffer_size: config.worker.stream_buffer_size,
        }
    }

    /// Routing view of every worker
    pub fn workers(&self) -> &[WorkerInfo] {
        &self.workers
    }

    /// Worker a session is pinned to
    pub fn pinned_worker(&self, session_id: SessionId) -> Option<WorkerId> {
        self.sessions.get(&session_id).copied()
    }

    /// Pick the worker for a new session
    pub fn select_worker(&mut self) -> Result<usize> {
        let selected = match self.selection {
            WorkerSelection::RoundRobin => {
                let n = self.workers.len();
                let pick = (0..n)
                    .map(|offset| (self.cursor + offset) % n)
                    .find(|&index| self.workers[index].healthy);
                if let Some(index) = pick {
                    self.cursor = (index + 1) % n;
                }
                pick
            }
            WorkerSelection::LeastLoaded => self
                .workers
                .iter()
                .enumerate()
                .filter(|(_, w)| w.healthy)
                .min_by(|(_, a), (_, b)| a.load_score().total_cmp(&b.load_score()))
                .map(|(index, _)| index),
        };

        match selected {
            Some(index) => {
                debug!(
                    "Selected {} with {} sessions",
                    self.workers[index].worker_id, self.workers[index].sessions
                );
                Ok(index)
            }
            None => Err(SeqloopError::worker_unavailable(
                "No healthy workers available",
            )),
        }
    }

    /// Record a failed worker request
    fn mark_failed(&mut self, index: usize, error: &SeqloopError) {
        if !error.is_routing_failure() {
            return;
        }
        METRICS.router.routing_failures.inc();
        if matches!(error, SeqloopError::WorkerUnavailable(_)) && self.workers[index].healthy {
            self.workers[index].healthy = false;
            warn!("{} marked as unhealthy: {}", self.workers[index].worker_id, error);
        }
    }

    /// Worker index for an existing session
    fn route(&self, session_id: SessionId) -> Result<usize> {
        match self.sessions.get(&session_id) {
            Some(worker_id) => Ok(worker_id.0),
            None => {
                METRICS.router.unknown_session.inc();
                Err(SeqloopError::UnknownSession(session_id))
            }
        }
    }

    fn was_issued(&self, session_id: SessionId) -> bool {
        session_id.0 >= 1
            && session_id.0 < self.next_session
            && !self.abandoned.contains(&session_id)
    }

    pub async fn create_session(&mut self, sampling: SamplingConfig) -> Result<SessionId> {
        let index = self.select_worker()?;
        let session_id = SessionId(self.next_session);

        match self.clients[index].create_session(session_id, sampling).await {
            Ok(slot) => {
                self.next_session += 1;
                let worker_id = self.workers[index].worker_id;
                self.sessions.insert(session_id, worker_id);
                self.workers[index].sessions += 1;
                METRICS.router.sessions_created.inc();
                info!("Created {} on {} in {}", session_id, worker_id, slot);
                Ok(session_id)
            }
            Err(e) => {
                if matches!(e, SeqloopError::Timeout(_)) {
                    // The worker may still allocate the slot; release it and
                    // retire the id.
                    self.next_session += 1;
                    self.abandoned.insert(session_id);
                    if let Err(cleanup) = self.clients[index].end_session_detached(session_id) {
                        warn!("Could not release {} after timeout: {}", session_id, cleanup);
                    }
                }
                self.mark_failed(index, &e);
                Err(e)
            }
        }
    }

    pub async fn append_input(
        &mut self,
        session_id: SessionId,
        text_delta: String,
    ) -> Result<usize> {
        let index = self.route(session_id)?;
        let result = self.clients[index].append_input(session_id, text_delta).await;
        if let Err(e) = &result {
            self.mark_failed(index, e);
        }
        result
    }

    pub fn generate_stream(
        &mut self,
        session_id: SessionId,
        max_new_tokens: u32,
    ) -> Result<StreamHandle> {
        let index = self.route(session_id)?;
        let (sink, handle) = stream_channel(session_id, self.stream_buffer_size);
        if let Err(e) = self.clients[index].generate(session_id, max_new_tokens, sink) {
            self.mark_failed(index, &e);
            return Err(e);
        }
        debug!(
            "Forwarded generation for {} to {}",
            session_id, self.workers[index].worker_id
        );
        Ok(handle)
    }

    pub async fn cancel_generate(&mut self, session_id: SessionId) -> Result<()> {
        let index = self.route(session_id)?;
        match self.clients[index].cancel(session_id).await {
            Ok(cancelled) => {
                debug!("Cancel for {} (active generation: {})", session_id, cancelled);
                Ok(())
            }
            Err(e) => {
                self.mark_failed(index, &e);
                Err(e)
            }
        }
    }

    pub async fn end_session(&mut self, session_id: SessionId) -> Result<()> {
        let index = match self.sessions.get(&session_id) {
            Some(worker_id) => worker_id.0,
            None if self.was_issued(session_id) => {
                debug!("{} already ended", session_id);
                return Ok(());
            }
            None => return self.route(session_id).map(|_| ()),
        };

        match self.clients[index].end_session(session_id).await {
            Ok(outcome) => {
                self.sessions.remove(&session_id);
                self.workers[index].sessions = self.workers[index].sessions.saturating_sub(1);
                METRICS.router.sessions_ended.inc();
                if outcome == EndOutcome::AlreadyGone {
                    warn!("{} was already gone from its worker", session_id);
                }
                info!("Ended {}", session_id);
                Ok(())
            }
            Err(e) => {
                self.mark_failed(index, &e);
                Err(e)
            }
        }
    }

    pub async fn session_snapshot(&mut self, session_id: SessionId) -> Result<SessionSnapshot> {
        let index = self.route(session_id)?;
        let result = self.clients[index].snapshot(session_id).await;
        if let Err(e) = &result {
            self.mark_failed(index, e);
        }
        result
    }

    pub async fn worker_status(&mut self) -> Result<Vec<WorkerStatus>> {
        let mut statuses = Vec::with_capacity(self.clients.len());
        for index in 0..self.clients.len() {
            match self.clients[index].status().await {
                Ok(status) => statuses.push(status),
                Err(e) => {
                    self.mark_failed(index, &e);
                    return Err(e);
                }
            }
        }
        Ok(statuses)
    }

    /// Apply one command; `Break` ends the router task
    pub async fn handle(&mut self, command: RouterCommand) -> ControlFlow<Reply<()>> {
        match command {
            RouterCommand::CreateSession { sampling, reply } => {
                let _ = reply.send(self.create_session(sampling).await);
            }
            RouterCommand::AppendInput {
                session_id,
                text_delta,
                reply,
            } => {
                let _ = reply.send(self.append_input(session_id, text_delta).await);
            }
            RouterCommand::Generate {
                session_id,
                max_new_tokens,
                reply,
            } => {
                let _ = reply.send(self.generate_stream(session_id, max_new_tokens));
            }
            RouterCommand::Cancel { session_id, reply } => {
                let _ = reply.send(self.cancel_generate(session_id).await);
            }
            RouterCommand::EndSession { session_id, reply } => {
                let _ = reply.send(self.end_session(session_id).await);
            }
            RouterCommand::Snapshot { session_id, reply } => {
                let _ = reply.send(self.session_snapshot(session_id).await);
            }
            RouterCommand::Status { reply } => {
                let _ = reply.send(self.worker_status().await);
            }
            RouterCommand::Shutdown { reply } => return ControlFlow::Break(reply),
        }
        ControlFlow::Continue(())
    }

    /// Serve commands until `Shutdown` or until every engine handle is dropped
    pub async fn run(mut self, mut commands: mpsc::Receiver<RouterCommand>) {
        info!("Router running with {} workers", self.clients.len());
        let mut shutdown_reply = None;
        while let Some(command) = commands.recv().await {
            if let ControlFlow::Break(reply) = self.handle(command).await {
                shutdown_reply = Some(reply);
                break;
            }
        }
        commands.close();

        let result = self.stop_workers().await;
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(result);
        }
    }

    /// Stop every worker and wait for their threads
    async fn stop_workers(&mut self) -> Result<()> {
        for client in &self.clients {
            if let Err(e) = client.shutdown() {
                debug!(
                    "{} not accepting shutdown, stopping on disconnect: {}",
                    client.worker_id(),
                    e
                );
            }
        }

        let clients = std::mem::take(&mut self.clients);
        let joined = tokio::task::spawn_blocking(move || {
            clients
                .into_iter()
                .map(WorkerClient::join)
                .collect::<Result<Vec<()>>>()
        })
        .await
        .map_err(|e| SeqloopError::internal(format!("worker join task failed: {}", e)))?;

        info!("Router stopped, {} sessions were pinned", self.sessions.len());
        joined.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqloop_proto::{FinishReason, StreamEvent};
    use seqloop_worker::{ByteLevelModel, WorkerHandle};
    use std::sync::Arc;
    use std::time::Duration;

    async fn router(num_workers: usize, selection: WorkerSelection, max_sessions: usize) -> Router {
        let mut config = SeqloopConfig::default();
        config.engine.num_workers = num_workers;
        config.engine.selection = selection;
        config.worker.max_sessions = max_sessions;
        router_with(ByteLevelModel::new(), config).await
    }

    async fn router_with(model: ByteLevelModel, config: SeqloopConfig) -> Router {
        let model = Arc::new(model);
        let mut clients = Vec::new();
        for i in 0..config.engine.num_workers {
            let (handle, ready) =
                WorkerHandle::spawn(WorkerId(i), model.clone(), config.worker.clone()).unwrap();
            ready.await.unwrap().unwrap();
            clients.push(WorkerClient::new(handle, config.ack_timeout()));
        }
        Router::new(clients, &config)
    }

    /// Single worker with the given acknowledgement deadline and queue size
    fn slow_config(ack_timeout_ms: u64, command_queue_size: usize) -> SeqloopConfig {
        let mut config = SeqloopConfig::default();
        config.engine.num_workers = 1;
        config.engine.ack_timeout_ms = ack_timeout_ms;
        config.worker.command_queue_size = command_queue_size;
        config
    }

    #[test]
    fn test_load_score() {
        let mut info = WorkerInfo::new(WorkerId(0));
        info.sessions = 3;
        assert_eq!(info.load_score(), 3.0);
        info.healthy = false;
        assert_eq!(info.load_score(), f64::INFINITY);
    }

    #[tokio::test]
    async fn test_round_robin_pins_sessions() {
        let mut router = router(2, WorkerSelection::RoundRobin, 4).await;
        let a = router.create_session(SamplingConfig::greedy()).await.unwrap();
        let b = router.create_session(SamplingConfig::greedy()).await.unwrap();
        let c = router.create_session(SamplingConfig::greedy()).await.unwrap();

        assert_eq!(router.pinned_worker(a), Some(WorkerId(0)));
        assert_eq!(router.pinned_worker(b), Some(WorkerId(1)));
        assert_eq!(router.pinned_worker(c), Some(WorkerId(0)));
        assert_eq!(router.workers()[0].sessions, 2);

        router.append_input(a, "hi".into()).await.unwrap();
        let snapshot = router.session_snapshot(a).await.unwrap();
        assert_eq!(snapshot.worker_id, WorkerId(0));
    }

    #[tokio::test]
    async fn test_least_loaded_prefers_emptier_worker() {
        let mut router = router(2, WorkerSelection::LeastLoaded, 4).await;
        let a = router.create_session(SamplingConfig::greedy()).await.unwrap();
        let b = router.create_session(SamplingConfig::greedy()).await.unwrap();
        assert_eq!(router.pinned_worker(a), Some(WorkerId(0)));
        assert_eq!(router.pinned_worker(b), Some(WorkerId(1)));

        router.end_session(a).await.unwrap();
        let c = router.create_session(SamplingConfig::greedy()).await.unwrap();
        assert_eq!(router.pinned_worker(c), Some(WorkerId(0)));
    }

    #[tokio::test]
    async fn test_unknown_and_ended_sessions() {
        let mut router = router(1, WorkerSelection::RoundRobin, 4).await;
        assert!(matches!(
            router.append_input(SessionId(42), "x".into()).await,
            Err(SeqloopError::UnknownSession(SessionId(42)))
        ));
        assert!(matches!(
            router.end_session(SessionId(42)).await,
            Err(SeqloopError::UnknownSession(_))
        ));

        let a = router.create_session(SamplingConfig::greedy()).await.unwrap();
        router.end_session(a).await.unwrap();
        router.end_session(a).await.unwrap();
        assert!(router.pinned_worker(a).is_none());
        assert!(matches!(
            router.cancel_generate(a).await,
            Err(SeqloopError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_full_worker_rejects_session() {
        let mut router = router(1, WorkerSelection::RoundRobin, 1).await;
        let a = router.create_session(SamplingConfig::greedy()).await.unwrap();
        assert!(matches!(
            router.create_session(SamplingConfig::greedy()).await,
            Err(SeqloopError::WorkerAtCapacity { capacity: 1, .. })
        ));
        assert!(router.workers()[0].healthy);

        // The rejected create never handed out its id.
        let rejected = SessionId(a.0 + 1);
        assert!(matches!(
            router.end_session(rejected).await,
            Err(SeqloopError::UnknownSession(id)) if id == rejected
        ));

        router.end_session(a).await.unwrap();
        let b = router.create_session(SamplingConfig::greedy()).await.unwrap();
        assert_eq!(b, rejected);
    }

    #[tokio::test]
    async fn test_timed_out_create_retires_id() {
        let model = ByteLevelModel::new().with_step_delay(Duration::from_millis(200));
        let mut router = router_with(model, slow_config(20, 128)).await;

        // An idle worker acknowledges at once; the prefill that follows keeps
        // it inside a slow compute past the next deadline.
        let a = router.create_session(SamplingConfig::greedy()).await.unwrap();
        router.append_input(a, "abc".into()).await.unwrap();
        let _stream = router.generate_stream(a, 1_000).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let retired = SessionId(router.next_session);
        assert!(matches!(
            router.create_session(SamplingConfig::greedy()).await,
            Err(SeqloopError::Timeout(_))
        ));
        assert!(matches!(
            router.end_session(retired).await,
            Err(SeqloopError::UnknownSession(_))
        ));
        assert_ne!(SessionId(router.next_session), retired);
    }

    #[tokio::test]
    async fn test_stop_workers_with_full_queue() {
        let model = ByteLevelModel::new().with_step_delay(Duration::from_millis(300));
        let mut router = router_with(model, slow_config(5_000, 1)).await;
        let a = router.create_session(SamplingConfig::greedy()).await.unwrap();
        router.append_input(a, "abc".into()).await.unwrap();
        let mut stream = router.generate_stream(a, 10_000).unwrap();
        assert!(matches!(stream.recv().await, Some(StreamEvent::Chunk(_))));

        // Fill the command queue while the worker sits in a slow compute.
        let mut filled = false;
        for _ in 0..100 {
            if let Err(SeqloopError::QueueFull(_)) = router.generate_stream(a, 1) {
                filled = true;
                break;
            }
        }
        assert!(filled);

        tokio::time::timeout(Duration::from_secs(5), router.stop_workers())
            .await
            .unwrap()
            .unwrap();
        let rest = stream.collect().await;
        assert_eq!(rest.terminal, Some(StreamEvent::Done(FinishReason::Shutdown)));
    }

    #[tokio::test]
    async fn test_stopped_worker_is_skipped() {
        let mut router = router(2, WorkerSelection::RoundRobin, 4).await;
        router.clients[0].shutdown().unwrap();
        // Give the worker thread time to exit and drop its queue.
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(matches!(
            router.create_session(SamplingConfig::greedy()).await,
            Err(SeqloopError::WorkerUnavailable(_))
        ));
        assert!(!router.workers()[0].healthy);

        let a = router.create_session(SamplingConfig::greedy()).await.unwrap();
        assert_eq!(router.pinned_worker(a), Some(WorkerId(1)));
    }
}
