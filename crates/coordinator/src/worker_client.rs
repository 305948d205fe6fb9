//! Router-side client for one worker thread
//!
//! Every request is a non-blocking enqueue on the worker's command queue
//! followed by a bounded wait for the acknowledgement.

use seqloop_common::config::SamplingConfig;
use seqloop_common::error::{Result, SeqloopError};
use seqloop_common::metrics::METRICS;
use seqloop_proto::{SeqSlot, SessionId, SessionSnapshot, WorkerId, WorkerStatus};
use seqloop_worker::{Ack, EndOutcome, StreamSink, WorkerCommand, WorkerHandle};
use std::time::Duration;
use tokio::sync::oneshot;

/// Typed command interface to a worker
#[derive(Debug)]
pub struct WorkerClient {
    handle: WorkerHandle,
    ack_timeout: Duration,
}

impl WorkerClient {
    pub fn new(handle: WorkerHandle, ack_timeout: Duration) -> Self {
        Self {
            handle,
            ack_timeout,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.handle.worker_id()
    }

    async fn request<T>(&self, make: impl FnOnce(Ack<T>) -> WorkerCommand) -> Result<T> {
        let (ack, rx) = oneshot::channel();
        self.handle.try_send(make(ack))?;
        METRICS.router.commands_routed.inc();

        let timer = METRICS.router.ack_latency.start_timer();
        let reply = tokio::time::timeout(self.ack_timeout, rx).await;
        timer.observe_duration();

        match reply {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SeqloopError::worker_unavailable(format!(
                "{} dropped the acknowledgement",
                self.worker_id()
            ))),
            Err(_) => Err(SeqloopError::timeout(format!(
                "{} did not acknowledge within {:?}",
                self.worker_id(),
                self.ack_timeout
            ))),
        }
    }

    pub async fn create_session(
        &self,
        session_id: SessionId,
        sampling: SamplingConfig,
    ) -> Result<SeqSlot> {
        self.request(|ack| WorkerCommand::CreateSession {
            session_id,
            sampling,
            ack,
        })
        .await
    }

    pub async fn append_input(&self, session_id: SessionId, text_delta: String) -> Result<usize> {
        self.request(|ack| WorkerCommand::AppendInput {
            session_id,
            text_delta,
            ack,
        })
        .await
    }

    /// Hand a sink to the worker; generation proceeds without an acknowledgement
    pub fn generate(
        &self,
        session_id: SessionId,
        max_new_tokens: u32,
        sink: StreamSink,
    ) -> Result<()> {
        self.handle.try_send(WorkerCommand::Generate {
            session_id,
            max_new_tokens,
            sink,
        })?;
        METRICS.router.commands_routed.inc();
        Ok(())
    }

    pub async fn cancel(&self, session_id: SessionId) -> Result<bool> {
        self.request(|ack| WorkerCommand::Cancel { session_id, ack }).await
    }

    pub async fn end_session(&self, session_id: SessionId) -> Result<EndOutcome> {
        self.request(|ack| WorkerCommand::EndSession { session_id, ack })
            .await
    }

    /// Ask the worker to drop a session without waiting for the outcome
    pub fn end_session_detached(&self, session_id: SessionId) -> Result<()> {
        let (ack, _) = oneshot::channel();
        self.handle.try_send(WorkerCommand::EndSession { session_id, ack })
    }

    pub async fn snapshot(&self, session_id: SessionId) -> Result<SessionSnapshot> {
        self.request(|ack| WorkerCommand::Snapshot { session_id, ack })
            .await
    }

    pub async fn status(&self) -> Result<WorkerStatus> {
        self.request(|ack| WorkerCommand::Status { ack }).await
    }

    /// Ask the worker to stop; live generations end with `Done(Shutdown)`
    pub fn shutdown(&self) -> Result<()> {
        self.handle.try_send(WorkerCommand::Shutdown)
    }

    /// Close the worker's queue and block until its thread exits
    pub fn join(self) -> Result<()> {
        self.handle.join()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqloop_common::config::WorkerConfig;
    use seqloop_worker::ByteLevelModel;
    use std::sync::Arc;

    async fn client(model: ByteLevelModel, ack_timeout: Duration) -> WorkerClient {
        let (handle, ready) =
            WorkerHandle::spawn(WorkerId(0), Arc::new(model), WorkerConfig::default()).unwrap();
        ready.await.unwrap().unwrap();
        WorkerClient::new(handle, ack_timeout)
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let client = client(ByteLevelModel::new(), Duration::from_secs(5)).await;
        let slot = client
            .create_session(SessionId(1), SamplingConfig::greedy())
            .await
            .unwrap();
        assert_eq!(slot, SeqSlot(0));
        assert_eq!(client.append_input(SessionId(1), "hey".into()).await.unwrap(), 3);
        assert!(!client.cancel(SessionId(1)).await.unwrap());

        let snapshot = client.snapshot(SessionId(1)).await.unwrap();
        assert_eq!(snapshot.worker_id, WorkerId(0));
        assert_eq!(client.status().await.unwrap().sessions, 1);

        assert_eq!(
            client.end_session(SessionId(1)).await.unwrap(),
            EndOutcome::Removed
        );
        client.shutdown().unwrap();
        tokio::task::spawn_blocking(move || client.join())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_slow_worker_times_out() {
        // Every tick sleeps, so the acknowledgement arrives after the deadline.
        let model = ByteLevelModel::new().with_step_delay(Duration::from_millis(200));
        let client = client(model, Duration::from_millis(20)).await;
        client
            .create_session(SessionId(1), SamplingConfig::greedy())
            .await
            .unwrap();
        client.append_input(SessionId(1), "abc".into()).await.unwrap();

        let (sink, _stream) = seqloop_worker::stream_channel(SessionId(1), 8);
        client.generate(SessionId(1), 100, sink).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(
            client.status().await,
            Err(SeqloopError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_stopped_worker_is_unavailable() {
        let client = client(ByteLevelModel::new(), Duration::from_secs(5)).await;
        client.shutdown().unwrap();
        // Give the worker thread time to exit and drop its queue.
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(matches!(
            client.status().await,
            Err(SeqloopError::WorkerUnavailable(_))
        ));
    }
}
