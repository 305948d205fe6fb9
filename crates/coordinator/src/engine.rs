//! Public engine handle
//!
//! [`Engine`] is a cheap, cloneable front for the router task. Every call is
//! a message to the router followed by its reply; streams are returned as
//! [`StreamHandle`]s fed directly by the owning worker.

use crate::router::{Reply, Router, RouterCommand};
use crate::worker_client::WorkerClient;
use seqloop_common::config::{SamplingConfig, SeqloopConfig};
use seqloop_common::error::{Result, SeqloopError};
use seqloop_proto::{SessionId, SessionSnapshot, WorkerId, WorkerStatus};
use seqloop_worker::{ModelBackend, SharedModel, StreamHandle, WorkerHandle};
use tokio::sync::{mpsc, oneshot};
use tracing::info;

/// Handle to a running engine
#[derive(Debug, Clone)]
pub struct Engine {
    commands: mpsc::Sender<RouterCommand>,
    default_sampling: SamplingConfig,
}

impl Engine {
    /// Spawn the worker threads and the router task
    ///
    /// Returns once every worker has created its execution context.
    pub async fn start<M: ModelBackend>(
        model: SharedModel<M>,
        config: SeqloopConfig,
    ) -> Result<Self> {
        config.validate()?;

        let mut clients = Vec::with_capacity(config.engine.num_workers);
        for index in 0..config.engine.num_workers {
            let worker_id = WorkerId(index);
            let (handle, ready) =
                WorkerHandle::spawn(worker_id, model.clone(), config.worker.clone())?;
            ready.await.map_err(|_| {
                SeqloopError::worker_unavailable(format!(
                    "{} exited before becoming ready",
                    worker_id
                ))
            })??;
            clients.push(WorkerClient::new(handle, config.ack_timeout()));
        }

        let (tx, rx) = mpsc::channel(config.engine.router_queue_size);
        tokio::spawn(Router::new(clients, &config).run(rx));

        info!(
            "Engine started: {} workers x {} slots on model {}",
            config.engine.num_workers,
            config.worker.max_sessions,
            model.name()
        );
        Ok(Self {
            commands: tx,
            default_sampling: config.sampling,
        })
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> RouterCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| SeqloopError::worker_unavailable("engine has shut down"))?;
        rx.await
            .map_err(|_| SeqloopError::worker_unavailable("engine has shut down"))?
    }

    /// Create a session with the configured sampling defaults
    pub async fn create_session(&self) -> Result<SessionId> {
        self.create_session_with(self.default_sampling.clone()).await
    }

    /// Create a session with its own sampling parameters
    pub async fn create_session_with(&self, sampling: SamplingConfig) -> Result<SessionId> {
        sampling.validate()?;
        self.call(|reply| RouterCommand::CreateSession { sampling, reply })
            .await
    }

    /// Queue text for the session; returns the number of tokens queued
    pub async fn append_input(
        &self,
        session_id: SessionId,
        text_delta: impl Into<String>,
    ) -> Result<usize> {
        let text_delta = text_delta.into();
        self.call(|reply| RouterCommand::AppendInput {
            session_id,
            text_delta,
            reply,
        })
        .await
    }

    /// Start generating; the handle yields chunks and exactly one terminal event
    pub async fn generate_stream(
        &self,
        session_id: SessionId,
        max_new_tokens: u32,
    ) -> Result<StreamHandle> {
        self.call(|reply| RouterCommand::Generate {
            session_id,
            max_new_tokens,
            reply,
        })
        .await
    }

    /// Request cancellation of the active generation, if any
    pub async fn cancel_generate(&self, session_id: SessionId) -> Result<()> {
        self.call(|reply| RouterCommand::Cancel { session_id, reply })
            .await
    }

    /// End a session and free its slot; ending it again succeeds
    pub async fn end_session(&self, session_id: SessionId) -> Result<()> {
        self.call(|reply| RouterCommand::EndSession { session_id, reply })
            .await
    }

    pub async fn session_snapshot(&self, session_id: SessionId) -> Result<SessionSnapshot> {
        self.call(|reply| RouterCommand::Snapshot { session_id, reply })
            .await
    }

    pub async fn worker_status(&self) -> Result<Vec<WorkerStatus>> {
        self.call(|reply| RouterCommand::Status { reply }).await
    }

    /// Stop the router and every worker, waiting for the threads to exit
    pub async fn shutdown(&self) -> Result<()> {
        self.call(|reply| RouterCommand::Shutdown { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqloop_worker::ByteLevelModel;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = SeqloopConfig::default();
        config.engine.num_workers = 0;
        let result = Engine::start(Arc::new(ByteLevelModel::new()), config).await;
        assert!(matches!(result, Err(SeqloopError::Config(_))));
    }

    #[tokio::test]
    async fn test_calls_fail_after_shutdown() {
        let engine = Engine::start(Arc::new(ByteLevelModel::new()), SeqloopConfig::default())
            .await
            .unwrap();
        engine.shutdown().await.unwrap();
        assert!(matches!(
            engine.create_session().await,
            Err(SeqloopError::WorkerUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_sampling_is_rejected() {
        let engine = Engine::start(Arc::new(ByteLevelModel::new()), SeqloopConfig::default())
            .await
            .unwrap();
        let sampling = SamplingConfig {
            temperature: -1.0,
            ..SamplingConfig::default()
        };
        assert!(engine.create_session_with(sampling).await.is_err());
        engine.shutdown().await.unwrap();
    }
}
