//! Configuration structures for Seqloop
//!
//! This module defines all configuration types used by the router and the
//! inference workers. Configurations are loaded from YAML files and can be
//! overridden by `SEQLOOP__SECTION__KEY` environment variables.

use crate::error::{Result, SeqloopError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for a Seqloop engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeqloopConfig {
    /// Router and worker-pool configuration
    pub engine: EngineConfig,

    /// Per-worker configuration
    pub worker: WorkerConfig,

    /// Default sampling parameters for new sessions
    pub sampling: SamplingConfig,

    /// Observability configuration
    pub observability: ObservabilityConfig,
}

/// Router and worker-pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of inference workers (one execution context each)
    pub num_workers: usize,

    /// Policy for pinning new sessions to workers
    pub selection: WorkerSelection,

    /// Capacity of the router's ingress queue
    pub router_queue_size: usize,

    /// Upper bound on waiting for a worker acknowledgement
    pub ack_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            selection: WorkerSelection::RoundRobin,
            router_queue_size: 256,
            ack_timeout_ms: 5_000,
        }
    }
}

/// Worker selection policy for new sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerSelection {
    /// Cycle through workers in order
    #[default]
    RoundRobin,

    /// Pick the worker with the fewest pinned sessions
    LeastLoaded,
}

/// Per-worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Context slots per worker (maximum pinned sessions)
    pub max_sessions: usize,

    /// Capacity of the worker's command queue
    pub command_queue_size: usize,

    /// Capacity of each generation stream, terminal event included
    pub stream_buffer_size: usize,

    /// Batching configuration
    pub batching: BatchingConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            command_queue_size: 128,
            stream_buffer_size: 64,
            batching: BatchingConfig::default(),
        }
    }
}

/// Batching configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Maximum tokens in one prefill batch
    pub max_prefill_tokens: usize,

    /// Maximum sessions in one decode batch
    pub max_decode_sequences: usize,

    /// Wait for commands this long when a tick scheduled nothing
    pub idle_backoff_ms: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_prefill_tokens: 512,
            max_decode_sequences: 32,
            idle_backoff_ms: 2,
        }
    }
}

impl BatchingConfig {
    /// Get idle backoff as Duration
    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }
}

/// Sampling parameters for one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Temperature (0.0 = greedy)
    pub temperature: f32,

    /// Top-k filter (0 = disabled)
    pub top_k: usize,

    /// Top-p (nucleus) filter (1.0 = disabled)
    pub top_p: f32,

    /// RNG seed (`None` = from entropy)
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_k: 40,
            top_p: 0.95,
            seed: None,
        }
    }
}

impl SamplingConfig {
    /// Greedy decoding
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Self::default()
        }
    }

    /// Validate sampling parameters
    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(SeqloopError::config(format!(
                "temperature must be a non-negative number, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(SeqloopError::config(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        Ok(())
    }
}

/// Observability configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Enable Prometheus metrics dump
    pub enable_metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            enable_metrics: true,
        }
    }
}

impl SeqloopConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SeqloopError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: SeqloopConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load layered configuration: defaults, then an optional YAML file,
    /// then `SEQLOOP__SECTION__KEY` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let config: SeqloopConfig = builder
            .add_source(
                config::Environment::with_prefix("SEQLOOP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.engine.num_workers == 0 {
            return Err(SeqloopError::config("num_workers must be at least 1"));
        }
        if self.engine.router_queue_size == 0 {
            return Err(SeqloopError::config("router_queue_size must be at least 1"));
        }
        if self.worker.max_sessions == 0 {
            return Err(SeqloopError::config("max_sessions must be at least 1"));
        }
        if self.worker.max_sessions > u32::MAX as usize {
            return Err(SeqloopError::config("max_sessions exceeds slot id range"));
        }
        if self.worker.command_queue_size == 0 {
            return Err(SeqloopError::config("command_queue_size must be at least 1"));
        }
        // One slot is always held back for the terminal event.
        if self.worker.stream_buffer_size < 2 {
            return Err(SeqloopError::config("stream_buffer_size must be at least 2"));
        }
        if self.worker.batching.max_prefill_tokens == 0 {
            return Err(SeqloopError::config("max_prefill_tokens must be at least 1"));
        }
        if self.worker.batching.max_decode_sequences == 0 {
            return Err(SeqloopError::config("max_decode_sequences must be at least 1"));
        }
        self.sampling.validate()
    }

    /// Get acknowledgement timeout as Duration
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.engine.ack_timeout_ms)
    }
}
