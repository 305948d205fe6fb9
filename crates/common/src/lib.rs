//! Seqloop common library
//!
//! This crate contains shared code used across Seqloop components.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::{SamplingConfig, SeqloopConfig, WorkerSelection};
pub use error::{Result, SeqloopError};
pub use metrics::{MetricsRegistry, METRICS};
