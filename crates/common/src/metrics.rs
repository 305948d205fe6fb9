//! Metrics collection for Seqloop
//!
//! This module provides Prometheus metrics for observability.
//! Workers only touch atomics from the hot path; gathering happens on demand.

use crate::error::{Result, SeqloopError};
use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::Arc;

/// Metrics registry for Seqloop
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub router: RouterMetrics,
    pub worker: WorkerMetrics,
    pub stream: StreamMetrics,
}

/// Router metrics
#[derive(Debug, Clone)]
pub struct RouterMetrics {
    /// Sessions created
    pub sessions_created: IntCounter,

    /// Sessions ended
    pub sessions_ended: IntCounter,

    /// Commands forwarded to a pinned worker
    pub commands_routed: IntCounter,

    /// Commands rejected for an unknown session
    pub unknown_session: IntCounter,

    /// Routed commands that failed to reach a worker or get its acknowledgement
    pub routing_failures: IntCounter,

    /// Time spent waiting for worker acknowledgements
    pub ack_latency: Histogram,
}

/// Worker-specific metrics
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    /// Compute call duration
    pub compute_duration: Histogram,

    /// Prefill batch size in tokens
    pub prefill_batch_tokens: Histogram,

    /// Decode batch size in sessions
    pub decode_batch_sequences: Histogram,

    /// Tokens written by prefill
    pub tokens_prefilled_total: IntCounter,

    /// Tokens sampled by decode
    pub tokens_generated_total: IntCounter,

    /// Failed compute calls
    pub compute_failures: IntCounter,

    /// Sessions pinned across all workers
    pub active_sessions: IntGauge,

    /// Generations running across all workers
    pub active_generations: IntGauge,
}

/// Stream metrics
#[derive(Debug, Clone)]
pub struct StreamMetrics {
    /// Generations finished, by reason
    pub generations_finished: IntCounterVec,

    /// Generations ended with an error event
    pub generations_failed: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry =
        MetricsRegistry::new().expect("metric names are unique and well-formed");
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        // Router metrics
        let sessions_created = IntCounter::new(
            "router_sessions_created_total",
            "Total number of sessions created",
        )?;

        let sessions_ended = IntCounter::new(
            "router_sessions_ended_total",
            "Total number of sessions ended",
        )?;

        let commands_routed = IntCounter::new(
            "router_commands_routed_total",
            "Total number of commands forwarded to a pinned worker",
        )?;

        let unknown_session = IntCounter::new(
            "router_unknown_session_total",
            "Total commands rejected for an unknown session",
        )?;

        let routing_failures = IntCounter::new(
            "router_routing_failures_total",
            "Total routed commands that failed to reach a worker or get its acknowledgement",
        )?;

        let ack_latency = Histogram::with_opts(
            HistogramOpts::new(
                "router_ack_latency_seconds",
                "Time spent waiting for worker acknowledgements",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;

        // Worker metrics
        let compute_duration = Histogram::with_opts(
            HistogramOpts::new(
                "worker_compute_duration_seconds",
                "Duration of one batch compute call",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1]),
        )?;

        let prefill_batch_tokens = Histogram::with_opts(
            HistogramOpts::new("worker_prefill_batch_tokens", "Prefill batch size in tokens")
                .buckets(vec![1.0, 8.0, 32.0, 64.0, 128.0, 256.0, 512.0, 1024.0]),
        )?;

        let decode_batch_sequences = Histogram::with_opts(
            HistogramOpts::new(
                "worker_decode_batch_sequences",
                "Decode batch size in sessions",
            )
            .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0]),
        )?;

        let tokens_prefilled_total = IntCounter::new(
            "worker_tokens_prefilled_total",
            "Total number of input tokens written by prefill",
        )?;

        let tokens_generated_total = IntCounter::new(
            "worker_tokens_generated_total",
            "Total number of tokens generated",
        )?;

        let compute_failures = IntCounter::new(
            "worker_compute_failures_total",
            "Total number of failed compute calls",
        )?;

        let active_sessions = IntGauge::new(
            "worker_active_sessions",
            "Current number of sessions pinned to workers",
        )?;

        let active_generations = IntGauge::new(
            "worker_active_generations",
            "Current number of running generations",
        )?;

        // Stream metrics
        let generations_finished = IntCounterVec::new(
            Opts::new(
                "stream_generations_finished_total",
                "Total generations finished, by reason",
            ),
            &["reason"],
        )?;

        let generations_failed = IntCounter::new(
            "stream_generations_failed_total",
            "Total generations ended with an error event",
        )?;

        // Register all metrics
        registry.register(Box::new(sessions_created.clone()))?;
        registry.register(Box::new(sessions_ended.clone()))?;
        registry.register(Box::new(commands_routed.clone()))?;
        registry.register(Box::new(unknown_session.clone()))?;
        registry.register(Box::new(routing_failures.clone()))?;
        registry.register(Box::new(ack_latency.clone()))?;

        registry.register(Box::new(compute_duration.clone()))?;
        registry.register(Box::new(prefill_batch_tokens.clone()))?;
        registry.register(Box::new(decode_batch_sequences.clone()))?;
        registry.register(Box::new(tokens_prefilled_total.clone()))?;
        registry.register(Box::new(tokens_generated_total.clone()))?;
        registry.register(Box::new(compute_failures.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(active_generations.clone()))?;

        registry.register(Box::new(generations_finished.clone()))?;
        registry.register(Box::new(generations_failed.clone()))?;

        let router = RouterMetrics {
            sessions_created,
            sessions_ended,
            commands_routed,
            unknown_session,
            routing_failures,
            ack_latency,
        };

        let worker = WorkerMetrics {
            compute_duration,
            prefill_batch_tokens,
            decode_batch_sequences,
            tokens_prefilled_total,
            tokens_generated_total,
            compute_failures,
            active_sessions,
            active_generations,
        };

        let stream = StreamMetrics {
            generations_finished,
            generations_failed,
        };

        Ok(MetricsRegistry {
            registry,
            router,
            worker,
            stream,
        })
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| SeqloopError::internal(format!("metrics encoding failed: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| SeqloopError::internal(format!("metrics are not UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let metrics = MetricsRegistry::new().unwrap();

        metrics.router.sessions_created.inc();
        metrics.router.routing_failures.inc();
        metrics.worker.active_sessions.set(3);
        metrics
            .stream
            .generations_finished
            .with_label_values(&["length"])
            .inc();

        let output = metrics.gather().unwrap();
        assert!(output.contains("router_sessions_created_total 1"));
        assert!(output.contains(
            "# HELP router_routing_failures_total Total routed commands that failed"
        ));
        assert!(output.contains("worker_active_sessions 3"));
        assert!(output.contains("stream_generations_finished_total{reason=\"length\"} 1"));
    }

    #[test]
    fn test_global_registry_is_usable() {
        METRICS.worker.compute_failures.inc();
        assert!(METRICS.gather().unwrap().contains("worker_compute_failures_total"));
    }
}
