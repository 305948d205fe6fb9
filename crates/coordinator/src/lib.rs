//! Seqloop Coordinator
//!
//! Ingress router and public engine handle. Sessions are pinned to one worker
//! at creation and every later command for them is forwarded to that worker.

pub mod engine;
pub mod router;
pub mod worker_client;

pub use engine::Engine;
pub use router::{Router, RouterCommand, WorkerInfo};
pub use worker_client::WorkerClient;
