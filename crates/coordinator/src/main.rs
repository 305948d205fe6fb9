//! Seqloop Coordinator - Demo Entry Point
//!
//! Starts an engine on the byte-level reference model, runs one turn per
//! command-line prompt on a single session and streams the output to stdout.

use anyhow::{Context, Result};
use seqloop_common::{SeqloopConfig, METRICS};
use seqloop_coordinator::Engine;
use seqloop_proto::{SessionId, StreamEvent};
use seqloop_worker::ByteLevelModel;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const MAX_NEW_TOKENS: u32 = 48;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config_path = std::env::var("SEQLOOP_CONFIG").ok().map(PathBuf::from);
    let config = SeqloopConfig::load(config_path.as_deref())
        .context("failed to load configuration")?;

    // Initialize logging
    let default_filter = format!(
        "seqloop_coordinator={level},seqloop_worker={level}",
        level = config.observability.log_level
    );
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Starting Seqloop Coordinator");

    let mut prompts: Vec<String> = std::env::args().skip(1).collect();
    if prompts.is_empty() {
        prompts = vec!["Hello there.".to_string(), " Tell me more.".to_string()];
    }

    let model = Arc::new(ByteLevelModel::new().with_eos_after(96));
    let engine = Engine::start(model, config.clone())
        .await
        .context("failed to start engine")?;
    let session = engine.create_session().await.context("failed to create session")?;

    let interrupted = tokio::select! {
        result = run_turns(&engine, session, &prompts) => {
            result?;
            false
        }
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
            engine.cancel_generate(session).await.ok();
            true
        }
    };

    let snapshot = engine
        .session_snapshot(session)
        .await
        .context("failed to read session snapshot")?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    if config.observability.enable_metrics {
        match METRICS.gather() {
            Ok(text) => eprintln!("{}", text),
            Err(e) => warn!("Failed to gather metrics: {}", e),
        }
    }

    engine.end_session(session).await?;
    engine.shutdown().await.context("engine shutdown failed")?;

    info!(
        "Seqloop Coordinator shutdown complete{}",
        if interrupted { " (interrupted)" } else { "" }
    );
    Ok(())
}

/// Feed each prompt to the session and stream the reply
async fn run_turns(engine: &Engine, session: SessionId, prompts: &[String]) -> Result<()> {
    let mut stdout = std::io::stdout();
    for prompt in prompts {
        engine.append_input(session, prompt.as_str()).await?;
        writeln!(stdout, "> {}", prompt)?;

        let mut stream = engine.generate_stream(session, MAX_NEW_TOKENS).await?;
        while let Some(event) = stream.recv().await {
            match event {
                StreamEvent::Chunk(text) => {
                    write!(stdout, "{}", text)?;
                    stdout.flush()?;
                }
                StreamEvent::Done(reason) => {
                    writeln!(stdout, "\n[{}]", reason)?;
                    break;
                }
                StreamEvent::Error(cause) => {
                    anyhow::bail!("generation failed: {}", cause);
                }
            }
        }
    }
    Ok(())
}
