//! huginnd: Huginn daemon.
//!
//! Reads turns from stdin, one per line, and writes [`OutputUnit`]s to
//! stdout as JSON lines. A line is either a JSON object
//! `{"messages": [...], "priority": "high"}` carrying a whole conversation,
//! or plain text, which is appended as a user message to the running
//! session conversation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::Mutex;
use tracing::{info, warn};

use huginn::{
    Config, HuginnError, Message, Orchestrator, OrchestratorBuilder, OutputUnit, PriorityClass,
    TransportSink,
};

/// Huginn daemon: latency-minimizing chat turn resolution.
#[derive(Parser)]
#[command(name = "huginnd")]
#[command(version = huginn::version::PKG_VERSION)]
#[command(about = "Huginn turn resolution daemon")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, env = "HUGINN_CONFIG")]
    config: Option<PathBuf>,

    /// Priority for plain-text turns.
    #[arg(short, long, default_value = "normal")]
    priority: PriorityClass,

    /// Print a stats snapshot to stderr on exit.
    #[arg(long)]
    stats: bool,

    /// Seconds to wait for in-flight upstream calls on shutdown.
    #[arg(long, default_value_t = 10)]
    drain_secs: u64,
}

#[derive(Deserialize)]
struct TurnLine {
    messages: Vec<Message>,
    #[serde(default)]
    priority: Option<PriorityClass>,
}

/// Writes each unit to stdout as one JSON line.
struct StdoutSink {
    out: Mutex<Stdout>,
}

#[async_trait]
impl TransportSink for StdoutSink {
    async fn push(&self, unit: OutputUnit) -> huginn::Result<()> {
        let mut line = serde_json::to_vec(&unit)?;
        line.push(b'\n');
        let mut out = self.out.lock().await;
        out.write_all(&line)
            .await
            .map_err(|e| HuginnError::Transport(format!("stdout closed: {e}")))?;
        out.flush()
            .await
            .map_err(|e| HuginnError::Transport(format!("stdout closed: {e}")))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG overrides; logs go to stderr so stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) if args.config.is_none() => {
            warn!(error = %e, "no usable config file, using defaults");
            Config::default()
        }
        Err(e) => return Err(e.into()),
    };

    let orchestrator = Arc::new(OrchestratorBuilder::from_config(config).build()?);
    orchestrator.start().await;
    info!(version = huginn::version::version_string(), "huginnd ready");

    let sink = StdoutSink {
        out: Mutex::new(tokio::io::stdout()),
    };
    tokio::select! {
        result = serve(&orchestrator, &sink, args.priority) => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    if args.stats {
        eprintln!("{}", serde_json::to_string_pretty(&orchestrator.stats())?);
    }
    let drained = orchestrator
        .shutdown(Duration::from_secs(args.drain_secs))
        .await;
    if !drained {
        warn!("shutdown timed out with upstream calls in flight");
    }
    Ok(())
}

async fn serve(
    orchestrator: &Orchestrator,
    sink: &StdoutSink,
    default_priority: PriorityClass,
) -> huginn::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut session: Vec<Message> = Vec::new();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| HuginnError::Transport(format!("stdin: {e}")))?
    {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with('{') {
            match serde_json::from_str::<TurnLine>(line) {
                Ok(turn) => {
                    let priority = turn.priority.unwrap_or(default_priority);
                    // Failures are already reported to the sink as error units.
                    let _ = orchestrator
                        .stream_turn(&turn.messages, priority, sink)
                        .await;
                }
                Err(e) => sink.push(OutputUnit::error(format!("bad turn: {e}"))).await?,
            }
            continue;
        }

        session.push(Message::user(line));
        match orchestrator
            .stream_turn(&session, default_priority, sink)
            .await
        {
            Ok(response) => session.push(Message::assistant(response.text)),
            Err(_) => {
                session.pop();
            }
        }
    }
    Ok(())
}
