mod terminal;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;
use url::Url;

use porthole_core::exec::TargetRef;
use porthole_core::reconnect::{BackoffPolicy, Supervisor, TabOutcome};
use porthole_core::session::SessionConfig;

use crate::terminal::RawGuard;
use crate::ws::GatewayExec;

#[derive(Parser, Debug)]
#[command(
    name = "porthole",
    about = "Attach a terminal to a target behind a porthole gateway",
    version
)]
struct Cli {
    /// Target to attach, as namespace/name.
    target: TargetRef,

    /// Gateway base URL.
    #[arg(long, default_value = "ws://127.0.0.1:8006", env = "PORTHOLE_GATEWAY")]
    gateway: String,

    /// User recorded in the gateway's audit trail.
    #[arg(long, default_value = "unknown_user", env = "PORTHOLE_USER")]
    user: String,

    /// Delay before the first reconnect attempt, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    backoff_ms: u64,

    /// Growth factor between reconnect delays.
    #[arg(long, default_value_t = 2.0)]
    backoff_multiplier: f64,

    /// Reconnect attempts before giving up.
    #[arg(long, default_value_t = 5)]
    max_attempts: u32,

    /// Append logs here instead of the terminal.
    #[arg(long, env = "PORTHOLE_LOG_FILE")]
    log_file: Option<String>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("porthole: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.log_file.as_deref())?;

    let base = Url::parse(&cli.gateway).context("invalid gateway url")?;
    match base.scheme() {
        "ws" | "wss" => {}
        other => anyhow::bail!("gateway url must be ws or wss, got {other}"),
    }

    let backend = Arc::new(GatewayExec::new(base, cli.user.clone()));
    let backoff = BackoffPolicy {
        base: Duration::from_millis(cli.backoff_ms),
        multiplier: cli.backoff_multiplier,
        max_attempts: cli.max_attempts,
    };
    let supervisor = Supervisor::new(
        cli.target.clone(),
        cli.user,
        terminal::current_geometry(),
        backend,
        SessionConfig::default(),
        backoff,
    );

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (output_tx, output_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let raw = RawGuard::new().context("could not enter raw mode")?;
    terminal::spawn_input_thread(commands_tx);
    let render = tokio::spawn(terminal::render_loop(output_rx, events_rx));

    let outcome = supervisor.run(commands_rx, output_tx, events_tx).await;

    // run() dropped its channel ends, so the render loop drains and stops
    let _ = render.await;
    drop(raw);

    match outcome {
        TabOutcome::Clean(reason) => {
            println!("porthole: session closed ({reason})");
            Ok(())
        }
        TabOutcome::NeverConnected => anyhow::bail!("could not reach {}", cli.target),
        TabOutcome::Exhausted => anyhow::bail!("connection lost and retries exhausted"),
    }
}

/// Raw mode owns the terminal, so logs only flow when given a file.
fn init_logging(log_file: Option<&str>) -> anyhow::Result<Option<WorkerGuard>> {
    let Some(path) = log_file else {
        return Ok(None);
    };
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("could not open log file {path}"))?;
    let (writer, guard) = tracing_appender::non_blocking(file);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(writer)
        .init();
    Ok(Some(guard))
}
