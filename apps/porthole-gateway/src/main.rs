mod audit;
mod config;
mod handlers;
mod local;
mod state;
mod websocket;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use porthole_core::cache::ExistenceCache;
use porthole_core::exec::AuditSink;
use porthole_core::upload::UploadInjector;

use crate::audit::{FileAudit, LogAudit};
use crate::config::Config;
use crate::handlers::{health_check, target_exists, upload, version};
use crate::local::{LocalBulkTransfer, LocalDiscovery, LocalExec};
use crate::state::{AppState, SessionRegistry};
use crate::websocket::ws_terminal;

#[derive(Parser, Debug)]
#[command(name = "porthole-gateway", about = "WebSocket terminal gateway", version)]
struct Cli {
    /// Listen port, overriding PORTHOLE_PORT.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    // Default to INFO level if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    if let Err(err) = run().await {
        error!("gateway failed: {err}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }

    info!("starting porthole gateway on port {}", config.port);
    info!("shell: {}", config.shell);
    info!(
        "idle timeout {:?}, lifetime {:?}, upload dir {}",
        config.idle_timeout, config.connection_timeout, config.upload_dir
    );

    let backend = Arc::new(LocalExec::new(config.shell.clone()));
    let cache = Arc::new(ExistenceCache::new(
        Arc::new(LocalDiscovery::new(config.shell.clone())),
        config.cache_ttl,
    ));
    let audit: Arc<dyn AuditSink> = match &config.audit_log {
        Some(path) => {
            info!("audit trail: {}", path);
            Arc::new(FileAudit::new(path.clone()))
        }
        None => Arc::new(LogAudit),
    };
    let uploads = Arc::new(UploadInjector::new(
        Arc::new(LocalBulkTransfer),
        config.upload_dir.clone(),
    ));

    let state = AppState {
        config: Arc::new(config),
        backend,
        cache,
        audit,
        uploads,
        sessions: SessionRegistry::default(),
    };
    let addr = format!("{}:{}", state.config.host, state.config.port);

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/version", get(version))
        .route("/api/targets/:namespace/:name/exists", get(target_exists))
        .route("/upload/:namespace/:name", post(upload))
        .route("/ws/:namespace/:name", get(ws_terminal))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("porthole gateway listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
