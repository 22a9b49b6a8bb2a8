use anyhow::{Context, Result};
use axum::{Router, routing::get};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

use peer_relay::{ChatHistory, MemoryBus, MemoryPresence, MessageBus, MessageManager, PresenceStore};

mod cli;
mod config;
mod db;
mod handlers;
mod metrics;
mod repository;
mod ws;

#[cfg(test)]
mod test_helpers;

use crate::config::{FileConfig, PeerConfig, ServerConfig};
use crate::db::Database;
use crate::metrics::ServerMetrics;
use crate::repository::ChatRepository;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 7878;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "peer")]
#[command(about = "Real-time chat message relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to the platform data dir)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server in the foreground
    Serve(ServeArgs),

    /// Join a chat from the terminal
    Chat(cli::ChatArgs),
}

#[derive(Parser)]
struct ServeArgs {
    /// Port for the web server (0 = auto-select)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone)]
pub(crate) struct AppState {
    /// Server runtime configuration
    pub server_config: Arc<ServerConfig>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
    pub db: Arc<Database>,
    pub presence: Arc<dyn PresenceStore>,
    pub bus: Arc<dyn MessageBus>,
    pub history: Arc<dyn ChatHistory>,
    /// Polling relay behind `/api/ws/queue`
    pub manager: Arc<MessageManager>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => run_server(args, cli.data_dir).await,
        Commands::Chat(args) => cli::chat_command(args).await,
    }
}

fn init_tracing(debug: bool) {
    let default_directive = if debug {
        "peer=debug,peer_relay=debug,tower_http=debug,info"
    } else {
        "peer=info,peer_relay=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/ws/chat", get(handlers::chat_websocket_handler))
        .route("/api/ws/diff", get(handlers::diff_websocket_handler))
        .route("/api/ws/queue", get(handlers::queue_websocket_handler))
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/health/ready", get(handlers::health_ready_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn run_server(args: ServeArgs, data_dir: Option<PathBuf>) -> Result<()> {
    init_tracing(args.debug);
    info!("Starting peer relay");

    let config = PeerConfig::new(data_dir)?;
    let file_config: FileConfig = config::load_config(&config.data_dir)
        .extract()
        .context("Invalid configuration")?;
    let server_config = Arc::new(ServerConfig::from_file(&file_config));

    info!("Initializing database...");
    let db = Arc::new(Database::new(&config).await?);
    let history = Arc::new(ChatRepository::with_fetch_batch(
        db.pool.clone(),
        server_config.queue.fetch_batch,
    ));

    let manager = Arc::new(MessageManager::new(
        history.clone(),
        server_config.queue.manager_config(),
    ));
    let shutdown = CancellationToken::new();
    let manager_task = if server_config.queue.enabled {
        Some(tokio::spawn(manager.clone().run(shutdown.clone())))
    } else {
        info!("Chat queue scanning disabled");
        None
    };

    info!(
        "Relay config: outbound_capacity={}, bus_capacity={}, presence_timeout={:?}",
        server_config.relay.outbound_capacity,
        server_config.relay.bus_capacity,
        server_config.relay.presence_timeout
    );

    let app_state = AppState {
        presence: Arc::new(MemoryPresence::new()),
        bus: Arc::new(MemoryBus::new(server_config.relay.bus_capacity)),
        history,
        manager,
        server_config,
        metrics: Arc::new(ServerMetrics::new()),
        db,
    };
    let app = build_router(app_state);

    // CLI flag > config.toml / env > built-in default
    let host = args
        .host
        .or(file_config.server.host)
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = args.port.or(file_config.server.port).unwrap_or(DEFAULT_PORT);
    let addr = format!("{}:{}", host, port)
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid listen address {host}:{port}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let actual_addr = listener.local_addr()?;

    info!("peer listening on http://{}", actual_addr);
    info!("WebSocket endpoints:");
    info!("  GET /api/ws/chat?chat_id=..&user_id=..   - Join one chat");
    info!("  GET /api/ws/diff?user_id=..              - Watch a set of chats");
    info!("  GET /api/ws/queue?chat_id=..&user_id=..  - Join via the polling queue");

    let shutdown_signal = {
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C, running until killed: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received shutdown signal, cleaning up...");
            shutdown.cancel();
        }
    };

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    shutdown.cancel();
    if let Some(task) = manager_task {
        if let Err(e) = task.await {
            warn!("Message manager task failed: {}", e);
        }
    }

    info!("Shutdown complete");
    server_result
}
