use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, post, put},
};
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::info;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod config;
mod db;
mod file_tree;
mod handlers;
mod metrics;
mod models;
mod protocol;
mod relay;
mod sandbox;
mod session;
mod store;
#[cfg(test)]
mod test_helpers;
mod ws;

use sandbox_runtime::{LocalRuntime, SandboxRuntime};

use crate::config::{DevroomConfig, FileConfig, SandboxConfig};
use crate::metrics::ServerMetrics;
use crate::relay::RoomRelay;
use crate::sandbox::{RuntimeFactory, SandboxRegistry};
use crate::session::SessionDeps;
use crate::store::{MemoryStore, ProjectStore, SqliteStore};

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
#[command(name = "devroom")]
#[command(about = "Shared coding workspaces with chat, file sync and a live sandbox")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Custom data directory (defaults to ~/.devroom)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server in the foreground
    Server(ServerArgs),

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Parser, Default)]
struct ServerArgs {
    /// Port for the web server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Keep projects and messages in memory only
    #[arg(long)]
    ephemeral: bool,
}

#[derive(Clone)]
#[allow(dead_code)]
pub(crate) struct AppState {
    pub config: Arc<DevroomConfig>,
    pub store: Arc<dyn ProjectStore>,
    pub relay: Arc<RoomRelay>,
    pub sandboxes: Arc<SandboxRegistry>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
}

impl AppState {
    pub fn session_deps(&self) -> SessionDeps {
        SessionDeps {
            store: self.store.clone(),
            relay: self.relay.clone(),
            sandboxes: self.sandboxes.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = DevroomConfig::new(cli.data_dir.clone())?;

    match cli.command {
        None => run_server(ServerArgs::default(), config).await,
        Some(Commands::Server(args)) => run_server(args, config).await,
        Some(Commands::Config) => print_config(&config),
    }
}

fn print_config(config: &DevroomConfig) -> Result<()> {
    let file_config: FileConfig = config::load_config(&config.data_dir)
        .extract()
        .context("Invalid configuration")?;
    print!("{}", toml::to_string_pretty(&file_config)?);
    Ok(())
}

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        // Project routes
        .route(
            "/api/projects",
            get(handlers::list_projects).post(handlers::create_project),
        )
        .route("/api/projects/add-user", put(handlers::add_users))
        .route(
            "/api/projects/update-file-tree",
            put(handlers::update_file_tree),
        )
        .route("/api/projects/{id}", get(handlers::get_project))
        .route("/api/projects/{id}/sandbox", get(handlers::sandbox_status))
        .route(
            "/api/projects/{id}/agent",
            post(handlers::post_agent_message),
        )
        .route("/api/projects/{id}/ws", get(handlers::workspace_ws_handler))
        // User routes
        .route(
            "/api/users",
            get(handlers::list_users).post(handlers::create_user),
        )
        // Health endpoints
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn run_server(args: ServerArgs, config: DevroomConfig) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "devroom=debug,sandbox_runtime=debug,tower_http=debug,info"
    } else {
        "devroom=info,sandbox_runtime=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting devroom");

    let file_config: FileConfig = config::load_config(&config.data_dir)
        .extract()
        .context("Invalid configuration")?;
    info!("Config file: {}", config.config_toml_path().display());
    let config = Arc::new(config);
    let metrics = Arc::new(ServerMetrics::new());

    let store: Arc<dyn ProjectStore> = if args.ephemeral || file_config.store.ephemeral {
        info!("Ephemeral store: nothing will survive a restart");
        Arc::new(MemoryStore::new())
    } else {
        info!("Initializing database at {}", config.db_path.display());
        Arc::new(SqliteStore::new(db::connect(&config).await?))
    };

    let sandbox_config = SandboxConfig::from_file(&file_config.sandbox, &config.data_dir);
    info!(
        "Sandboxes under {} (install: {:?}, start: {:?})",
        sandbox_config.root_dir.display(),
        sandbox_config.install_command,
        sandbox_config.start_command
    );
    let dirs = sandbox_config.clone();
    let factory: RuntimeFactory = Arc::new(move |workspace_id: &str| {
        Arc::new(LocalRuntime::new(dirs.workspace_dir(workspace_id))) as Arc<dyn SandboxRuntime>
    });
    let sandboxes = Arc::new(SandboxRegistry::new(
        factory,
        sandbox_config,
        metrics.clone(),
    ));

    let relay = Arc::new(RoomRelay::new(
        file_config.relay.queue_capacity,
        metrics.clone(),
    ));

    let app_state = AppState {
        config,
        store,
        relay,
        sandboxes: sandboxes.clone(),
        metrics,
    };

    let app = build_router(app_state);

    let host = args.host.unwrap_or(file_config.server.host);
    let port = args.port.unwrap_or(file_config.server.port);
    let addr = format!("{}:{}", host, port).parse::<SocketAddr>()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("devroom listening on http://{}", actual_addr);
    info!("API endpoints:");
    info!("  GET    /api/projects?user=      - List a member's projects");
    info!("  POST   /api/projects            - Create a project");
    info!("  GET    /api/projects/:id        - Project with its file tree");
    info!("  POST   /api/projects/:id/agent  - Deliver an agent reply");
    info!("  GET    /api/projects/:id/ws     - Workspace WebSocket");

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    info!("Stopping sandboxes...");
    sandboxes.shutdown().await;

    info!("Shutdown complete");
    server_result
}
