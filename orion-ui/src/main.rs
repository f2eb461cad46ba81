//! Orion control server - HTTP operator surface and live dashboard stream.

mod error;
mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::routing::get;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::info;

use orion::control::{Adapters, Runtime};
use orion::io::config::{CONFIG_FILE, load_config};
use orion::io::sink::{BroadcastSink, DashboardSink, FanoutSink, TracingSink};
use orion::io::store::JsonFileStore;

use crate::state::AppState;

/// Buffered updates per SSE client before it starts lagging.
const EVENT_CAPACITY: usize = 256;

#[derive(Parser)]
#[command(name = "orion-ui")]
#[command(about = "Run Orion with an HTTP control API and live dashboard stream")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3001")]
    port: u16,

    /// Path to orion.toml; `state_dir` resolves relative to its directory
    #[arg(long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Directory containing UI static files (defaults to ./ui/dist next to the config)
    #[arg(long)]
    ui_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("orion=info".parse()?)
                .add_directive("orion_ui=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let config = load_config(&args.config)?;
    let root = args
        .config
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let state_dir = config.state_dir_in(&root);
    info!(state_dir = %state_dir.display(), "starting orion-ui");

    let events = BroadcastSink::new(EVENT_CAPACITY);
    let sinks: Vec<Arc<dyn DashboardSink>> = vec![Arc::new(TracingSink), Arc::new(events.clone())];
    let adapters = Adapters::from_config(&config, Arc::new(FanoutSink::new(sinks)))?;
    let runtime = Runtime::build(&config, Arc::new(JsonFileStore::new(state_dir)), adapters)?;
    runtime.start()?;

    let state = AppState::new(runtime.control().clone(), events);
    let ui_dir = args.ui_dir.unwrap_or_else(|| root.join("ui").join("dist"));
    let app = app(state, &ui_dir);

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(err = %err, "ctrl-c listener failed");
            }
        })
        .await
        .context("serve http");

    runtime.shutdown().await;
    served
}

fn app(state: AppState, ui_dir: &std::path::Path) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api", routes::api_router())
        .route("/events", get(sse::events_handler))
        .layer(cors)
        .with_state(state);

    // Serve static UI files if available
    if ui_dir.exists() {
        info!(ui_dir = %ui_dir.display(), "serving static UI files");
        app.fallback_service(ServeDir::new(ui_dir).append_index_html_on_directories(true))
    } else {
        info!(ui_dir = %ui_dir.display(), "UI directory not found, API-only mode");
        app
    }
}
