//! CamHub - surveillance-media management hub
//!
//! Main entry point: devices and clients share one listener; every accepted
//! connection becomes a session task.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use camhub::relay_directory::MemoryRelayDirectory;
use camhub::session::Session;
use camhub::state::{AppConfig, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camhub=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting CamHub v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        host = %config.host,
        port = config.port,
        snap_local_path = %config.snap_local_path.display(),
        "Configuration loaded"
    );

    let relays = Arc::new(MemoryRelayDirectory::new());
    let state = AppState::new(config, relays);

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    loop {
        let (socket, peer) = listener.accept().await?;

        if state.session_count.load(Ordering::Relaxed) >= state.config.max_connections {
            tracing::warn!(peer = %peer, "Connection refused, session limit reached");
            drop(socket);
            continue;
        }

        let (session, rx) = Session::new(state.clone());
        tracing::debug!(peer = %peer, session_id = %session.id(), "Connection accepted");
        tokio::spawn(session.run(socket, rx));
    }
}
