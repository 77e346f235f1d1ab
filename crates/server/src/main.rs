mod broadcast;
mod capture;
mod floor;
mod monitor;
mod peer;
mod recordings;
mod sender;
mod session;
mod signaling;
mod web;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use squawk_protocol::Config;

use crate::broadcast::{BroadcastEvent, Dispatcher};
use crate::capture::{CaptureHub, CaptureSource};
use crate::floor::FloorArbiter;
use crate::recordings::RecordingStore;
use crate::session::SessionRegistry;
use crate::web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    // Warn early so a missing UI isn't silently a 404
    if !config.web_root.is_dir() {
        tracing::warn!(
            "Web root '{}' does not exist — the browser client will not load. \
             Set SQUAWK_WEB_ROOT to the client build directory.",
            config.web_root.display()
        );
    }

    let bind_addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid bind address")?;

    // One capture device for the whole process; every session subscribes to
    // it. A missing device degrades to silence instead of refusing to start.
    let capture_source =
        match CaptureSource::start(config.capture_source.clone(), config.sample_rate) {
            Ok(source) => Some(source),
            Err(e) => {
                tracing::warn!("Capture device unavailable, members will hear silence: {e:#}");
                None
            }
        };
    let capture = capture_source
        .as_ref()
        .map(|source| source.hub())
        .unwrap_or_else(|| CaptureHub::new(config.sample_rate));

    let registry = SessionRegistry::new();
    let arbiter = Arc::new(FloorArbiter::new(config.ptt_timeout()));
    let dispatcher = Dispatcher::spawn(Arc::clone(&registry), Arc::clone(&arbiter));

    let state = Arc::new(AppState {
        recordings: RecordingStore::new(config.recordings_dir.clone()),
        config,
        registry,
        arbiter,
        dispatcher,
        capture,
        started_at: Instant::now(),
    });

    // Floor watchdog: revoke overlong transmissions within a second
    let tick_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tick.tick().await;
            if let Some(revoked) = tick_state.arbiter.tick(Instant::now()) {
                tracing::info!(client_id = %revoked.client_id, "Transmit timeout, floor revoked");
                tick_state.dispatcher.emit(BroadcastEvent::FloorChanged);
            }
        }
    });

    let app = web::build_router(Arc::clone(&state)).layer(TraceLayer::new_for_http());

    // Print startup banner
    tracing::info!("===========================================");
    tracing::info!("  Squawk PTT Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  Listening on http://{bind_addr}");
    tracing::info!("===========================================");

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;

    tracing::info!("Server ready, accepting connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Cooperative shutdown: close every session (peer connections awaited),
    // then stop the capture device
    for session in state.registry.members(true).await {
        signaling::teardown(&state, &session).await;
    }
    if let Some(source) = capture_source {
        source.stop();
    }

    tracing::info!("Squawk server shut down cleanly");

    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("Failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
