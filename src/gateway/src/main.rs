//! Lattice Gateway binary
//!
//! Loads configuration from the environment, builds the composed
//! application state, and serves until interrupted. Missing signing
//! secrets and bind failures are fatal startup errors.

use lattice_gateway::{build_router, AppState};
use lattice_shared::GatewayConfig;
use std::net::SocketAddr;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("starting lattice-gateway v{}", env!("CARGO_PKG_VERSION"));

    let config = GatewayConfig::from_env()
        .map_err(|e| anyhow::anyhow!("configuration error: {}", e))?;

    let state = AppState::new(config.clone())
        .await
        .map_err(|e| anyhow::anyhow!("failed to initialize application state: {}", e))?;
    state.start_background().await;

    let app = build_router(state.clone());
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address: {}", e))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("cannot bind {}: {}", addr, e))?;

    info!("gateway listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.shutdown().await;
    info!("gateway exited cleanly");
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lattice_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => warn!("received Ctrl+C, shutting down"),
        _ = terminate => warn!("received SIGTERM, shutting down"),
    }
}
