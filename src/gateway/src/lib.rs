//! Lattice Gateway
//!
//! Reverse-proxy and service-mesh control surface for the Lattice
//! platform: service registry with active health checking, pluggable load
//! balancing, three authenticated API planes over one proxy core, a
//! priority task scheduler with bounded worker pools, and an SSE stream
//! hub for long-lived tool executions.

pub mod auth;
pub mod discovery;
pub mod error;
pub mod middleware_layer;
pub mod proxy;
pub mod routes;
pub mod state;
pub mod streaming;
pub mod tasks;
pub mod tracker;

pub use error::{GatewayError, Result};
pub use state::AppState;

use axum::{middleware, routing::get, Json, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Build the gateway router: the three planes, gateway introspection, and
/// the gateway's own liveness endpoint, all behind request tracking.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .nest("/frontend", routes::frontend::router(state.clone()))
        .nest("/v1", routes::v1::router(state.clone()))
        .nest("/system", routes::system::router(state.clone()))
        .nest("/gateway", routes::gateway::router())
        .route("/health", get(health))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            middleware_layer::tracking::tracking_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Liveness for the gateway itself, shaped like every backend's health
/// endpoint so it can sit behind another gateway.
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "lattice-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
