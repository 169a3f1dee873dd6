//! Frontend plane (`/frontend/*`)
//!
//! User-facing application traffic. Everything except login and register
//! requires a user JWT; the prefix table projects the path onto a backend
//! and forwards to `/api/<rest>` on the selected instance.

use crate::error::{GatewayError, Result};
use crate::middleware_layer;
use crate::routes::{first_segment, forward_to_service, PrefixTable};
use crate::state::AppState;
use lattice_shared::LoadBalanceStrategy;
use axum::{
    extract::{Request, State},
    middleware,
    response::Response,
    routing::any,
    Router,
};
use std::sync::OnceLock;

fn prefix_table() -> &'static PrefixTable {
    static TABLE: OnceLock<PrefixTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        PrefixTable::new(&[
            ("agents", "agent-service"),
            ("knowledge", "knowledge-service"),
            ("models", "model-service"),
            ("upload", "system-service"),
            ("files", "system-service"),
            ("system-config", "system-service"),
            ("auth", "base-service"),
            ("users", "base-service"),
            ("permissions", "base-service"),
        ])
    })
}

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/*path", any(forward_frontend))
        .layer(middleware::from_fn_with_state(
            state,
            middleware_layer::auth::user_auth_middleware,
        ))
}

async fn forward_frontend(State(state): State<AppState>, request: Request) -> Result<Response> {
    let path = request.uri().path().to_string();
    let prefix =
        first_segment(&path).ok_or_else(|| GatewayError::not_found("empty frontend path"))?;
    let service = prefix_table()
        .service_for(prefix)
        .ok_or_else(|| GatewayError::not_found(format!("no route for prefix {}", prefix)))?;

    forward_to_service(
        &state,
        service,
        LoadBalanceStrategy::RoundRobin,
        format!("/api{}", path),
        request,
    )
    .await
}
