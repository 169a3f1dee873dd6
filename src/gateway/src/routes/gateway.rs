//! Gateway introspection (`/gateway/*`)
//!
//! Registry and health views plus the registration endpoints served by the
//! bridge.

use crate::error::{GatewayError, Result};
use crate::state::AppState;
use lattice_shared::RegisterRequest;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use std::collections::HashMap;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/services", get(all_services))
        .route("/services/register", post(register_service))
        .route("/services/batch/health-check", post(batch_health_check))
        .route("/services/:name", get(service_detail))
        .route("/services/:name/:instance_id", delete(deregister_service))
        .route("/health", get(gateway_health))
        .route("/metrics", get(gateway_metrics))
        .route("/registry/status", get(registry_status))
}

async fn all_services(State(state): State<AppState>) -> Json<serde_json::Value> {
    let services = state.registry.all_services().await;
    let mut views = serde_json::Map::new();
    for name in services.keys() {
        if let Some(info) = state.registry.service_info(name).await {
            views.insert(name.clone(), serde_json::to_value(info).unwrap_or_default());
        }
    }
    Json(serde_json::json!({ "count": views.len(), "services": views }))
}

async fn service_detail(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let info = state
        .registry
        .service_info(&name)
        .await
        .ok_or_else(|| GatewayError::not_found(format!("service {}", name)))?;
    Ok(Json(serde_json::to_value(info)?))
}

async fn register_service(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Response> {
    let service_name = request.service_name.clone();
    let instance_id = request.instance_id.clone();
    state.bridge.register(request).await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "registered": true,
            "service_name": service_name,
            "instance_id": instance_id,
        })),
    )
        .into_response())
}

async fn deregister_service(
    State(state): State<AppState>,
    Path((name, instance_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>> {
    state.bridge.deregister(&name, &instance_id).await?;
    Ok(Json(serde_json::json!({ "deregistered": true })))
}

async fn gateway_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let pools = state.pools.health_check();
    let status = if pools["healthy"] == true {
        "healthy"
    } else {
        "degraded"
    };
    Json(serde_json::json!({
        "status": status,
        "service": "lattice-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now(),
        "registry": state.registry.status().await,
        "pools": pools,
    }))
}

async fn gateway_metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.tracker.stats())
}

async fn registry_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let services = state.registry.all_services().await;
    let names: Vec<&String> = services.keys().collect();
    Json(serde_json::json!({
        "status": state.registry.status().await,
        "services": names,
    }))
}

#[derive(Debug, serde::Deserialize, Default)]
struct BatchHealthCheckRequest {
    #[serde(default)]
    urls: Vec<String>,
}

/// Probe the given URLs, or every registered instance's health URL when
/// none are given.
async fn batch_health_check(
    State(state): State<AppState>,
    body: Option<Json<BatchHealthCheckRequest>>,
) -> Json<serde_json::Value> {
    let urls = match body {
        Some(Json(request)) if !request.urls.is_empty() => request.urls,
        _ => {
            let services = state.registry.all_services().await;
            services
                .values()
                .flatten()
                .map(|instance| instance.health_url())
                .collect()
        }
    };

    let results: HashMap<String, bool> = state.proxy.batch_health_check(&urls).await;
    Json(serde_json::json!({ "checked": results.len(), "results": results }))
}
