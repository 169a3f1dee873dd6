//! System plane (`/system/*`)
//!
//! Internal-token traffic. Each prefix has an explicit mode: `tasks`,
//! `services`, `monitoring`, `config`, and `streams` are handled by the
//! gateway itself; forwarding prefixes proxy to `/api/system/<rest>` on
//! the target backend; anything else is 404.

use crate::error::{GatewayError, Result};
use crate::middleware_layer;
use crate::routes::{first_segment, forward_to_service, PrefixTable};
use crate::state::AppState;
use crate::tasks::TaskFn;
use lattice_shared::{
    LoadBalanceStrategy, SseEventType, StreamEvent, TaskPriority, TaskStatus,
};
use axum::{
    extract::{Path, Query, Request, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

const LOCAL_PREFIXES: [&str; 5] = ["tasks", "services", "monitoring", "config", "streams"];

fn forward_table() -> &'static PrefixTable {
    static TABLE: OnceLock<PrefixTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        PrefixTable::new(&[
            ("agents", "agent-service"),
            ("knowledge", "knowledge-service"),
            ("models", "model-service"),
            ("mcp", "mcp-service"),
        ])
    })
}

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/tasks", get(list_tasks).post(submit_task))
        .route(
            "/tasks/:task_id",
            get(get_task).delete(cancel_task),
        )
        .route("/services", get(list_services))
        .route("/services/:name", get(service_info))
        .route("/monitoring/metrics", get(monitoring_metrics))
        .route("/config", get(config_view))
        .route("/streams/:stream_id/events", axum::routing::post(push_stream_event))
        .route("/*path", any(forward_system))
        .layer(middleware::from_fn_with_state(
            state,
            middleware_layer::internal::internal_auth_middleware,
        ))
}

async fn forward_system(State(state): State<AppState>, request: Request) -> Result<Response> {
    let path = request.uri().path().to_string();
    let prefix =
        first_segment(&path).ok_or_else(|| GatewayError::not_found("empty system path"))?;

    // Local prefixes are fully enumerated above; a miss inside one is an
    // unknown endpoint, not a forward.
    if LOCAL_PREFIXES.contains(&prefix) {
        return Err(GatewayError::not_found(format!("system endpoint {}", path)));
    }

    let service = forward_table()
        .service_for(prefix)
        .ok_or_else(|| GatewayError::not_found(format!("no route for prefix {}", prefix)))?;
    forward_to_service(
        &state,
        service,
        LoadBalanceStrategy::RoundRobin,
        format!("/api/system{}", path),
        request,
    )
    .await
}

#[derive(Debug, Deserialize)]
struct ListTasksQuery {
    status: Option<TaskStatus>,
    limit: Option<usize>,
    offset: Option<usize>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> Json<serde_json::Value> {
    let tasks = state.scheduler.list_tasks(
        query.status,
        query.limit.unwrap_or(100),
        query.offset.unwrap_or(0),
    );
    Json(serde_json::json!({ "count": tasks.len(), "tasks": tasks }))
}

#[derive(Debug, Deserialize)]
struct SubmitTaskRequest {
    name: String,
    #[serde(default = "default_priority")]
    priority: TaskPriority,
    #[serde(default = "default_max_retries")]
    max_retries: u32,
    timeout_seconds: Option<u64>,
    #[serde(default)]
    payload: serde_json::Value,
}

fn default_priority() -> TaskPriority {
    TaskPriority::Normal
}

fn default_max_retries() -> u32 {
    3
}

/// Submit a background job. A payload carrying `url` becomes deferred
/// proxy work (an internal HTTP call); anything else is echoed back as the
/// task result.
async fn submit_task(
    State(state): State<AppState>,
    Json(request): Json<SubmitTaskRequest>,
) -> Result<Response> {
    if request.name.trim().is_empty() {
        return Err(GatewayError::bad_request("task name is required"));
    }

    let proxy = state.proxy.clone();
    let callable: TaskFn = Arc::new(move |payload| {
        let proxy = proxy.clone();
        Box::pin(async move {
            match payload.get("url").and_then(|u| u.as_str()) {
                Some(url) => {
                    let method = payload
                        .get("method")
                        .and_then(|m| m.as_str())
                        .unwrap_or("GET")
                        .to_string();
                    let url = url.to_string();
                    let body = payload.get("body").cloned();
                    proxy
                        .make_internal_request(&method, &url, body, None)
                        .await
                        .map_err(|e| e.to_string())
                }
                None => Ok(payload),
            }
        })
    });

    let task_id = state.scheduler.submit(
        &request.name,
        request.priority,
        request.max_retries,
        request.timeout_seconds,
        request.payload,
        callable,
    )?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "task_id": task_id.to_string() })),
    )
        .into_response())
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    let task = state
        .scheduler
        .get_task(task_id)
        .ok_or_else(|| GatewayError::not_found(format!("task {}", task_id)))?;
    Ok(Json(serde_json::to_value(task)?))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    if state.scheduler.get_task(task_id).is_none() {
        return Err(GatewayError::not_found(format!("task {}", task_id)));
    }
    if !state.scheduler.cancel(task_id) {
        return Err(GatewayError::bad_request(
            "only pending tasks can be cancelled",
        ));
    }
    Ok(Json(serde_json::json!({ "cancelled": true })))
}

async fn list_services(State(state): State<AppState>) -> Json<serde_json::Value> {
    let services = state.registry.all_services().await;
    Json(serde_json::json!({
        "count": services.len(),
        "services": services,
    }))
}

async fn service_info(
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

async fn monitoring_metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "timestamp": Utc::now(),
        "registry": state.registry.status().await,
        "requests": state.tracker.stats(),
        "scheduler": state.scheduler.stats(),
        "pools": state.pools.all_stats(),
        "streams": state.streams.stats(),
    }))
}

async fn config_view(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.config.public_view())
}

#[derive(Debug, Deserialize)]
struct PushEventRequest {
    #[serde(rename = "type")]
    event_type: SseEventType,
    #[serde(default)]
    data: serde_json::Value,
}

/// Producer-side event push for a stream the gateway is fanning out.
async fn push_stream_event(
    State(state): State<AppState>,
    Path(stream_id): Path<Uuid>,
    Json(request): Json<PushEventRequest>,
) -> Result<Json<serde_json::Value>> {
    if state.streams.stream_info(stream_id).is_none() {
        return Err(GatewayError::not_found(format!("stream {}", stream_id)));
    }
    let queued = state
        .streams
        .send_event(stream_id, StreamEvent::new(request.event_type, request.data));
    Ok(Json(serde_json::json!({ "queued": queued })))
}
