//! External v1 plane (`/v1/*`)
//!
//! API-key authenticated traffic from outside systems. Proxied prefixes
//! use least-connections; the MCP streaming surface (create, subscribe,
//! close) is served by the gateway itself.

use crate::error::{GatewayError, Result};
use crate::middleware_layer;
use crate::routes::{first_segment, forward_to_service, PrefixTable};
use crate::state::AppState;
use lattice_shared::LoadBalanceStrategy;
use axum::{
    extract::{Path, Request, State},
    http::{HeaderValue, StatusCode},
    middleware,
    response::sse::{Event, Sse},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::OnceLock;
use uuid::Uuid;

fn prefix_table() -> &'static PrefixTable {
    static TABLE: OnceLock<PrefixTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        PrefixTable::new(&[
            ("knowledge-bases", "knowledge-service"),
            ("documents", "knowledge-service"),
            ("search", "knowledge-service"),
            ("completions", "model-service"),
            ("embeddings", "model-service"),
            ("models", "model-service"),
            ("agents", "agent-service"),
            ("files", "system-service"),
            ("upload", "system-service"),
            ("tools", "system-service"),
        ])
    })
}

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/mcp/streams", post(create_stream))
        .route("/mcp/streams/:stream_id/events", get(subscribe_stream))
        .route("/mcp/streams/:stream_id", axum::routing::delete(close_stream))
        .route("/*path", any(forward_v1))
        .layer(middleware::from_fn_with_state(
            state,
            middleware_layer::api_key::api_key_middleware,
        ))
}

async fn forward_v1(State(state): State<AppState>, request: Request) -> Result<Response> {
    let path = request.uri().path().to_string();
    let prefix = first_segment(&path).ok_or_else(|| GatewayError::not_found("empty v1 path"))?;
    let service = prefix_table()
        .service_for(prefix)
        .ok_or_else(|| GatewayError::not_found(format!("no route for prefix {}", prefix)))?;

    forward_to_service(
        &state,
        service,
        LoadBalanceStrategy::LeastConnections,
        format!("/api/v1{}", path),
        request,
    )
    .await
}

#[derive(Debug, Deserialize)]
struct CreateStreamRequest {
    service_id: String,
    user_id: Option<String>,
    tool_id: Option<String>,
    keepalive_interval: Option<u64>,
    timeout_seconds: Option<u64>,
}

async fn create_stream(
    State(state): State<AppState>,
    Json(request): Json<CreateStreamRequest>,
) -> Result<Response> {
    if request.service_id.trim().is_empty() {
        return Err(GatewayError::bad_request("service_id is required"));
    }

    let stream_id = state.streams.create_stream(
        &request.service_id,
        request.user_id,
        request.tool_id,
        request.keepalive_interval,
        request.timeout_seconds,
    );

    let mut response = (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "stream_id": stream_id.to_string(),
            "service_id": request.service_id,
            "status": "active",
        })),
    )
        .into_response();
    set_stream_headers(&mut response, stream_id);
    Ok(response)
}

async fn subscribe_stream(
    State(state): State<AppState>,
    Path(stream_id): Path<Uuid>,
) -> Result<Response> {
    let events = state
        .streams
        .subscribe(stream_id)
        .ok_or_else(|| GatewayError::not_found(format!("stream {}", stream_id)))?;

    let frames = events.map(|event| {
        Ok::<Event, Infallible>(
            Event::default()
                .event(event.event_type.as_str())
                .data(event.frame_data().to_string()),
        )
    });

    let mut response = Sse::new(frames).into_response();
    set_stream_headers(&mut response, stream_id);
    Ok(response)
}

async fn close_stream(
    State(state): State<AppState>,
    Path(stream_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    if state.streams.stream_info(stream_id).is_none() {
        return Err(GatewayError::not_found(format!("stream {}", stream_id)));
    }
    let closed = state.streams.close_stream(stream_id);
    Ok(Json(serde_json::json!({ "closed": closed })))
}

fn set_stream_headers(response: &mut Response, stream_id: Uuid) {
    let headers = response.headers_mut();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));
    if let Ok(value) = HeaderValue::from_str(&stream_id.to_string()) {
        headers.insert("X-Stream-ID", value);
    }
}
