//! Request tracking middleware
//!
//! Assigns each request its UUID, keeps the in-flight entry for the
//! handler's lifetime, and echoes the id as `X-Request-ID`.

use crate::state::AppState;
use axum::{
    extract::{Request, State},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

/// Request id carried through handler extensions.
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub Uuid);

pub async fn tracking_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let endpoint = request.uri().path().to_string();
    let method = request.method().to_string();
    let client_ip = header_or(&request, "x-forwarded-for", "unknown");
    let user_agent = header_or(&request, "user-agent", "unknown");

    let request_id = state
        .tracker
        .start_request(&endpoint, &method, &client_ip, &user_agent);
    request.extensions_mut().insert(RequestId(request_id));

    let mut response = next.run(request).await;

    let status = response.status();
    let error = if status.is_client_error() || status.is_server_error() {
        Some(
            status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_string(),
        )
    } else {
        None
    };
    state.tracker.end_request(request_id, status.as_u16(), error);

    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert("X-Request-ID", value);
    }
    response
}

fn header_or(request: &Request, name: &str, fallback: &str) -> String {
    request
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or(fallback)
        .to_string()
}
