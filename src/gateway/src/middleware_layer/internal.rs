//! Internal-token middleware for the system plane
//!
//! Accepts `X-Internal-Token` or `Authorization: Internal <token>`; a query
//! parameter fallback exists for debugging only.

use crate::error::{GatewayError, Result};
use crate::state::AppState;
use lattice_shared::InternalClaims;
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use tracing::debug;

/// Verified internal caller attached to the request.
#[derive(Debug, Clone)]
pub struct InternalContext {
    pub service_name: String,
    pub claims: InternalClaims,
}

pub async fn internal_auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    let token = extract_token(&request).ok_or_else(|| {
        GatewayError::authentication("missing internal token; provide X-Internal-Token")
    })?;

    let claims = state.internal_tokens.verify(&token)?;
    debug!(service = %claims.service_name, path = %request.uri().path(), "internal caller verified");

    request.extensions_mut().insert(InternalContext {
        service_name: claims.service_name.clone(),
        claims,
    });
    Ok(next.run(request).await)
}

fn extract_token(request: &Request) -> Option<String> {
    if let Some(token) = request
        .headers()
        .get("x-internal-token")
        .and_then(|v| v.to_str().ok())
    {
        return Some(token.to_string());
    }

    if let Some(auth) = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = auth.strip_prefix("Internal ") {
            return Some(token.to_string());
        }
    }

    request.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.strip_prefix("internal_token=").map(str::to_string)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_token_extraction_precedence() {
        let req = axum::http::Request::builder()
            .uri("/system/tasks")
            .header("x-internal-token", "from-header")
            .header("authorization", "Internal from-auth")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_token(&req).as_deref(), Some("from-header"));

        let req = axum::http::Request::builder()
            .uri("/system/tasks")
            .header("authorization", "Internal from-auth")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_token(&req).as_deref(), Some("from-auth"));

        let req = axum::http::Request::builder()
            .uri("/system/tasks?internal_token=from-query")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_token(&req).as_deref(), Some("from-query"));

        let req = axum::http::Request::builder()
            .uri("/system/tasks")
            .header("authorization", "Bearer not-internal")
            .body(Body::empty())
            .unwrap();
        assert_eq!(extract_token(&req), None);
    }
}
