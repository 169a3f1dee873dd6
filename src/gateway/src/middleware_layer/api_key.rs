//! API-key middleware for the external v1 plane
//!
//! Credentials arrive as `X-API-Key`/`X-API-Secret` headers, an
//! `Authorization: Bearer <key_id>:<secret>` pair, or query parameters
//! (testing only). Acceptance consumes hourly budget; exhaustion surfaces
//! 429 with the reset time.

use crate::error::{GatewayError, Result};
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use tracing::debug;

/// Accepted API key attached to the request.
#[derive(Debug, Clone)]
pub struct ApiKeyContext {
    pub key_id: String,
    pub name: String,
    pub permissions: Vec<String>,
}

pub async fn api_key_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    let (key_id, secret) = extract_credentials(&request).ok_or_else(|| {
        GatewayError::authentication("missing API key; provide X-API-Key and X-API-Secret")
    })?;

    let key = state.api_keys.authorize(&key_id, &secret)?;
    debug!(key_id = %key.key_id, name = %key.name, path = %request.uri().path(), "API key accepted");

    request.extensions_mut().insert(ApiKeyContext {
        key_id: key.key_id,
        name: key.name,
        permissions: key.permissions,
    });
    Ok(next.run(request).await)
}

/// Extraction precedence: dedicated headers, then the bearer pair, then
/// query parameters.
fn extract_credentials(request: &Request) -> Option<(String, String)> {
    let headers = request.headers();

    let key = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    let secret = headers.get("x-api-secret").and_then(|v| v.to_str().ok());
    if let (Some(key), Some(secret)) = (key, secret) {
        return Some((key.to_string(), secret.to_string()));
    }

    if let Some(auth) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(pair) = auth.strip_prefix("Bearer ") {
            if let Some((key, secret)) = pair.split_once(':') {
                return Some((key.to_string(), secret.to_string()));
            }
        }
    }

    let query = request.uri().query()?;
    let mut key = None;
    let mut secret = None;
    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("api_key", value)) => key = Some(value.to_string()),
            Some(("api_secret", value)) => secret = Some(value.to_string()),
            _ => {}
        }
    }
    Some((key?, secret?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(builder: axum::http::request::Builder) -> Request {
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_header_extraction() {
        let req = request(
            axum::http::Request::builder()
                .uri("/v1/models")
                .header("x-api-key", "ak_1")
                .header("x-api-secret", "s1"),
        );
        assert_eq!(
            extract_credentials(&req),
            Some(("ak_1".to_string(), "s1".to_string()))
        );
    }

    #[test]
    fn test_bearer_pair_extraction() {
        let req = request(
            axum::http::Request::builder()
                .uri("/v1/models")
                .header("authorization", "Bearer ak_2:s2"),
        );
        assert_eq!(
            extract_credentials(&req),
            Some(("ak_2".to_string(), "s2".to_string()))
        );
    }

    #[test]
    fn test_query_extraction_and_missing() {
        let req = request(
            axum::http::Request::builder().uri("/v1/models?api_key=ak_3&api_secret=s3"),
        );
        assert_eq!(
            extract_credentials(&req),
            Some(("ak_3".to_string(), "s3".to_string()))
        );

        let bare = request(axum::http::Request::builder().uri("/v1/models"));
        assert_eq!(extract_credentials(&bare), None);

        // A bearer token without the pair separator is not an API key.
        let plain = request(
            axum::http::Request::builder()
                .uri("/v1/models")
                .header("authorization", "Bearer just-a-jwt"),
        );
        assert_eq!(extract_credentials(&plain), None);
    }
}
