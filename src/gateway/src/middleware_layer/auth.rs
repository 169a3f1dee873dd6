//! User JWT middleware for the frontend plane
//!
//! Validates the bearer token, expands the subject's roles through the
//! permission engine, and inserts a `UserContext`. The login and register
//! endpoints are exempt: they are exactly the calls a user makes before
//! holding a token.

use crate::auth::permission_matches;
use crate::error::{GatewayError, Result};
use crate::state::AppState;
use lattice_shared::TokenClaims;
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use std::collections::HashSet;
use tracing::debug;

/// Authenticated user extracted from a verified access token. The
/// permission set is the effective closure over the user's roles plus the
/// token's direct grants.
#[derive(Debug, Clone)]
pub struct UserContext {
    pub subject: String,
    pub user_id: Option<String>,
    pub roles: Vec<String>,
    pub permissions: HashSet<String>,
    pub claims: TokenClaims,
}

impl UserContext {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn has_permission(&self, required: &str) -> bool {
        self.permissions
            .iter()
            .any(|granted| permission_matches(granted, required))
    }
}

pub async fn user_auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    if is_exempt(request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let token = bearer_token(&request)
        .ok_or_else(|| GatewayError::authentication("missing bearer token"))?;
    let claims = state.tokens.verify_access(&token).await?;

    let permissions = state
        .permissions
        .subject_permissions(&claims.roles, &claims.permissions)
        .await;

    debug!(subject = %claims.sub, roles = ?claims.roles, "user authenticated");
    request.extensions_mut().insert(UserContext {
        subject: claims.sub.clone(),
        user_id: claims.user_id.clone(),
        roles: claims.roles.clone(),
        permissions,
        claims,
    });

    Ok(next.run(request).await)
}

/// Login and register need no token, whether seen with or without the
/// plane prefix.
fn is_exempt(path: &str) -> bool {
    let path = path.strip_prefix("/frontend").unwrap_or(path);
    path.starts_with("/auth/login") || path.starts_with("/auth/register")
}

fn bearer_token(request: &Request) -> Option<String> {
    let header = request.headers().get(AUTHORIZATION)?.to_str().ok()?;
    header.strip_prefix("Bearer ").map(str::to_string)
}
