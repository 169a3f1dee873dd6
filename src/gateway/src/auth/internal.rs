//! Internal service-to-service tokens
//!
//! Short-lived tokens signed with a secret distinct from the user JWT key.
//! Only services in the closed allow-list may hold one; permissions default
//! to the implicit `system:*` grant.

use crate::auth::permission_matches;
use crate::error::{GatewayError, Result};
use lattice_shared::{InternalAuthConfig, InternalClaims};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

const TOKEN_TYPE: &str = "internal_token";
const ISSUER: &str = "gateway-service";

/// Issues and verifies inter-service tokens.
pub struct InternalTokenManager {
    config: InternalAuthConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    valid_services: HashMap<&'static str, &'static str>,
}

impl InternalTokenManager {
    pub fn new(config: InternalAuthConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());
        let valid_services = HashMap::from([
            ("gateway-service", "Gateway"),
            ("agent-service", "Agent runtime"),
            ("knowledge-service", "Knowledge base"),
            ("model-service", "Model access"),
            ("base-service", "Accounts and auth"),
            ("database-service", "Database access"),
            ("system-service", "System utilities"),
            ("knowledge-graph-service", "Knowledge graph"),
            ("mcp-service", "MCP tools"),
        ]);
        Self {
            config,
            encoding_key,
            decoding_key,
            valid_services,
        }
    }

    pub fn known_services(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.valid_services.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Issue a token for `service_name`. Unknown services are rejected.
    pub fn generate(
        &self,
        service_name: &str,
        permissions: Option<Vec<String>>,
    ) -> Result<String> {
        if !self.valid_services.contains_key(service_name) {
            return Err(GatewayError::bad_request(format!(
                "unknown service: {}",
                service_name
            )));
        }

        let now = Utc::now();
        let claims = InternalClaims {
            service_name: service_name.to_string(),
            permissions: permissions.unwrap_or_else(|| vec!["system:*".to_string()]),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(self.config.token_ttl_seconds)).timestamp(),
            token_type: TOKEN_TYPE.to_string(),
            issuer: ISSUER.to_string(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| GatewayError::internal(format!("failed to sign internal token: {}", e)))
    }

    /// Verify signature and expiry, then the token type, issuer, and
    /// service allow-list.
    pub fn verify(&self, token: &str) -> Result<InternalClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        validation.leeway = 0;

        let claims = decode::<InternalClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| {
                debug!(error = %e, "internal token verification failed");
                GatewayError::authentication("invalid internal token")
            })?
            .claims;

        if claims.token_type != TOKEN_TYPE {
            return Err(GatewayError::authentication("invalid token type"));
        }
        if claims.issuer != ISSUER {
            return Err(GatewayError::authentication("invalid token issuer"));
        }
        if !self.valid_services.contains_key(claims.service_name.as_str()) {
            return Err(GatewayError::authentication("unknown service name"));
        }

        Ok(claims)
    }

    /// Exact match, `prefix:*` wildcard, or the implicit `system:*` grant.
    pub fn has_permission(&self, claims: &InternalClaims, required: &str) -> bool {
        claims
            .permissions
            .iter()
            .any(|granted| granted == "system:*" || permission_matches(granted, required))
    }
}

/// Cache of one pre-issued token per known service, refreshed on demand.
pub struct ServiceTokens {
    tokens: RwLock<HashMap<String, String>>,
}

impl ServiceTokens {
    pub async fn issue_all(manager: &InternalTokenManager) -> Self {
        let mut tokens = HashMap::new();
        for service in manager.known_services() {
            match manager.generate(service, None) {
                Ok(token) => {
                    tokens.insert(service.to_string(), token);
                }
                Err(e) => {
                    // Unreachable for known services; keep issuing the rest.
                    debug!(service = %service, error = %e, "failed to issue service token");
                }
            }
        }
        info!(count = tokens.len(), "issued internal service tokens");
        Self {
            tokens: RwLock::new(tokens),
        }
    }

    pub async fn get(&self, service_name: &str) -> Option<String> {
        self.tokens.read().await.get(service_name).cloned()
    }

    pub async fn refresh(
        &self,
        manager: &InternalTokenManager,
        service_name: &str,
    ) -> Result<String> {
        let token = manager.generate(service_name, None)?;
        self.tokens
            .write()
            .await
            .insert(service_name.to_string(), token.clone());
        info!(service = %service_name, "refreshed internal service token");
        Ok(token)
    }
}
