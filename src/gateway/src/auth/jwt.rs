//! User JWT management
//!
//! Issues and verifies HMAC-SHA256 access/refresh token pairs, tracks
//! revoked token ids in a denylist, and sweeps the denylist as entries
//! expire naturally.

use crate::auth::random_urlsafe;
use crate::error::{GatewayError, Result};
use lattice_shared::{AuthConfig, TokenClaims, TokenPair, TokenType};
use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Manager for user access and refresh tokens.
pub struct TokenManager {
    config: AuthConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    /// Revoked `jti → exp`; swept once the expiry passes.
    denylist: RwLock<HashMap<String, i64>>,
}

impl TokenManager {
    pub fn new(config: AuthConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.jwt_secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.jwt_secret.as_bytes());
        Self {
            config,
            encoding_key,
            decoding_key,
            denylist: RwLock::new(HashMap::new()),
        }
    }

    /// Issue an access token for `subject`.
    pub fn create_access_token(
        &self,
        subject: &str,
        user_id: Option<&str>,
        roles: Vec<String>,
        permissions: Vec<String>,
    ) -> Result<String> {
        let now = Utc::now();
        let expires = now + Duration::minutes(self.config.access_token_expire_minutes);
        self.encode_claims(TokenClaims {
            sub: subject.to_string(),
            user_id: user_id.map(str::to_string),
            roles,
            permissions,
            iat: now.timestamp(),
            exp: expires.timestamp(),
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            token_type: TokenType::Access,
            jti: random_urlsafe(16),
        })
    }

    /// Issue a refresh token for `subject`.
    pub fn create_refresh_token(&self, subject: &str, user_id: Option<&str>) -> Result<String> {
        let now = Utc::now();
        let expires = now + Duration::days(self.config.refresh_token_expire_days);
        self.encode_claims(TokenClaims {
            sub: subject.to_string(),
            user_id: user_id.map(str::to_string),
            roles: Vec::new(),
            permissions: Vec::new(),
            iat: now.timestamp(),
            exp: expires.timestamp(),
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            token_type: TokenType::Refresh,
            jti: random_urlsafe(16),
        })
    }

    /// Issue an access/refresh pair.
    pub fn create_token_pair(
        &self,
        subject: &str,
        user_id: Option<&str>,
        roles: Vec<String>,
        permissions: Vec<String>,
    ) -> Result<TokenPair> {
        let access_token = self.create_access_token(subject, user_id, roles, permissions)?;
        let refresh_token = self.create_refresh_token(subject, user_id)?;
        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_in: self.config.access_token_expire_minutes * 60,
            token_type: "Bearer".to_string(),
        })
    }

    /// Verify signature, expiry, audience, and issuer, then the revocation
    /// set.
    pub async fn verify(&self, token: &str) -> Result<TokenClaims> {
        let claims = decode::<TokenClaims>(token, &self.decoding_key, &self.validation())
            .map_err(|e| {
                debug!(error = %e, "token verification failed");
                GatewayError::authentication("invalid or expired token")
            })?
            .claims;

        if self.denylist.read().await.contains_key(&claims.jti) {
            warn!(subject = %claims.sub, "revoked token presented");
            return Err(GatewayError::authentication("token has been revoked"));
        }

        Ok(claims)
    }

    /// Verify and additionally require an access token.
    pub async fn verify_access(&self, token: &str) -> Result<TokenClaims> {
        let claims = self.verify(token).await?;
        if claims.token_type != TokenType::Access {
            return Err(GatewayError::authentication("not an access token"));
        }
        Ok(claims)
    }

    /// Exchange a valid refresh token for a new access token. The refresh
    /// token's own lifetime is untouched.
    pub async fn refresh_access_token(&self, refresh_token: &str) -> Result<String> {
        let claims = self.verify(refresh_token).await?;
        if claims.token_type != TokenType::Refresh {
            return Err(GatewayError::authentication("not a refresh token"));
        }

        // Roles and permissions are re-resolved by the account backend on
        // next login; the refreshed access token carries none.
        let token = self.create_access_token(&claims.sub, claims.user_id.as_deref(), Vec::new(), Vec::new())?;
        info!(subject = %claims.sub, "access token refreshed");
        Ok(token)
    }

    /// Place a token's `jti` in the denylist. Works on expired tokens too,
    /// so logout of a stale session cannot fail.
    pub async fn revoke(&self, token: &str) -> bool {
        let claims = match self.decode_unverified(token) {
            Ok(claims) => claims,
            Err(_) => return false,
        };
        self.denylist
            .write()
            .await
            .insert(claims.jti, claims.exp);
        info!(subject = %claims.sub, "token revoked");
        true
    }

    pub async fn is_revoked(&self, jti: &str) -> bool {
        self.denylist.read().await.contains_key(jti)
    }

    /// Drop denylist entries whose expiry has passed. Returns the number
    /// swept.
    pub async fn sweep_denylist(&self) -> usize {
        let now = Utc::now().timestamp();
        let mut denylist = self.denylist.write().await;
        let before = denylist.len();
        denylist.retain(|_, exp| *exp > now);
        let swept = before - denylist.len();
        if swept > 0 {
            info!(swept, "swept expired denylist entries");
        }
        swept
    }

    /// Introspection view of a token. Only an expired signature falls back
    /// to the unverified decode, and then identity fields only; any other
    /// failure, revocation included, discloses no claims at all.
    pub async fn token_info(&self, token: &str) -> serde_json::Value {
        match decode::<TokenClaims>(token, &self.decoding_key, &self.validation()) {
            Ok(data) => {
                let claims = data.claims;
                if self.denylist.read().await.contains_key(&claims.jti) {
                    return serde_json::json!({
                        "is_expired": null,
                        "is_revoked": true,
                        "error": "token has been revoked",
                    });
                }
                serde_json::json!({
                    "subject": claims.sub,
                    "user_id": claims.user_id,
                    "roles": claims.roles,
                    "permissions": claims.permissions,
                    "issued_at": claims.iat,
                    "expires_at": claims.exp,
                    "token_type": claims.token_type,
                    "jwt_id": claims.jti,
                    "is_expired": false,
                    "is_revoked": false,
                })
            }
            Err(e) if matches!(e.kind(), ErrorKind::ExpiredSignature) => {
                match self.decode_unverified(token) {
                    Ok(claims) => {
                        let revoked = self.is_revoked(&claims.jti).await;
                        serde_json::json!({
                            "subject": claims.sub,
                            "user_id": claims.user_id,
                            "token_type": claims.token_type,
                            "jwt_id": claims.jti,
                            "is_expired": true,
                            "is_revoked": revoked,
                        })
                    }
                    Err(_) => serde_json::json!({
                        "is_expired": null,
                        "is_revoked": false,
                        "error": "undecodable token",
                    }),
                }
            }
            Err(e) => serde_json::json!({
                "is_expired": null,
                "is_revoked": false,
                "error": e.to_string(),
            }),
        }
    }

    pub async fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "denylisted_tokens": self.denylist.read().await.len(),
            "access_token_expire_minutes": self.config.access_token_expire_minutes,
            "refresh_token_expire_days": self.config.refresh_token_expire_days,
            "issuer": self.config.issuer,
            "audience": self.config.audience,
        })
    }

    fn encode_claims(&self, claims: TokenClaims) -> Result<String> {
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| GatewayError::internal(format!("failed to sign token: {}", e)))
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[&self.config.audience]);
        validation.set_issuer(&[&self.config.issuer]);
        validation.leeway = 0;
        validation
    }

    fn decode_unverified(&self, token: &str) -> Result<TokenClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        decode::<TokenClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|_| GatewayError::authentication("undecodable token"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TokenManager {
        TokenManager::new(AuthConfig {
            jwt_secret: "unit-test-signing-key".to_string(),
            access_token_expire_minutes: 30,
            refresh_token_expire_days: 7,
            issuer: "lattice-gateway".to_string(),
            audience: "lattice-services".to_string(),
        })
    }

    #[tokio::test]
    async fn test_access_token_round_trip() {
        let manager = manager();
        let token = manager
            .create_access_token(
                "alice",
                Some("user-1"),
                vec!["user".into()],
                vec!["agent.execute".into()],
            )
            .unwrap();

        let claims = manager.verify_access(&token).await.unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.user_id.as_deref(), Some("user-1"));
        assert_eq!(claims.roles, vec!["user"]);
        assert_eq!(claims.token_type, TokenType::Access);
        assert!(!claims.jti.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let manager = manager();
        let other = TokenManager::new(AuthConfig {
            jwt_secret: "a-different-key".to_string(),
            access_token_expire_minutes: 30,
            refresh_token_expire_days: 7,
            issuer: "lattice-gateway".to_string(),
            audience: "lattice-services".to_string(),
        });

        let token = manager
            .create_access_token("alice", None, vec![], vec![])
            .unwrap();
        assert!(other.verify(&token).await.is_err());
    }

    #[tokio::test]
    async fn test_refresh_flow() {
        let manager = manager();
        let pair = manager
            .create_token_pair("alice", Some("user-1"), vec!["user".into()], vec![])
            .unwrap();
        assert_eq!(pair.token_type, "Bearer");
        assert_eq!(pair.expires_in, 30 * 60);

        // A refresh token cannot be used as an access token, and vice versa.
        assert!(manager.verify_access(&pair.refresh_token).await.is_err());
        assert!(manager
            .refresh_access_token(&pair.access_token)
            .await
            .is_err());

        let refreshed = manager
            .refresh_access_token(&pair.refresh_token)
            .await
            .unwrap();
        let claims = manager.verify_access(&refreshed).await.unwrap();
        assert_eq!(claims.sub, "alice");
    }

    #[tokio::test]
    async fn test_revocation_until_expiry() {
        let manager = manager();
        let token = manager
            .create_access_token("alice", None, vec![], vec![])
            .unwrap();
        let jti = manager.verify(&token).await.unwrap().jti;

        assert!(manager.revoke(&token).await);
        assert!(manager.is_revoked(&jti).await);
        assert!(manager.verify(&token).await.is_err());

        // Entry is still live, so the sweep keeps it.
        assert_eq!(manager.sweep_denylist().await, 0);
        assert!(manager.is_revoked(&jti).await);
    }

    #[tokio::test]
    async fn test_sweep_drops_expired_entries() {
        let manager = manager();
        manager
            .denylist
            .write()
            .await
            .insert("stale".to_string(), Utc::now().timestamp() - 10);
        manager
            .denylist
            .write()
            .await
            .insert("live".to_string(), Utc::now().timestamp() + 3600);

        assert_eq!(manager.sweep_denylist().await, 1);
        assert!(!manager.is_revoked("stale").await);
        assert!(manager.is_revoked("live").await);
    }

    #[tokio::test]
    async fn test_token_info_withholds_claims_once_revoked() {
        let manager = manager();
        let token = manager
            .create_access_token("alice", Some("user-1"), vec!["user".into()], vec![])
            .unwrap();

        let info = manager.token_info(&token).await;
        assert_eq!(info["subject"], "alice");
        assert_eq!(info["is_expired"], false);
        assert_eq!(info["is_revoked"], false);

        manager.revoke(&token).await;
        let revoked = manager.token_info(&token).await;
        assert_eq!(revoked["is_revoked"], true);
        assert!(revoked.get("error").is_some());
        assert!(revoked.get("subject").is_none());
        assert!(revoked.get("jwt_id").is_none());
    }

    #[tokio::test]
    async fn test_token_info_expired_discloses_identity_only() {
        let manager = manager();
        let now = Utc::now();
        let expired = manager
            .encode_claims(TokenClaims {
                sub: "alice".into(),
                user_id: Some("user-1".into()),
                roles: vec!["user".into()],
                permissions: vec!["agent.execute".into()],
                iat: (now - Duration::minutes(60)).timestamp(),
                exp: (now - Duration::minutes(30)).timestamp(),
                iss: "lattice-gateway".into(),
                aud: "lattice-services".into(),
                token_type: TokenType::Access,
                jti: "expired-jti".into(),
            })
            .unwrap();

        let info = manager.token_info(&expired).await;
        assert_eq!(info["is_expired"], true);
        assert_eq!(info["subject"], "alice");
        assert_eq!(info["jwt_id"], "expired-jti");
        // The expired view names the token, never its grants.
        assert!(info.get("roles").is_none());
        assert!(info.get("permissions").is_none());
    }

    #[tokio::test]
    async fn test_token_info_other_failures_disclose_nothing() {
        let manager = manager();
        let other = TokenManager::new(AuthConfig {
            jwt_secret: "a-different-key".to_string(),
            access_token_expire_minutes: 30,
            refresh_token_expire_days: 7,
            issuer: "lattice-gateway".to_string(),
            audience: "lattice-services".to_string(),
        });
        let forged = other
            .create_access_token("mallory", None, vec!["admin".into()], vec![])
            .unwrap();

        let info = manager.token_info(&forged).await;
        assert!(info.get("error").is_some());
        assert!(info.get("subject").is_none());
        assert_eq!(info["is_revoked"], false);

        let garbage = manager.token_info("not-a-token").await;
        assert!(garbage.get("error").is_some());
        assert!(garbage.get("subject").is_none());
    }
}
