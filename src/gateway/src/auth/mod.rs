//! Credential verification: user JWTs, API keys, internal service tokens,
//! and the role/permission engine behind all three.

pub mod api_key;
pub mod internal;
pub mod jwt;
pub mod permissions;

pub use api_key::ApiKeyManager;
pub use internal::{InternalTokenManager, ServiceTokens};
pub use jwt::TokenManager;
pub use permissions::PermissionEngine;

use base64::Engine as _;
use rand::RngCore;

/// URL-safe base64 rendering of `n` random bytes. Used for JWT ids and
/// API-key material.
pub(crate) fn random_urlsafe(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Wildcard-aware permission match: `granted` covers `required` when equal,
/// or when `granted` ends in `:*` and `required` shares its prefix.
pub(crate) fn permission_matches(granted: &str, required: &str) -> bool {
    if granted == required {
        return true;
    }
    if let Some(prefix) = granted.strip_suffix(":*") {
        // `prefix:*` covers `prefix:anything`, including bare `prefix:`.
        return required.starts_with(prefix)
            && required[prefix.len()..].starts_with(':');
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_urlsafe_length_and_charset() {
        let rendered = random_urlsafe(16);
        // 16 bytes → 22 base64url chars, no padding.
        assert_eq!(rendered.len(), 22);
        assert!(rendered
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(random_urlsafe(16), random_urlsafe(16));
    }

    #[test]
    fn test_permission_matches() {
        assert!(permission_matches("knowledge:read", "knowledge:read"));
        assert!(permission_matches("knowledge:*", "knowledge:read"));
        assert!(permission_matches("system:*", "system:tasks"));
        assert!(!permission_matches("knowledge:*", "knowledgebase:read"));
        assert!(!permission_matches("knowledge:read", "knowledge:write"));
        assert!(!permission_matches("knowledge", "knowledge:read"));
    }
}
