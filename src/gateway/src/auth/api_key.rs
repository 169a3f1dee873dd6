//! API-key credentials for the external v1 plane
//!
//! Key pairs are `ak_`-prefixed 128-bit ids with 256-bit secrets, both
//! base64url. Verification is constant-time on the secret; each accepted
//! call consumes budget from an hourly sliding window.

use crate::auth::{permission_matches, random_urlsafe};
use crate::error::{GatewayError, Result};
use lattice_shared::{ApiKey, ApiKeySummary, CreatedApiKey, KeyUsage};
use chrono::{DateTime, Duration, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{info, warn};

/// Hourly sliding-window limiter: `(key_id, hour bucket) → count`. Buckets
/// older than 24 h are purged on write.
#[derive(Default)]
struct HourlyRateLimiter {
    buckets: Mutex<HashMap<String, HashMap<i64, u32>>>,
}

impl HourlyRateLimiter {
    fn current_hour(now: DateTime<Utc>) -> i64 {
        now.timestamp() - now.timestamp().rem_euclid(3600)
    }

    fn is_limited(&self, key_id: &str, limit: u32, now: DateTime<Utc>) -> bool {
        let hour = Self::current_hour(now);
        self.buckets
            .lock()
            .get(key_id)
            .and_then(|counts| counts.get(&hour))
            .map(|count| *count >= limit)
            .unwrap_or(false)
    }

    fn record(&self, key_id: &str, now: DateTime<Utc>) {
        let hour = Self::current_hour(now);
        let cutoff = hour - 24 * 3600;
        let mut buckets = self.buckets.lock();
        let counts = buckets.entry(key_id.to_string()).or_default();
        *counts.entry(hour).or_insert(0) += 1;
        counts.retain(|bucket, _| *bucket >= cutoff);
    }

    fn usage(&self, key_id: &str, limit: u32, now: DateTime<Utc>) -> KeyUsage {
        let hour = Self::current_hour(now);
        let used = self
            .buckets
            .lock()
            .get(key_id)
            .and_then(|counts| counts.get(&hour))
            .copied()
            .unwrap_or(0);
        KeyUsage {
            current_hour_usage: used,
            remaining_requests: limit.saturating_sub(used),
            rate_limit: limit,
            reset_time: Utc.timestamp_opt(hour + 3600, 0).unwrap(),
        }
    }
}

/// Manager for API keys and their hourly budgets.
pub struct ApiKeyManager {
    keys: DashMap<String, ApiKey>,
    limiter: HourlyRateLimiter,
}

impl ApiKeyManager {
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
            limiter: HourlyRateLimiter::default(),
        }
    }

    /// `key_id` = `ak_` + 128 random bits; `secret` = 256 random bits, both
    /// base64url.
    fn generate_key_pair() -> (String, String) {
        (format!("ak_{}", random_urlsafe(16)), random_urlsafe(32))
    }

    /// Create a key. The secret is returned exactly once.
    pub fn create_api_key(
        &self,
        name: &str,
        permissions: Vec<String>,
        rate_limit: u32,
        expires_days: Option<i64>,
    ) -> CreatedApiKey {
        let (key_id, secret) = Self::generate_key_pair();
        let created_at = Utc::now();
        let expires_at = expires_days.map(|days| created_at + Duration::days(days));

        self.keys.insert(
            key_id.clone(),
            ApiKey {
                key_id: key_id.clone(),
                secret: secret.clone(),
                name: name.to_string(),
                permissions: permissions.clone(),
                rate_limit,
                expires_at,
                active: true,
                created_at,
                last_used: None,
                usage_count: 0,
            },
        );
        info!(key_id = %key_id, name = %name, "created API key");

        CreatedApiKey {
            key_id,
            key_secret: secret,
            name: name.to_string(),
            permissions,
            rate_limit,
            expires_at,
            created_at,
        }
    }

    pub fn get(&self, key_id: &str) -> Option<ApiKey> {
        self.keys.get(key_id).map(|entry| entry.clone())
    }

    /// Validate credentials only: existence, constant-time secret equality,
    /// active, not expired. Rate limiting is a separate step.
    pub fn validate(&self, key_id: &str, secret: &str) -> Result<ApiKey> {
        let key = self
            .get(key_id)
            .ok_or_else(|| GatewayError::authentication("invalid API key"))?;

        if !constant_time_eq(key.secret.as_bytes(), secret.as_bytes()) {
            return Err(GatewayError::authentication("invalid API key"));
        }
        if !key.active {
            return Err(GatewayError::authentication("API key is inactive"));
        }
        if let Some(expires_at) = key.expires_at {
            if Utc::now() > expires_at {
                return Err(GatewayError::authentication("API key has expired"));
            }
        }
        Ok(key)
    }

    /// Full acceptance path: validate, enforce the hourly budget, then
    /// consume one unit and update usage counters.
    pub fn authorize(&self, key_id: &str, secret: &str) -> Result<ApiKey> {
        let key = self.validate(key_id, secret)?;
        let now = Utc::now();

        if self.limiter.is_limited(&key.key_id, key.rate_limit, now) {
            let usage = self.limiter.usage(&key.key_id, key.rate_limit, now);
            warn!(key_id = %key.key_id, limit = key.rate_limit, "API key rate limited");
            return Err(GatewayError::RateLimited {
                limit: key.rate_limit,
                reset_time: usage.reset_time,
            });
        }

        self.limiter.record(&key.key_id, now);
        let mut updated = key;
        if let Some(mut entry) = self.keys.get_mut(key_id) {
            entry.last_used = Some(now);
            entry.usage_count += 1;
            updated = entry.clone();
        }
        Ok(updated)
    }

    pub fn usage_stats(&self, key_id: &str) -> Option<KeyUsage> {
        let key = self.get(key_id)?;
        Some(self.limiter.usage(key_id, key.rate_limit, Utc::now()))
    }

    /// Exact or `prefix:*` wildcard permission check.
    pub fn has_permission(&self, key: &ApiKey, required: &str) -> bool {
        if required.is_empty() {
            return true;
        }
        key.permissions
            .iter()
            .any(|granted| permission_matches(granted, required))
    }

    pub fn list_api_keys(&self) -> Vec<ApiKeySummary> {
        self.keys.iter().map(|entry| (&*entry).into()).collect()
    }

    /// Deactivate a key; inactive keys reject on validation.
    pub fn revoke_api_key(&self, key_id: &str) -> bool {
        match self.keys.get_mut(key_id) {
            Some(mut entry) => {
                entry.active = false;
                info!(key_id = %key_id, "revoked API key");
                true
            }
            None => false,
        }
    }
}

impl Default for ApiKeyManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Constant-time byte equality. Length mismatch returns early; only the
/// length is observable, never the position of the first difference.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
