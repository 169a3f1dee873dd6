//! Gateway configuration
//!
//! Configuration is environment-driven: every tunable has a default, and the
//! two signing secrets are required. `GatewayConfig::from_env` is the single
//! entry point; the binary treats its errors as fatal.

use serde::Serialize;
use thiserror::Error;

/// Errors raised while loading configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingSecret(&'static str),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Top-level gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub internal_auth: InternalAuthConfig,
    pub registry: RegistryConfig,
    pub proxy: ProxyConfig,
    pub scheduler: SchedulerConfig,
    pub streams: StreamConfig,
}

/// HTTP server binding.
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// User JWT signing configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub access_token_expire_minutes: i64,
    pub refresh_token_expire_days: i64,
    pub issuer: String,
    pub audience: String,
}

/// Internal service token configuration. The secret is distinct from the
/// user JWT secret.
#[derive(Debug, Clone)]
pub struct InternalAuthConfig {
    pub secret: String,
    pub token_ttl_seconds: i64,
}

/// Registry health-check cadence.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryConfig {
    pub health_check_interval_secs: u64,
    pub probe_timeout_secs: u64,
}

/// Proxy forwarding defaults.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
}

/// Task scheduler sizing.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerConfig {
    pub pool_size: usize,
    pub queue_size: usize,
    pub cleanup_after_hours: i64,
}

/// SSE stream hub defaults.
#[derive(Debug, Clone, Serialize)]
pub struct StreamConfig {
    pub default_timeout_secs: u64,
    pub keepalive_secs: u64,
    pub cleanup_interval_secs: u64,
    pub max_queue_size: usize,
}

impl GatewayConfig {
    /// Load configuration from the environment.
    ///
    /// `JWT_SECRET_KEY` and `INTERNAL_SECRET_KEY` have no in-code defaults;
    /// a missing secret is a startup failure, never a silently generated key.
    pub fn from_env() -> Result<Self, ConfigError> {
        let jwt_secret = required("JWT_SECRET_KEY")?;
        let internal_secret = required("INTERNAL_SECRET_KEY")?;

        Ok(Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: parsed("GATEWAY_PORT", 8000)?,
            },
            auth: AuthConfig {
                jwt_secret,
                access_token_expire_minutes: 30,
                refresh_token_expire_days: 7,
                issuer: "lattice-gateway".to_string(),
                audience: "lattice-services".to_string(),
            },
            internal_auth: InternalAuthConfig {
                secret: internal_secret,
                token_ttl_seconds: 3600,
            },
            registry: RegistryConfig {
                health_check_interval_secs: parsed("HEALTH_CHECK_INTERVAL_SEC", 30)?,
                probe_timeout_secs: 5,
            },
            proxy: ProxyConfig {
                timeout_secs: parsed("PROXY_TIMEOUT_SEC", 30)?,
                max_retries: parsed("PROXY_MAX_RETRIES", 3)?,
            },
            scheduler: SchedulerConfig {
                pool_size: parsed("TASK_POOL_SIZE", 10)?,
                queue_size: parsed("QUEUE_SIZE", 1000)?,
                cleanup_after_hours: 24,
            },
            streams: StreamConfig {
                default_timeout_secs: parsed("STREAM_DEFAULT_TIMEOUT", 300)?,
                keepalive_secs: parsed("STREAM_KEEPALIVE", 30)?,
                cleanup_interval_secs: 60,
                max_queue_size: 1000,
            },
        })
    }

    /// The non-secret part of the configuration, served by the system plane.
    pub fn public_view(&self) -> serde_json::Value {
        serde_json::json!({
            "server": self.server,
            "registry": self.registry,
            "proxy": self.proxy,
            "scheduler": self.scheduler,
            "streams": self.streams,
        })
    }
}

fn required(var: &'static str) -> Result<String, ConfigError> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingSecret(var)),
    }
}

fn parsed<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
