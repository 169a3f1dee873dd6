//! Core domain types: service instances, credentials, registration payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle state of a registered service instance.
///
/// Only `Healthy` instances are selectable by the load balancer; `Down` is
/// terminal before deregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Healthy,
    Unhealthy,
    Starting,
    Stopping,
    Down,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Healthy => write!(f, "healthy"),
            ServiceStatus::Unhealthy => write!(f, "unhealthy"),
            ServiceStatus::Starting => write!(f, "starting"),
            ServiceStatus::Stopping => write!(f, "stopping"),
            ServiceStatus::Down => write!(f, "down"),
        }
    }
}

/// Load balancing strategy selected per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    RoundRobin,
    Random,
    LeastConnections,
    WeightedRoundRobin,
}

/// A single backend instance. Identity is `(service_name, instance_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service_name: String,
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub status: ServiceStatus,
    pub weight: u32,
    pub connections: u32,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_check_path: Option<String>,
    pub register_time: DateTime<Utc>,
}

impl ServiceInstance {
    /// Base URL for forwarding requests to this instance.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// URL probed by the health-check loop. Defaults to `/health`.
    pub fn health_url(&self) -> String {
        match &self.health_check_path {
            Some(path) => format!("{}{}", self.base_url(), path),
            None => format!("{}/health", self.base_url()),
        }
    }
}

/// Registration payload accepted by the bridge and `/gateway/services/register`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub service_name: String,
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub health_check_path: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Read-only per-service view served by describe/introspection endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub service_name: String,
    pub instance_count: usize,
    pub healthy_count: usize,
    pub instances: Vec<InstanceInfo>,
}

/// Read-only per-instance view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub status: ServiceStatus,
    pub weight: u32,
    pub connections: u32,
    pub last_health_check: Option<DateTime<Utc>>,
    pub register_time: DateTime<Utc>,
}

impl From<&ServiceInstance> for InstanceInfo {
    fn from(instance: &ServiceInstance) -> Self {
        Self {
            instance_id: instance.instance_id.clone(),
            host: instance.host.clone(),
            port: instance.port,
            status: instance.status,
            weight: instance.weight,
            connections: instance.connections,
            last_health_check: instance.last_health_check,
            register_time: instance.register_time,
        }
    }
}

/// User token flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
}

/// Claims carried by user access and refresh tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    pub jti: String,
}

/// Access/refresh token pair issued at login or refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub token_type: String,
}

/// Claims carried by inter-service tokens. Signed with the internal secret,
/// never the user JWT secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalClaims {
    pub service_name: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub iat: i64,
    pub exp: i64,
    #[serde(rename = "type")]
    pub token_type: String,
    pub issuer: String,
}

/// An API key pair for the external v1 plane. The stored secret is compared
/// in constant time and never serialized into list views.
#[derive(Debug, Clone)]
pub struct ApiKey {
    pub key_id: String,
    pub secret: String,
    pub name: String,
    pub permissions: Vec<String>,
    pub rate_limit: u32,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub usage_count: u64,
}

/// List view of an API key (no secret).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeySummary {
    pub key_id: String,
    pub name: String,
    pub permissions: Vec<String>,
    pub rate_limit: u32,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub usage_count: u64,
}

impl From<&ApiKey> for ApiKeySummary {
    fn from(key: &ApiKey) -> Self {
        Self {
            key_id: key.key_id.clone(),
            name: key.name.clone(),
            permissions: key.permissions.clone(),
            rate_limit: key.rate_limit,
            active: key.active,
            expires_at: key.expires_at,
            created_at: key.created_at,
            last_used: key.last_used,
            usage_count: key.usage_count,
        }
    }
}

/// Creation response: the only place the secret ever leaves the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedApiKey {
    pub key_id: String,
    pub key_secret: String,
    pub name: String,
    pub permissions: Vec<String>,
    pub rate_limit: u32,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Hourly usage snapshot for an API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyUsage {
    pub current_hour_usage: u32,
    pub remaining_requests: u32,
    pub rate_limit: u32,
    pub reset_time: DateTime<Utc>,
}
