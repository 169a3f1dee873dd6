//! Application state
//!
//! The single construction site: every component is built here and injected
//! into the router. Background loops are owned workers started by
//! `start_background` and stopped by `shutdown`; tests build fresh states
//! with no global mutable anything.

use crate::auth::{ApiKeyManager, InternalTokenManager, PermissionEngine, ServiceTokens, TokenManager};
use crate::discovery::{MemoryRegistrationStore, ServiceBridge, ServiceRegistry};
use crate::error::{GatewayError, Result};
use crate::proxy::ProxyEngine;
use crate::streaming::StreamHub;
use crate::tasks::{TaskScheduler, WorkerPoolManager};
use crate::tracker::RequestTracker;
use lattice_shared::GatewayConfig;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const SCHEDULER_DRAIN_GRACE: Duration = Duration::from_secs(10);
const POOL_DRAIN_GRACE: Duration = Duration::from_secs(5);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub http_client: Client,
    pub registry: Arc<ServiceRegistry>,
    pub bridge: Arc<ServiceBridge>,
    pub proxy: Arc<ProxyEngine>,
    pub tokens: Arc<TokenManager>,
    pub api_keys: Arc<ApiKeyManager>,
    pub internal_tokens: Arc<InternalTokenManager>,
    pub service_tokens: Arc<ServiceTokens>,
    pub permissions: Arc<PermissionEngine>,
    pub tracker: Arc<RequestTracker>,
    pub scheduler: Arc<TaskScheduler>,
    pub pools: Arc<WorkerPoolManager>,
    pub streams: Arc<StreamHub>,
    shutdown: broadcast::Sender<()>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl AppState {
    /// Build every component from configuration.
    pub async fn new(config: GatewayConfig) -> Result<Self> {
        let http_client = create_http_client(&config)?;

        let registry = Arc::new(ServiceRegistry::new(
            config.registry.clone(),
            http_client.clone(),
        ));
        let bridge = Arc::new(ServiceBridge::new(
            registry.clone(),
            Arc::new(MemoryRegistrationStore::default()),
        ));
        let proxy = Arc::new(ProxyEngine::new(config.proxy.clone(), http_client.clone()));
        let tokens = Arc::new(TokenManager::new(config.auth.clone()));
        let internal_tokens = Arc::new(InternalTokenManager::new(config.internal_auth.clone()));
        let service_tokens = Arc::new(ServiceTokens::issue_all(&internal_tokens).await);
        let (shutdown, _) = broadcast::channel(1);

        info!("application state initialized");
        Ok(Self {
            http_client,
            registry,
            bridge,
            proxy,
            tokens,
            api_keys: Arc::new(ApiKeyManager::new()),
            internal_tokens,
            service_tokens,
            permissions: Arc::new(PermissionEngine::new()),
            tracker: Arc::new(RequestTracker::new()),
            scheduler: Arc::new(TaskScheduler::new(config.scheduler.clone())),
            pools: Arc::new(WorkerPoolManager::new()),
            streams: Arc::new(StreamHub::new(config.streams.clone())),
            config: Arc::new(config),
            shutdown,
            workers: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Start the owned background workers: health checker, request
    /// sweeper, stream reaper, bridge reconciliation, scheduler workers,
    /// and the hourly maintenance pass.
    pub async fn start_background(&self) {
        self.scheduler.start();

        let mut workers = self.workers.lock().await;

        let registry = self.registry.clone();
        let shutdown = self.shutdown.subscribe();
        workers.push(tokio::spawn(async move {
            registry.run_health_loop(shutdown).await;
        }));

        let tracker = self.tracker.clone();
        let shutdown = self.shutdown.subscribe();
        workers.push(tokio::spawn(async move {
            tracker.run_sweeper(shutdown).await;
        }));

        let streams = self.streams.clone();
        let shutdown = self.shutdown.subscribe();
        workers.push(tokio::spawn(async move {
            streams.run_reaper(shutdown).await;
        }));

        let bridge = self.bridge.clone();
        let shutdown = self.shutdown.subscribe();
        workers.push(tokio::spawn(async move {
            bridge.run_reconcile_loop(shutdown).await;
        }));

        let scheduler = self.scheduler.clone();
        let tokens = self.tokens.clone();
        let cleanup_after_hours = self.config.scheduler.cleanup_after_hours;
        let mut shutdown = self.shutdown.subscribe();
        workers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.cleanup_tasks(cleanup_after_hours);
                        tokens.sweep_denylist().await;
                    }
                    _ = shutdown.recv() => break,
                }
            }
        }));

        info!("background workers started");
    }

    /// Shutdown cascade: signal background loops, drain the scheduler,
    /// close all streams, drain the pools, then join the workers.
    pub async fn shutdown(&self) {
        info!("gateway shutting down");
        let _ = self.shutdown.send(());

        self.scheduler.stop(SCHEDULER_DRAIN_GRACE).await;
        self.streams.close_all();
        self.pools.shutdown(POOL_DRAIN_GRACE).await;

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().await);
        for handle in handles {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!("background worker did not stop in time");
            }
        }
        info!("gateway shutdown complete");
    }
}

/// Pooled upstream client with keep-alive, shared by the proxy and the
/// registry prober.
fn create_http_client(config: &GatewayConfig) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(config.proxy.timeout_secs))
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .user_agent(format!("lattice-gateway/{}", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| GatewayError::internal(format!("failed to build HTTP client: {}", e)))
}

#[cfg(test)]
pub(crate) fn test_config() -> GatewayConfig {
    use lattice_shared::{
        AuthConfig, InternalAuthConfig, ProxyConfig, RegistryConfig, SchedulerConfig,
        ServerConfig, StreamConfig,
    };
    GatewayConfig {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        auth: AuthConfig {
            jwt_secret: "test-jwt-secret".to_string(),
            access_token_expire_minutes: 30,
            refresh_token_expire_days: 7,
            issuer: "lattice-gateway".to_string(),
            audience: "lattice-services".to_string(),
        },
        internal_auth: InternalAuthConfig {
            secret: "test-internal-secret".to_string(),
            token_ttl_seconds: 3600,
        },
        registry: RegistryConfig {
            health_check_interval_secs: 30,
            probe_timeout_secs: 5,
        },
        proxy: ProxyConfig {
            timeout_secs: 5,
            max_retries: 1,
        },
        scheduler: SchedulerConfig {
            pool_size: 2,
            queue_size: 100,
            cleanup_after_hours: 24,
        },
        streams: StreamConfig {
            default_timeout_secs: 300,
            keepalive_secs: 30,
            cleanup_interval_secs: 60,
            max_queue_size: 100,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_builds_and_shuts_down() {
        let state = AppState::new(test_config()).await.unwrap();
        state.start_background().await;
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_http_client_creation() {
        assert!(create_http_client(&test_config()).is_ok());
    }
}
