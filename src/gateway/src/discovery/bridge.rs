//! Service-registry bridge
//!
//! Front door for registrations arriving from backends and orchestration:
//! validates the payload, hands it to the registry, and mirrors accepted
//! entries into an authoritative recovery store. Periodic reconciliation
//! keeps the registry consistent with that store, deregistering drift.

use crate::discovery::registry::ServiceRegistry;
use crate::error::{GatewayError, Result};
use lattice_shared::RegisterRequest;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

/// Durable mirror of accepted registrations. The in-memory store is the
/// default; a durable backend can replace it behind this seam.
#[async_trait]
pub trait RegistrationStore: Send + Sync {
    async fn put(&self, request: RegisterRequest);
    async fn remove(&self, service_name: &str, instance_id: &str);
    async fn all(&self) -> Vec<RegisterRequest>;
}

/// In-memory authoritative view keyed by `(service_name, instance_id)`.
#[derive(Default)]
pub struct MemoryRegistrationStore {
    entries: RwLock<HashMap<(String, String), RegisterRequest>>,
}

#[async_trait]
impl RegistrationStore for MemoryRegistrationStore {
    async fn put(&self, request: RegisterRequest) {
        let key = (request.service_name.clone(), request.instance_id.clone());
        self.entries.write().await.insert(key, request);
    }

    async fn remove(&self, service_name: &str, instance_id: &str) {
        self.entries
            .write()
            .await
            .remove(&(service_name.to_string(), instance_id.to_string()));
    }

    async fn all(&self) -> Vec<RegisterRequest> {
        self.entries.read().await.values().cloned().collect()
    }
}

/// Bridge between external registration traffic and the registry.
pub struct ServiceBridge {
    registry: Arc<ServiceRegistry>,
    store: Arc<dyn RegistrationStore>,
    reconcile_interval: Duration,
}

impl ServiceBridge {
    pub fn new(registry: Arc<ServiceRegistry>, store: Arc<dyn RegistrationStore>) -> Self {
        Self {
            registry,
            store,
            reconcile_interval: Duration::from_secs(60),
        }
    }

    /// Validate and apply a registration.
    pub async fn register(&self, request: RegisterRequest) -> Result<()> {
        validate(&request)?;
        self.store.put(request.clone()).await;
        self.registry.register(request).await;
        Ok(())
    }

    /// Deregister from both the registry and the authoritative store.
    pub async fn deregister(&self, service_name: &str, instance_id: &str) -> Result<()> {
        self.store.remove(service_name, instance_id).await;
        if self.registry.deregister(service_name, instance_id).await {
            Ok(())
        } else {
            Err(GatewayError::not_found(format!(
                "instance {}/{}",
                service_name, instance_id
            )))
        }
    }

    /// Bring the registry in line with the authoritative store: re-register
    /// missing entries, deregister entries the store no longer knows.
    pub async fn reconcile(&self) {
        let authoritative = self.store.all().await;
        let registered = self.registry.all_services().await;

        let mut known: HashMap<(String, String), &RegisterRequest> = HashMap::new();
        for request in &authoritative {
            known.insert(
                (request.service_name.clone(), request.instance_id.clone()),
                request,
            );
        }

        // Drift: registered but not authoritative.
        for (service_name, instances) in &registered {
            for instance in instances {
                let key = (service_name.clone(), instance.instance_id.clone());
                if !known.contains_key(&key) {
                    warn!(
                        service = %service_name,
                        instance = %instance.instance_id,
                        "deregistering drifted instance"
                    );
                    self.registry
                        .deregister(service_name, &instance.instance_id)
                        .await;
                }
            }
        }

        // Missing: authoritative but not registered.
        for ((service_name, instance_id), request) in known {
            let present = registered
                .get(&service_name)
                .map(|instances| instances.iter().any(|i| i.instance_id == instance_id))
                .unwrap_or(false);
            if !present {
                info!(service = %service_name, instance = %instance_id, "restoring missing instance");
                self.registry.register(request.clone()).await;
            }
        }
    }

    /// Reconciliation loop body; run by an owned worker.
    pub async fn run_reconcile_loop(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.reconcile_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.reconcile().await,
                _ = shutdown.recv() => break,
            }
        }
    }
}

fn validate(request: &RegisterRequest) -> Result<()> {
    if request.service_name.trim().is_empty() {
        return Err(GatewayError::bad_request("service_name is required"));
    }
    if request.instance_id.trim().is_empty() {
        return Err(GatewayError::bad_request("instance_id is required"));
    }
    if request.host.trim().is_empty() {
        return Err(GatewayError::bad_request("host is required"));
    }
    if request.port == 0 {
        return Err(GatewayError::bad_request("port must be non-zero"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_shared::RegistryConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn bridge() -> (ServiceBridge, Arc<ServiceRegistry>) {
        let registry = Arc::new(ServiceRegistry::new(
            RegistryConfig {
                health_check_interval_secs: 30,
                probe_timeout_secs: 5,
            },
            reqwest::Client::new(),
        ));
        let store = Arc::new(MemoryRegistrationStore::default());
        (ServiceBridge::new(registry.clone(), store), registry)
    }

    async fn upstream() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"status": "healthy"})),
            )
            .mount(&server)
            .await;
        server
    }

    fn request(server: &MockServer, service: &str, instance: &str) -> RegisterRequest {
        RegisterRequest {
            service_name: service.into(),
            instance_id: instance.into(),
            host: server.address().ip().to_string(),
            port: server.address().port(),
            endpoints: HashMap::new(),
            metadata: HashMap::new(),
            health_check_path: None,
            weight: 1,
        }
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_payloads() {
        let (bridge, _) = bridge();
        let server = upstream().await;

        let mut missing_name = request(&server, "", "a1");
        missing_name.service_name = "  ".into();
        assert!(bridge.register(missing_name).await.is_err());

        let mut bad_port = request(&server, "agent-service", "a1");
        bad_port.port = 0;
        assert!(bridge.register(bad_port).await.is_err());
    }

    #[tokio::test]
    async fn test_register_reaches_registry_and_store() {
        let (bridge, registry) = bridge();
        let server = upstream().await;

        bridge
            .register(request(&server, "agent-service", "a1"))
            .await
            .unwrap();

        assert!(registry.service_info("agent-service").await.is_some());
        assert_eq!(bridge.store.all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_deregister_unknown_instance_is_not_found() {
        let (bridge, _) = bridge();
        let result = bridge.deregister("agent-service", "missing").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_reconcile_removes_drift_and_restores_missing() {
        let (bridge, registry) = bridge();
        let server = upstream().await;

        // Registered directly, bypassing the bridge: drift.
        registry.register(request(&server, "rogue-service", "r1")).await;
        // Known to the store but missing from the registry.
        bridge.store.put(request(&server, "agent-service", "a1")).await;

        bridge.reconcile().await;

        assert!(registry.service_info("rogue-service").await.is_none());
        assert!(registry.service_info("agent-service").await.is_some());
    }
}
