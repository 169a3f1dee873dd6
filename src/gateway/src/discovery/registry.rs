//! Service registry
//!
//! Holds every registered backend instance, runs the active health-check
//! loop, and owns one load balancer per service. All mutation is serialised
//! under a single write lock; selection works on balancer snapshots and
//! never blocks writers.

use crate::discovery::load_balancer::LoadBalancer;
use lattice_shared::{
    LoadBalanceStrategy, RegisterRequest, RegistryConfig, ServiceInfo, ServiceInstance,
    ServiceStatus,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

/// Registry change notification delivered to subscribed listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEvent {
    pub action: RegistryAction,
    pub service_name: String,
    pub instance_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryAction {
    Register,
    Deregister,
    HealthRestored,
    HealthLost,
}

/// Aggregate registry view served by `/gateway/registry/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStatus {
    pub service_count: usize,
    pub instance_count: usize,
    pub healthy_count: usize,
}

#[derive(Default)]
struct RegistryInner {
    /// `service_name → instances`, in registration order.
    services: HashMap<String, Vec<ServiceInstance>>,
    /// One balancer per service; removed with the last instance.
    balancers: HashMap<String, Arc<LoadBalancer>>,
}

/// Service registry with active health checking.
pub struct ServiceRegistry {
    inner: RwLock<RegistryInner>,
    events: broadcast::Sender<RegistryEvent>,
    http: reqwest::Client,
    config: RegistryConfig,
}

impl ServiceRegistry {
    pub fn new(config: RegistryConfig, http: reqwest::Client) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: RwLock::new(RegistryInner::default()),
            events,
            http,
            config,
        }
    }

    /// Subscribe to registry change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Register an instance, merging with an existing `(service, instance)`
    /// identity. Re-registration resets the status to healthy; the initial
    /// probe then confirms or revokes it synchronously.
    pub async fn register(&self, request: RegisterRequest) {
        let service_name = request.service_name.clone();
        let instance_id = request.instance_id.clone();

        {
            let mut inner = self.inner.write().await;
            let instances = inner.services.entry(service_name.clone()).or_default();

            if let Some(existing) = instances
                .iter_mut()
                .find(|i| i.instance_id == request.instance_id)
            {
                existing.host = request.host;
                existing.port = request.port;
                existing.endpoints = request.endpoints;
                existing.metadata = request.metadata;
                existing.health_check_path = request.health_check_path;
                existing.weight = request.weight;
                existing.status = ServiceStatus::Healthy;
                info!(service = %service_name, instance = %instance_id, "updated service instance");
            } else {
                instances.push(ServiceInstance {
                    service_name: service_name.clone(),
                    instance_id: instance_id.clone(),
                    host: request.host,
                    port: request.port,
                    endpoints: request.endpoints,
                    metadata: request.metadata,
                    status: ServiceStatus::Healthy,
                    weight: request.weight,
                    connections: 0,
                    last_health_check: None,
                    health_check_path: request.health_check_path,
                    register_time: Utc::now(),
                });
                info!(service = %service_name, instance = %instance_id, "registered service instance");
            }

            let snapshot = inner
                .services
                .get(&service_name)
                .cloned()
                .unwrap_or_default();
            inner
                .balancers
                .entry(service_name.clone())
                .or_insert_with(|| Arc::new(LoadBalancer::new(service_name.clone())))
                .update_instances(&snapshot);
        }

        // Immediate synchronous probe so the instance is selectable (or not)
        // right after registration.
        self.probe_instance(&service_name, &instance_id).await;

        self.emit(RegistryAction::Register, &service_name, &instance_id);
    }

    /// Remove an instance. Removing the last instance of a service also
    /// drops the service entry and its balancer.
    pub async fn deregister(&self, service_name: &str, instance_id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.write().await;
            let Some(instances) = inner.services.get_mut(service_name) else {
                return false;
            };
            let before = instances.len();
            instances.retain(|i| i.instance_id != instance_id);
            if instances.len() == before {
                return false;
            }

            if instances.is_empty() {
                inner.services.remove(service_name);
                inner.balancers.remove(service_name);
            } else {
                let snapshot = instances.clone();
                if let Some(balancer) = inner.balancers.get(service_name) {
                    balancer.update_instances(&snapshot);
                }
            }
            true
        };

        if removed {
            info!(service = %service_name, instance = %instance_id, "deregistered service instance");
            self.emit(RegistryAction::Deregister, service_name, instance_id);
        }
        removed
    }

    /// Select an instance of `service_name` via its load balancer.
    pub async fn select(
        &self,
        service_name: &str,
        strategy: LoadBalanceStrategy,
    ) -> Option<ServiceInstance> {
        let balancer = {
            let inner = self.inner.read().await;
            inner.balancers.get(service_name).cloned()
        }?;

        let selected = balancer.select(strategy);
        if selected.is_none() {
            warn!(service = %service_name, "no healthy instance available");
        }
        selected
    }

    /// Connection accounting for least-connections routing.
    pub async fn acquire_connection(&self, service_name: &str, instance_id: &str) {
        self.adjust_connections(service_name, instance_id, 1).await;
    }

    pub async fn release_connection(&self, service_name: &str, instance_id: &str) {
        self.adjust_connections(service_name, instance_id, -1).await;
    }

    async fn adjust_connections(&self, service_name: &str, instance_id: &str, delta: i64) {
        let mut inner = self.inner.write().await;
        let Some(instances) = inner.services.get_mut(service_name) else {
            return;
        };
        if let Some(instance) = instances.iter_mut().find(|i| i.instance_id == instance_id) {
            instance.connections = if delta >= 0 {
                instance.connections.saturating_add(delta as u32)
            } else {
                instance.connections.saturating_sub((-delta) as u32)
            };
        }
        let snapshot = instances.clone();
        if let Some(balancer) = inner.balancers.get(service_name) {
            balancer.update_instances(&snapshot);
        }
    }

    /// Snapshot of every service and its instances.
    pub async fn all_services(&self) -> HashMap<String, Vec<ServiceInstance>> {
        self.inner.read().await.services.clone()
    }

    /// Read-only per-service view.
    pub async fn service_info(&self, service_name: &str) -> Option<ServiceInfo> {
        let inner = self.inner.read().await;
        let instances = inner.services.get(service_name)?;
        Some(ServiceInfo {
            service_name: service_name.to_string(),
            instance_count: instances.len(),
            healthy_count: instances
                .iter()
                .filter(|i| i.status == ServiceStatus::Healthy)
                .count(),
            instances: instances.iter().map(Into::into).collect(),
        })
    }

    /// Aggregate counts across all services.
    pub async fn status(&self) -> RegistryStatus {
        let inner = self.inner.read().await;
        let instance_count = inner.services.values().map(Vec::len).sum();
        let healthy_count = inner
            .services
            .values()
            .flatten()
            .filter(|i| i.status == ServiceStatus::Healthy)
            .count();
        RegistryStatus {
            service_count: inner.services.len(),
            instance_count,
            healthy_count,
        }
    }

    /// Health-check loop body: run by an owned worker until `shutdown` fires.
    /// Probe failures mark instances unhealthy and never terminate the loop.
    pub async fn run_health_loop(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.health_check_interval_secs));
        // The first tick fires immediately; registration already probed.
        ticker.tick().await;

        info!(
            interval_secs = self.config.health_check_interval_secs,
            "health-check loop started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.probe_all().await;
                }
                _ = shutdown.recv() => {
                    info!("health-check loop stopped");
                    break;
                }
            }
        }
    }

    /// Probe every registered instance concurrently.
    pub async fn probe_all(&self) {
        let targets: Vec<(String, String, String)> = {
            let inner = self.inner.read().await;
            inner
                .services
                .values()
                .flatten()
                .map(|i| {
                    (
                        i.service_name.clone(),
                        i.instance_id.clone(),
                        i.health_url(),
                    )
                })
                .collect()
        };

        let probes = targets.into_iter().map(|(service, instance, url)| {
            let http = self.http.clone();
            let timeout = Duration::from_secs(self.config.probe_timeout_secs);
            async move {
                let healthy = probe(&http, &url, timeout).await;
                (service, instance, healthy)
            }
        });

        for (service, instance, healthy) in futures::future::join_all(probes).await {
            self.apply_probe(&service, &instance, healthy).await;
        }
    }

    /// Probe a single instance immediately (used at registration).
    pub async fn probe_instance(&self, service_name: &str, instance_id: &str) {
        let url = {
            let inner = self.inner.read().await;
            inner
                .services
                .get(service_name)
                .and_then(|instances| instances.iter().find(|i| i.instance_id == instance_id))
                .map(|i| i.health_url())
        };
        let Some(url) = url else { return };

        let healthy = probe(
            &self.http,
            &url,
            Duration::from_secs(self.config.probe_timeout_secs),
        )
        .await;
        self.apply_probe(service_name, instance_id, healthy).await;
    }

    async fn apply_probe(&self, service_name: &str, instance_id: &str, healthy: bool) {
        let transition = {
            let mut inner = self.inner.write().await;
            let Some(instances) = inner.services.get_mut(service_name) else {
                return;
            };
            let Some(instance) = instances.iter_mut().find(|i| i.instance_id == instance_id)
            else {
                return;
            };

            let was_healthy = instance.status == ServiceStatus::Healthy;
            instance.status = if healthy {
                ServiceStatus::Healthy
            } else {
                ServiceStatus::Unhealthy
            };
            instance.last_health_check = Some(Utc::now());

            let snapshot = instances.clone();
            if let Some(balancer) = inner.balancers.get(service_name) {
                balancer.update_instances(&snapshot);
            }

            match (was_healthy, healthy) {
                (false, true) => Some(RegistryAction::HealthRestored),
                (true, false) => Some(RegistryAction::HealthLost),
                _ => None,
            }
        };

        match transition {
            Some(RegistryAction::HealthRestored) => {
                info!(service = %service_name, instance = %instance_id, "instance health restored");
                self.emit(RegistryAction::HealthRestored, service_name, instance_id);
            }
            Some(RegistryAction::HealthLost) => {
                warn!(service = %service_name, instance = %instance_id, "instance health lost");
                self.emit(RegistryAction::HealthLost, service_name, instance_id);
            }
            _ => {}
        }
    }

    /// Deregister everything (shutdown path).
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.services.clear();
        inner.balancers.clear();
    }

    fn emit(&self, action: RegistryAction, service_name: &str, instance_id: &str) {
        // No receivers is fine; notifications are best-effort.
        let _ = self.events.send(RegistryEvent {
            action,
            service_name: service_name.to_string(),
            instance_id: instance_id.to_string(),
        });
    }
}

/// One health probe: GET with a short timeout. Healthy iff the response is
/// 2xx and, when the body is a JSON object, its `status` field is
/// `"healthy"`. Every error path resolves to unhealthy.
async fn probe(http: &reqwest::Client, url: &str, timeout: Duration) -> bool {
    let response = match http.get(url).timeout(timeout).send().await {
        Ok(response) => response,
        Err(e) => {
            debug!(url = %url, error = %e, "health probe failed");
            return false;
        }
    };

    if !response.status().is_success() {
        debug!(url = %url, status = %response.status(), "health probe non-2xx");
        return false;
    }

    match response.json::<serde_json::Value>().await {
        Ok(serde_json::Value::Object(body)) => {
            body.get("status").and_then(|s| s.as_str()) == Some("healthy")
        }
        // 2xx with a non-object body counts as healthy.
        Ok(_) => true,
        Err(_) => true,
    }
}
