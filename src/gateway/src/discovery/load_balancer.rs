//! Per-service load balancing over the healthy instance snapshot.
//!
//! The registry owns one `LoadBalancer` per service and refreshes its
//! snapshot whenever instances change. Selection never blocks registry
//! writers: the snapshot and cursor live behind a short mutex.

use lattice_shared::{LoadBalanceStrategy, ServiceInstance, ServiceStatus};
use parking_lot::Mutex;
use rand::seq::SliceRandom;

/// Load balancer for a single service.
#[derive(Debug)]
pub struct LoadBalancer {
    service_name: String,
    state: Mutex<LbState>,
}

#[derive(Debug, Default)]
struct LbState {
    /// Healthy instances, in registration order.
    instances: Vec<ServiceInstance>,
    /// Round-robin cursor. Survives snapshot refreshes unless the new
    /// snapshot is strictly smaller than the cursor.
    cursor: usize,
}

impl LoadBalancer {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            state: Mutex::new(LbState::default()),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Replace the snapshot with the healthy subset of `instances`.
    pub fn update_instances(&self, instances: &[ServiceInstance]) {
        let healthy: Vec<ServiceInstance> = instances
            .iter()
            .filter(|i| i.status == ServiceStatus::Healthy)
            .cloned()
            .collect();

        let mut state = self.state.lock();
        if healthy.len() < state.cursor {
            state.cursor = 0;
        }
        state.instances = healthy;
    }

    /// Number of healthy instances in the current snapshot.
    pub fn healthy_count(&self) -> usize {
        self.state.lock().instances.len()
    }

    /// Select an instance. `None` when no healthy instance exists is an
    /// expected, recoverable condition.
    pub fn select(&self, strategy: LoadBalanceStrategy) -> Option<ServiceInstance> {
        let mut state = self.state.lock();
        if state.instances.is_empty() {
            return None;
        }

        match strategy {
            LoadBalanceStrategy::RoundRobin => Some(round_robin(&mut state)),
            LoadBalanceStrategy::Random => {
                state.instances.choose(&mut rand::thread_rng()).cloned()
            }
            LoadBalanceStrategy::LeastConnections => {
                // min_by_key keeps the first minimum, so ties break toward
                // the earlier position in the instance list.
                state.instances.iter().min_by_key(|i| i.connections).cloned()
            }
            LoadBalanceStrategy::WeightedRoundRobin => Some(weighted_round_robin(&mut state)),
        }
    }
}

fn round_robin(state: &mut LbState) -> ServiceInstance {
    let len = state.instances.len();
    let index = state.cursor % len;
    state.cursor = (index + 1) % len;
    state.instances[index].clone()
}

fn weighted_round_robin(state: &mut LbState) -> ServiceInstance {
    let total_weight: u32 = state.instances.iter().map(|i| i.weight).sum();
    if total_weight == 0 {
        return round_robin(state);
    }

    // Expand instances into a virtual ring by weight and advance the
    // cursor on that ring.
    let ring: Vec<usize> = state
        .instances
        .iter()
        .enumerate()
        .flat_map(|(idx, instance)| std::iter::repeat(idx).take(instance.weight as usize))
        .collect();

    let index = state.cursor % ring.len();
    state.cursor = (index + 1) % ring.len();
    state.instances[ring[index]].clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::{HashMap, HashSet};

    fn instance(id: &str, weight: u32, connections: u32) -> ServiceInstance {
        ServiceInstance {
            service_name: "agent-service".into(),
            instance_id: id.into(),
            host: "127.0.0.1".into(),
            port: 8001,
            endpoints: HashMap::new(),
            metadata: HashMap::new(),
            status: ServiceStatus::Healthy,
            weight,
            connections,
            last_health_check: None,
            health_check_path: None,
            register_time: Utc::now(),
        }
    }

    #[test]
    fn test_round_robin_window_is_a_permutation() {
        let lb = LoadBalancer::new("agent-service");
        lb.update_instances(&[instance("a", 1, 0), instance("b", 1, 0), instance("c", 1, 0)]);

        for _ in 0..3 {
            let window: HashSet<String> = (0..3)
                .map(|_| {
                    lb.select(LoadBalanceStrategy::RoundRobin)
                        .unwrap()
                        .instance_id
                })
                .collect();
            assert_eq!(window.len(), 3);
        }
    }

    #[test]
    fn test_round_robin_skips_unhealthy() {
        let lb = LoadBalancer::new("agent-service");
        let mut down = instance("a1", 1, 0);
        down.status = ServiceStatus::Unhealthy;
        lb.update_instances(&[down, instance("a2", 1, 0)]);

        for _ in 0..10 {
            let selected = lb.select(LoadBalanceStrategy::RoundRobin).unwrap();
            assert_eq!(selected.instance_id, "a2");
        }
    }

    #[test]
    fn test_cursor_survives_refresh_and_resets_on_shrink() {
        let lb = LoadBalancer::new("agent-service");
        lb.update_instances(&[instance("a", 1, 0), instance("b", 1, 0)]);
        assert_eq!(
            lb.select(LoadBalanceStrategy::RoundRobin).unwrap().instance_id,
            "a"
        );

        // Same snapshot size: cursor keeps its position.
        lb.update_instances(&[instance("a", 1, 0), instance("b", 1, 0)]);
        assert_eq!(
            lb.select(LoadBalanceStrategy::RoundRobin).unwrap().instance_id,
            "b"
        );

        // Shrink below the cursor: cursor resets to the front.
        lb.update_instances(&[instance("a", 1, 0), instance("b", 1, 0), instance("c", 1, 0)]);
        lb.select(LoadBalanceStrategy::RoundRobin);
        lb.select(LoadBalanceStrategy::RoundRobin);
        lb.update_instances(&[instance("a", 1, 0)]);
        assert_eq!(
            lb.select(LoadBalanceStrategy::RoundRobin).unwrap().instance_id,
            "a"
        );
    }

    #[test]
    fn test_least_connections_prefers_fewest_then_position() {
        let lb = LoadBalancer::new("agent-service");
        lb.update_instances(&[instance("a", 1, 5), instance("b", 1, 2), instance("c", 1, 2)]);

        // b and c tie at 2 connections; b comes first in the list.
        let selected = lb.select(LoadBalanceStrategy::LeastConnections).unwrap();
        assert_eq!(selected.instance_id, "b");
    }

    #[test]
    fn test_weighted_round_robin_matches_weights() {
        let lb = LoadBalancer::new("agent-service");
        lb.update_instances(&[instance("heavy", 3, 0), instance("light", 1, 0)]);

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..8 {
            let selected = lb
                .select(LoadBalanceStrategy::WeightedRoundRobin)
                .unwrap();
            *counts.entry(selected.instance_id).or_insert(0) += 1;
        }
        assert_eq!(counts["heavy"], 6);
        assert_eq!(counts["light"], 2);
    }

    #[test]
    fn test_weighted_round_robin_zero_weight_falls_back() {
        let lb = LoadBalancer::new("agent-service");
        lb.update_instances(&[instance("a", 0, 0), instance("b", 0, 0)]);

        let first = lb
            .select(LoadBalanceStrategy::WeightedRoundRobin)
            .unwrap();
        let second = lb
            .select(LoadBalanceStrategy::WeightedRoundRobin)
            .unwrap();
        assert_ne!(first.instance_id, second.instance_id);
    }

    #[test]
    fn test_empty_snapshot_selects_none() {
        let lb = LoadBalancer::new("agent-service");
        assert!(lb.select(LoadBalanceStrategy::RoundRobin).is_none());
        assert!(lb.select(LoadBalanceStrategy::Random).is_none());
        assert!(lb.select(LoadBalanceStrategy::LeastConnections).is_none());
        assert!(lb.select(LoadBalanceStrategy::WeightedRoundRobin).is_none());
    }

    #[test]
    fn test_random_stays_within_healthy_set() {
        let lb = LoadBalancer::new("agent-service");
        lb.update_instances(&[instance("a", 1, 0), instance("b", 1, 0)]);
        for _ in 0..20 {
            let selected = lb.select(LoadBalanceStrategy::Random).unwrap();
            assert!(selected.instance_id == "a" || selected.instance_id == "b");
        }
    }
}
