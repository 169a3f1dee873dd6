//! Request tracking
//!
//! Every request entering a plane gets a UUID, an in-flight entry, and on
//! completion a slot in the aggregate metrics: total/status/endpoint
//! counters, a ring of the latest 1,000 latencies, and a ring of the latest
//! 100 errors. A sweeper purges in-flight entries orphaned by handler
//! crashes.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

const LATENCY_RING: usize = 1000;
const ERROR_RING: usize = 100;
const STALE_AFTER: Duration = Duration::from_secs(300);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// One request currently inside a handler.
#[derive(Debug, Clone)]
pub struct InFlightRequest {
    pub endpoint: String,
    pub method: String,
    pub started: Instant,
    pub start_time: DateTime<Utc>,
    pub client_ip: String,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorRecord {
    timestamp: DateTime<Utc>,
    endpoint: String,
    method: String,
    status_code: u16,
    error: String,
}

#[derive(Default)]
struct RequestMetrics {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    latencies: VecDeque<f64>,
    status_codes: HashMap<u16, u64>,
    endpoints: HashMap<String, u64>,
    errors: VecDeque<ErrorRecord>,
}

/// Per-request identifiers, the in-flight table, and aggregate metrics.
pub struct RequestTracker {
    metrics: Mutex<RequestMetrics>,
    active: DashMap<Uuid, InFlightRequest>,
    started_at: DateTime<Utc>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            metrics: Mutex::new(RequestMetrics::default()),
            active: DashMap::new(),
            started_at: Utc::now(),
        }
    }

    /// Begin tracking; returns the request id carried through the handler
    /// and echoed as `X-Request-ID`.
    pub fn start_request(
        &self,
        endpoint: &str,
        method: &str,
        client_ip: &str,
        user_agent: &str,
    ) -> Uuid {
        let request_id = Uuid::new_v4();
        self.active.insert(
            request_id,
            InFlightRequest {
                endpoint: endpoint.to_string(),
                method: method.to_string(),
                started: Instant::now(),
                start_time: Utc::now(),
                client_ip: client_ip.to_string(),
                user_agent: user_agent.to_string(),
            },
        );
        request_id
    }

    /// Finish tracking and fold the outcome into the metrics.
    pub fn end_request(&self, request_id: Uuid, status_code: u16, error: Option<String>) {
        let Some((_, entry)) = self.active.remove(&request_id) else {
            warn!(request_id = %request_id, "unknown request id on completion");
            return;
        };
        let latency = entry.started.elapsed().as_secs_f64();

        let mut metrics = self.metrics.lock();
        metrics.total_requests += 1;
        if metrics.latencies.len() == LATENCY_RING {
            metrics.latencies.pop_front();
        }
        metrics.latencies.push_back(latency);
        *metrics.status_codes.entry(status_code).or_insert(0) += 1;
        *metrics
            .endpoints
            .entry(format!("{} {}", entry.method, entry.endpoint))
            .or_insert(0) += 1;

        if (200..400).contains(&status_code) {
            metrics.successful_requests += 1;
        } else {
            metrics.failed_requests += 1;
            if let Some(error) = error {
                if metrics.errors.len() == ERROR_RING {
                    metrics.errors.pop_front();
                }
                metrics.errors.push_back(ErrorRecord {
                    timestamp: Utc::now(),
                    endpoint: entry.endpoint,
                    method: entry.method,
                    status_code,
                    error,
                });
            }
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.active.len()
    }

    /// Active requests, longest-running first.
    pub fn active_requests(&self) -> Vec<serde_json::Value> {
        let mut requests: Vec<(f64, serde_json::Value)> = self
            .active
            .iter()
            .map(|entry| {
                let duration = entry.started.elapsed().as_secs_f64();
                (
                    duration,
                    serde_json::json!({
                        "request_id": entry.key().to_string(),
                        "endpoint": entry.endpoint,
                        "method": entry.method,
                        "duration": duration,
                        "client_ip": entry.client_ip,
                        "user_agent": entry.user_agent,
                    }),
                )
            })
            .collect();
        requests.sort_by(|a, b| b.0.total_cmp(&a.0));
        requests.into_iter().map(|(_, v)| v).collect()
    }

    /// Aggregate statistics for `/gateway/metrics` and the system plane.
    pub fn stats(&self) -> serde_json::Value {
        let metrics = self.metrics.lock();
        let (avg, min, max) = if metrics.latencies.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            let sum: f64 = metrics.latencies.iter().sum();
            let min = metrics.latencies.iter().cloned().fold(f64::MAX, f64::min);
            let max = metrics.latencies.iter().cloned().fold(0.0, f64::max);
            (sum / metrics.latencies.len() as f64, min, max)
        };

        let error_rate = if metrics.total_requests > 0 {
            metrics.failed_requests as f64 / metrics.total_requests as f64 * 100.0
        } else {
            0.0
        };

        let mut top_endpoints: Vec<(&String, &u64)> = metrics.endpoints.iter().collect();
        top_endpoints.sort_by(|a, b| b.1.cmp(a.1));
        let top_endpoints: HashMap<String, u64> = top_endpoints
            .into_iter()
            .take(10)
            .map(|(k, v)| (k.clone(), *v))
            .collect();

        let uptime = (Utc::now() - self.started_at).num_milliseconds() as f64 / 1000.0;
        let requests_per_second = if uptime > 0.0 {
            metrics.total_requests as f64 / uptime
        } else {
            0.0
        };

        let recent_errors: Vec<&ErrorRecord> = metrics.errors.iter().rev().take(10).collect();

        serde_json::json!({
            "total_requests": metrics.total_requests,
            "successful_requests": metrics.successful_requests,
            "failed_requests": metrics.failed_requests,
            "error_rate": error_rate,
            "response_time": { "average": avg, "min": min, "max": max },
            "status_codes": metrics.status_codes,
            "top_endpoints": top_endpoints,
            "recent_errors": recent_errors,
            "uptime_seconds": uptime,
            "requests_per_second": requests_per_second,
            "active_requests": {
                "count": self.active.len(),
                "details": self.active_requests(),
            },
        })
    }

    /// Drop in-flight entries older than the watchdog threshold. Protects
    /// the table against handlers that never complete.
    pub fn sweep_stale(&self) -> usize {
        self.sweep_older_than(STALE_AFTER)
    }

    fn sweep_older_than(&self, max_age: Duration) -> usize {
        let mut swept = 0;
        self.active.retain(|_, entry| {
            if entry.started.elapsed() > max_age {
                swept += 1;
                false
            } else {
                true
            }
        });
        if swept > 0 {
            warn!(swept, "purged stale in-flight requests");
        }
        swept
    }

    /// Sweeper loop body; run by an owned worker.
    pub async fn run_sweeper(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await;
        info!("request sweeper started");
        loop {
            tokio::select! {
                _ = ticker.tick() => { self.sweep_stale(); }
                _ = shutdown.recv() => break,
            }
        }
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_lifecycle() {
        let tracker = RequestTracker::new();
        let id = tracker.start_request("/frontend/agents", "GET", "10.0.0.9", "test-agent");
        assert_eq!(tracker.in_flight_count(), 1);

        tracker.end_request(id, 200, None);
        assert_eq!(tracker.in_flight_count(), 0);

        let stats = tracker.stats();
        assert_eq!(stats["total_requests"], 1);
        assert_eq!(stats["successful_requests"], 1);
        assert_eq!(stats["status_codes"]["200"], 1);
        assert_eq!(stats["top_endpoints"]["GET /frontend/agents"], 1);
    }

    #[test]
    fn test_failures_recorded_with_errors() {
        let tracker = RequestTracker::new();
        let id = tracker.start_request("/v1/models", "POST", "10.0.0.9", "test-agent");
        tracker.end_request(id, 502, Some("upstream unreachable".into()));

        let stats = tracker.stats();
        assert_eq!(stats["failed_requests"], 1);
        assert!(stats["error_rate"].as_f64().unwrap() > 99.0);
        assert_eq!(stats["recent_errors"][0]["status_code"], 502);
    }

    #[test]
    fn test_latency_ring_is_bounded() {
        let tracker = RequestTracker::new();
        for _ in 0..(LATENCY_RING + 50) {
            let id = tracker.start_request("/x", "GET", "ip", "ua");
            tracker.end_request(id, 200, None);
        }
        assert_eq!(tracker.metrics.lock().latencies.len(), LATENCY_RING);
        assert_eq!(
            tracker.stats()["total_requests"],
            (LATENCY_RING + 50) as u64
        );
    }

    #[test]
    fn test_unknown_completion_is_ignored() {
        let tracker = RequestTracker::new();
        tracker.end_request(Uuid::new_v4(), 200, None);
        assert_eq!(tracker.stats()["total_requests"], 0);
    }

    #[test]
    fn test_sweep_removes_only_stale_entries() {
        let tracker = RequestTracker::new();
        let stale = tracker.start_request("/stale", "GET", "ip", "ua");
        std::thread::sleep(Duration::from_millis(50));
        let fresh = tracker.start_request("/fresh", "GET", "ip", "ua");

        assert_eq!(tracker.sweep_older_than(Duration::from_millis(25)), 1);
        assert!(tracker.active.contains_key(&fresh));
        assert!(!tracker.active.contains_key(&stale));
    }

    #[test]
    fn test_active_requests_sorted_by_duration() {
        let tracker = RequestTracker::new();
        tracker.start_request("/older", "GET", "ip", "ua");
        std::thread::sleep(Duration::from_millis(20));
        tracker.start_request("/newer", "GET", "ip", "ua");

        let listed = tracker.active_requests();
        assert_eq!(listed[0]["endpoint"], "/older");
        assert_eq!(listed[1]["endpoint"], "/newer");
    }
}
