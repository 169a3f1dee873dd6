//! Named worker pools
//!
//! Four pools (io, cpu, proxy, health_check) with independent concurrency
//! limits and virtual queue bounds. A pool is a semaphore-bounded spawner:
//! `submit` returns a task id immediately and the job waits for a permit.
//! Pools cannot be resized in place; resize swaps in a replacement and
//! in-flight work drains on the old pool.

use crate::error::{GatewayError, Result};
use lattice_shared::PoolKind;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sizing for one pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_workers: usize,
    pub queue_size: usize,
}

#[derive(Default)]
struct PoolCounters {
    submitted: AtomicU64,
    pending: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    last_activity: Mutex<Option<DateTime<Utc>>>,
}

struct Pool {
    settings: PoolSettings,
    semaphore: Arc<Semaphore>,
    counters: Arc<PoolCounters>,
    created_at: DateTime<Utc>,
}

impl Pool {
    fn new(settings: PoolSettings) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(settings.max_workers)),
            counters: Arc::new(PoolCounters::default()),
            settings,
            created_at: Utc::now(),
        }
    }
}

/// Manager for the named pools.
pub struct WorkerPoolManager {
    pools: RwLock<HashMap<PoolKind, Arc<Pool>>>,
}

impl WorkerPoolManager {
    /// Build the default pool set: io 20/2000, cpu 4/500, proxy 50/5000,
    /// health_check 5/100.
    pub fn new() -> Self {
        let manager = Self {
            pools: RwLock::new(HashMap::new()),
        };
        manager.create_pool(
            PoolKind::Io,
            PoolSettings {
                max_workers: 20,
                queue_size: 2000,
            },
        );
        manager.create_pool(
            PoolKind::Cpu,
            PoolSettings {
                max_workers: 4,
                queue_size: 500,
            },
        );
        manager.create_pool(
            PoolKind::Proxy,
            PoolSettings {
                max_workers: 50,
                queue_size: 5000,
            },
        );
        manager.create_pool(
            PoolKind::HealthCheck,
            PoolSettings {
                max_workers: 5,
                queue_size: 100,
            },
        );
        manager
    }

    /// Create or replace a pool. Replacement resets counters; work already
    /// holding permits keeps the old pool alive until it drains.
    pub fn create_pool(&self, kind: PoolKind, settings: PoolSettings) {
        let mut pools = self.pools.write();
        if pools.contains_key(&kind) {
            warn!(pool = %kind, "replacing existing pool");
        }
        pools.insert(kind, Arc::new(Pool::new(settings)));
        info!(pool = %kind, max_workers = settings.max_workers, "pool created");
    }

    /// Submit work to a pool. Returns a task id immediately; the job runs
    /// once a permit frees up. Fails when the virtual queue is full.
    pub fn submit<F>(&self, kind: PoolKind, future: F) -> Result<String>
    where
        F: Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        let pool = self
            .pools
            .read()
            .get(&kind)
            .cloned()
            .ok_or_else(|| GatewayError::internal(format!("no such pool: {}", kind)))?;

        let pending = pool.counters.pending.load(Ordering::SeqCst);
        if pending as usize >= pool.settings.queue_size {
            return Err(GatewayError::queue_full(format!(
                "pool {} queue is full",
                kind
            )));
        }

        let task_id = format!("{}_{}", kind, Uuid::new_v4().simple());
        pool.counters.submitted.fetch_add(1, Ordering::SeqCst);
        pool.counters.pending.fetch_add(1, Ordering::SeqCst);
        *pool.counters.last_activity.lock() = Some(Utc::now());

        let semaphore = pool.semaphore.clone();
        let counters = pool.counters.clone();
        let spawned_id = task_id.clone();
        tokio::spawn(async move {
            // A closed semaphore means the pool was torn down mid-flight.
            let Ok(_permit) = semaphore.acquire_owned().await else {
                counters.pending.fetch_sub(1, Ordering::SeqCst);
                counters.failed.fetch_add(1, Ordering::SeqCst);
                return;
            };

            let outcome = future.await;
            counters.pending.fetch_sub(1, Ordering::SeqCst);
            *counters.last_activity.lock() = Some(Utc::now());
            match outcome {
                Ok(()) => {
                    counters.completed.fetch_add(1, Ordering::SeqCst);
                }
                Err(error) => {
                    counters.failed.fetch_add(1, Ordering::SeqCst);
                    debug!(task = %spawned_id, error = %error, "pool task failed");
                }
            }
        });

        Ok(task_id)
    }

    /// Replace the pool with a differently sized one. In-flight work is not
    /// interrupted; it drains on the old semaphore.
    pub fn resize(&self, kind: PoolKind, new_max_workers: usize) -> Result<()> {
        let settings = {
            let pools = self.pools.read();
            let pool = pools
                .get(&kind)
                .ok_or_else(|| GatewayError::internal(format!("no such pool: {}", kind)))?;
            PoolSettings {
                max_workers: new_max_workers,
                queue_size: pool.settings.queue_size,
            }
        };
        self.create_pool(kind, settings);
        info!(pool = %kind, max_workers = new_max_workers, "pool resized");
        Ok(())
    }

    pub fn pool_stats(&self, kind: PoolKind) -> Option<serde_json::Value> {
        let pool = self.pools.read().get(&kind).cloned()?;
        let submitted = pool.counters.submitted.load(Ordering::SeqCst);
        let pending = pool.counters.pending.load(Ordering::SeqCst);
        let completed = pool.counters.completed.load(Ordering::SeqCst);
        let failed = pool.counters.failed.load(Ordering::SeqCst);
        let success_rate = if submitted > 0 {
            completed as f64 / submitted as f64 * 100.0
        } else {
            0.0
        };
        let queue_utilization = pending as f64 / pool.settings.queue_size as f64 * 100.0;

        Some(serde_json::json!({
            "pool_type": kind,
            "max_workers": pool.settings.max_workers,
            "queue_size": pool.settings.queue_size,
            "pending_tasks": pending,
            "completed_tasks": completed,
            "failed_tasks": failed,
            "total_submitted": submitted,
            "success_rate": success_rate,
            "queue_utilization": queue_utilization,
            "created_at": pool.created_at,
            "last_activity": *pool.counters.last_activity.lock(),
        }))
    }

    pub fn all_stats(&self) -> serde_json::Value {
        let mut pools = serde_json::Map::new();
        let mut total_pending = 0u64;
        let mut total_completed = 0u64;
        let mut total_failed = 0u64;
        let mut total_submitted = 0u64;

        for kind in PoolKind::ALL {
            if let Some(stats) = self.pool_stats(kind) {
                total_pending += stats["pending_tasks"].as_u64().unwrap_or(0);
                total_completed += stats["completed_tasks"].as_u64().unwrap_or(0);
                total_failed += stats["failed_tasks"].as_u64().unwrap_or(0);
                total_submitted += stats["total_submitted"].as_u64().unwrap_or(0);
                pools.insert(kind.to_string(), stats);
            }
        }

        let overall_success_rate = if total_submitted > 0 {
            total_completed as f64 / total_submitted as f64 * 100.0
        } else {
            0.0
        };

        serde_json::json!({
            "pools": pools,
            "summary": {
                "total_pools": pools.len(),
                "total_pending": total_pending,
                "total_completed": total_completed,
                "total_failed": total_failed,
                "total_submitted": total_submitted,
                "overall_success_rate": overall_success_rate,
            },
            "timestamp": Utc::now(),
        })
    }

    /// Degradation report: a pool is unhealthy on queue utilisation above
    /// 90 %, success rate below 95 % over more than 10 submissions, or
    /// pending work exceeding twice its worker count.
    pub fn health_check(&self) -> serde_json::Value {
        let mut healthy = true;
        let mut pools = serde_json::Map::new();
        let mut issues: Vec<String> = Vec::new();

        for kind in PoolKind::ALL {
            let Some(stats) = self.pool_stats(kind) else {
                continue;
            };
            let mut pool_issues: Vec<String> = Vec::new();

            let utilization = stats["queue_utilization"].as_f64().unwrap_or(0.0);
            if utilization > 90.0 {
                pool_issues.push(format!("queue utilization {:.1}%", utilization));
            }
            let success_rate = stats["success_rate"].as_f64().unwrap_or(0.0);
            let submitted = stats["total_submitted"].as_u64().unwrap_or(0);
            if submitted > 10 && success_rate < 95.0 {
                pool_issues.push(format!("success rate {:.1}%", success_rate));
            }
            let pending = stats["pending_tasks"].as_u64().unwrap_or(0);
            let max_workers = stats["max_workers"].as_u64().unwrap_or(1);
            if pending > max_workers * 2 {
                pool_issues.push(format!("{} pending tasks", pending));
            }

            let pool_healthy = pool_issues.is_empty();
            if !pool_healthy {
                healthy = false;
                issues.extend(pool_issues.iter().map(|i| format!("{}: {}", kind, i)));
            }
            pools.insert(
                kind.to_string(),
                serde_json::json!({ "healthy": pool_healthy, "issues": pool_issues }),
            );
        }

        serde_json::json!({ "healthy": healthy, "pools": pools, "issues": issues })
    }

    /// Wait for every pool to drain, up to `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let pending: u64 = {
                let pools = self.pools.read();
                pools
                    .values()
                    .map(|p| p.counters.pending.load(Ordering::SeqCst))
                    .sum()
            };
            if pending == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(pending, "pool shutdown timed out with pending work");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Default for WorkerPoolManager {
    fn default() -> Self {
        Self::new()
    }
}
