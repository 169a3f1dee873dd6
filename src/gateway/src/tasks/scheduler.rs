//! Priority task scheduler
//!
//! Four FIFO lanes under one bound, a fixed pool of owned workers, per-task
//! timeouts, and retry-with-requeue. Callables are async closures invoked
//! with the task payload; a task's record survives the callable and is
//! purged by periodic maintenance once terminal and old.

use crate::error::{GatewayError, Result};
use lattice_shared::{SchedulerConfig, TaskPriority, TaskRecord, TaskStatus};
use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub type TaskPayload = serde_json::Value;
pub type TaskFuture = BoxFuture<'static, std::result::Result<serde_json::Value, String>>;
pub type TaskFn = Arc<dyn Fn(TaskPayload) -> TaskFuture + Send + Sync>;

const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);

/// Bounded queue with one FIFO lane per priority.
struct TaskQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    maxsize: usize,
}

#[derive(Default)]
struct QueueInner {
    lanes: [VecDeque<Uuid>; 4],
    size: usize,
}

impl TaskQueue {
    fn new(maxsize: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            maxsize,
        }
    }

    /// Enqueue without blocking; false when the total bound is reached.
    fn try_put(&self, priority: TaskPriority, task_id: Uuid) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.size >= self.maxsize {
                return false;
            }
            inner.lanes[priority.lane()].push_back(task_id);
            inner.size += 1;
        }
        self.notify.notify_one();
        true
    }

    /// Dequeue the head of the highest non-empty lane, waiting up to
    /// `timeout` for work to arrive.
    async fn get(&self, timeout: Duration) -> Option<Uuid> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut inner = self.inner.lock();
                for lane in inner.lanes.iter_mut() {
                    if let Some(task_id) = lane.pop_front() {
                        inner.size -= 1;
                        return Some(task_id);
                    }
                }
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    fn len(&self) -> usize {
        self.inner.lock().size
    }
}

#[derive(Default)]
struct WorkerState {
    tasks_processed: u64,
    current_task: Option<Uuid>,
}

/// The scheduler: queue, task records, callables, and worker lifecycle.
pub struct TaskScheduler {
    config: SchedulerConfig,
    queue: TaskQueue,
    tasks: DashMap<Uuid, TaskRecord>,
    callables: DashMap<Uuid, (TaskFn, TaskPayload)>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_state: DashMap<usize, WorkerState>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            queue: TaskQueue::new(config.queue_size),
            config,
            tasks: DashMap::new(),
            callables: DashMap::new(),
            workers: Mutex::new(Vec::new()),
            worker_state: DashMap::new(),
            shutdown,
            running: AtomicBool::new(false),
        }
    }

    /// Start the worker pool. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(workers = self.config.pool_size, "task scheduler starting");

        let mut workers = self.workers.lock();
        for worker_id in 0..self.config.pool_size {
            let scheduler = Arc::clone(self);
            let shutdown = self.shutdown.subscribe();
            workers.push(tokio::spawn(async move {
                scheduler.worker_loop(worker_id, shutdown).await;
            }));
        }
    }

    /// Signal workers and join them within the grace period; workers still
    /// alive afterwards are logged as orphaned.
    pub async fn stop(&self, grace: Duration) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("task scheduler stopping");
        let _ = self.shutdown.send(());

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for (worker_id, handle) in handles.into_iter().enumerate() {
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!(worker_id, "worker did not stop within the grace period");
            }
        }
        info!("task scheduler stopped");
    }

    /// Submit a task. Fails when the queue bound is reached.
    pub fn submit(
        &self,
        name: &str,
        priority: TaskPriority,
        max_retries: u32,
        timeout_secs: Option<u64>,
        payload: TaskPayload,
        callable: TaskFn,
    ) -> Result<Uuid> {
        let task_id = Uuid::new_v4();
        let record = TaskRecord {
            id: task_id,
            name: name.to_string(),
            priority,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries,
            timeout_secs,
            result: None,
            error: None,
        };

        self.tasks.insert(task_id, record);
        self.callables.insert(task_id, (callable, payload));

        if !self.queue.try_put(priority, task_id) {
            self.tasks.remove(&task_id);
            self.callables.remove(&task_id);
            return Err(GatewayError::queue_full("task queue is full"));
        }

        debug!(task = %task_id, name = %name, priority = ?priority, "task submitted");
        Ok(task_id)
    }

    pub fn get_task(&self, task_id: Uuid) -> Option<TaskRecord> {
        self.tasks.get(&task_id).map(|entry| entry.clone())
    }

    /// Cancel a pending task. Running tasks are not interrupted.
    pub fn cancel(&self, task_id: Uuid) -> bool {
        let Some(mut entry) = self.tasks.get_mut(&task_id) else {
            return false;
        };
        if entry.status != TaskStatus::Pending {
            return false;
        }
        entry.status = TaskStatus::Cancelled;
        entry.completed_at = Some(Utc::now());
        drop(entry);
        self.callables.remove(&task_id);
        info!(task = %task_id, "task cancelled");
        true
    }

    /// List tasks newest-first, optionally filtered by status.
    pub fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
        offset: usize,
    ) -> Vec<TaskRecord> {
        let mut tasks: Vec<TaskRecord> = self
            .tasks
            .iter()
            .map(|entry| entry.clone())
            .filter(|task| status.map_or(true, |s| task.status == s))
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.into_iter().skip(offset).take(limit).collect()
    }

    pub fn stats(&self) -> serde_json::Value {
        let mut by_status = serde_json::Map::new();
        for (name, status) in [
            ("pending", TaskStatus::Pending),
            ("running", TaskStatus::Running),
            ("completed", TaskStatus::Completed),
            ("failed", TaskStatus::Failed),
            ("cancelled", TaskStatus::Cancelled),
        ] {
            let count = self.tasks.iter().filter(|t| t.status == status).count();
            by_status.insert(name.to_string(), serde_json::Value::from(count));
        }

        let workers: Vec<serde_json::Value> = self
            .worker_state
            .iter()
            .map(|entry| {
                serde_json::json!({
                    "worker_id": entry.key(),
                    "tasks_processed": entry.tasks_processed,
                    "current_task": entry.current_task.map(|id| id.to_string()),
                })
            })
            .collect();

        serde_json::json!({
            "scheduler": {
                "running": self.running.load(Ordering::SeqCst),
                "queue_size": self.queue.len(),
                "max_workers": self.config.pool_size,
                "queue_bound": self.config.queue_size,
            },
            "tasks": by_status,
            "workers": workers,
        })
    }

    /// Purge terminal tasks older than `older_than_hours`. Returns the
    /// number removed.
    pub fn cleanup_tasks(&self, older_than_hours: i64) -> usize {
        let cutoff = Utc::now() - ChronoDuration::hours(older_than_hours);
        let mut removed = 0;
        self.tasks.retain(|_, task| {
            let purge = task.status.is_terminal()
                && task.completed_at.map_or(false, |at| at < cutoff);
            if purge {
                removed += 1;
            }
            !purge
        });
        if removed > 0 {
            info!(removed, "purged terminal tasks");
        }
        removed
    }

    async fn worker_loop(&self, worker_id: usize, mut shutdown: broadcast::Receiver<()>) {
        debug!(worker_id, "task worker started");
        self.worker_state.insert(worker_id, WorkerState::default());

        loop {
            let task_id = tokio::select! {
                _ = shutdown.recv() => break,
                task_id = self.queue.get(DEQUEUE_TIMEOUT) => task_id,
            };
            let Some(task_id) = task_id else { continue };

            // Cancelled while queued: drop it without execution.
            let priority = match self.tasks.get(&task_id) {
                Some(entry) if entry.status == TaskStatus::Pending => entry.priority,
                _ => continue,
            };

            if let Some(mut state) = self.worker_state.get_mut(&worker_id) {
                state.current_task = Some(task_id);
            }
            self.execute(task_id, priority).await;
            if let Some(mut state) = self.worker_state.get_mut(&worker_id) {
                state.current_task = None;
                state.tasks_processed += 1;
            }
        }

        debug!(worker_id, "task worker stopped");
    }

    async fn execute(&self, task_id: Uuid, priority: TaskPriority) {
        let Some(callable_entry) = self.callables.get(&task_id) else {
            return;
        };
        let (callable, payload) = {
            let (f, p) = &*callable_entry;
            (f.clone(), p.clone())
        };
        drop(callable_entry);

        let timeout_secs = {
            let Some(mut entry) = self.tasks.get_mut(&task_id) else {
                return;
            };
            entry.status = TaskStatus::Running;
            entry.started_at = Some(Utc::now());
            entry.timeout_secs
        };

        let future = callable(payload);
        let outcome = match timeout_secs {
            Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), future).await {
                Ok(result) => result,
                Err(_) => {
                    // Timeout is terminal; it does not consume a retry.
                    self.finish(task_id, TaskStatus::Failed, None, Some("timeout".into()));
                    warn!(task = %task_id, "task timed out");
                    return;
                }
            },
            None => future.await,
        };

        match outcome {
            Ok(value) => {
                self.finish(task_id, TaskStatus::Completed, Some(value), None);
                debug!(task = %task_id, "task completed");
            }
            Err(message) => self.handle_failure(task_id, priority, message),
        }
    }

    fn handle_failure(&self, task_id: Uuid, priority: TaskPriority, message: String) {
        let retry = {
            let Some(mut entry) = self.tasks.get_mut(&task_id) else {
                return;
            };
            if entry.retry_count < entry.max_retries {
                entry.retry_count += 1;
                entry.status = TaskStatus::Pending;
                entry.started_at = None;
                entry.error = None;
                Some(entry.retry_count)
            } else {
                None
            }
        };

        match retry {
            Some(attempt) => {
                if self.queue.try_put(priority, task_id) {
                    info!(task = %task_id, attempt, "task requeued for retry");
                } else {
                    self.finish(
                        task_id,
                        TaskStatus::Failed,
                        None,
                        Some("retry requeue failed: queue full".into()),
                    );
                }
            }
            None => {
                error!(task = %task_id, error = %message, "task failed");
                self.finish(task_id, TaskStatus::Failed, None, Some(message));
            }
        }
    }

    fn finish(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        if let Some(mut entry) = self.tasks.get_mut(&task_id) {
            entry.status = status;
            entry.result = result;
            entry.error = error;
            entry.completed_at = Some(Utc::now());
        }
        self.callables.remove(&task_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn config(pool_size: usize, queue_size: usize) -> SchedulerConfig {
        SchedulerConfig {
            pool_size,
            queue_size,
            cleanup_after_hours: 24,
        }
    }

    fn ok_callable(value: serde_json::Value) -> TaskFn {
        Arc::new(move |_| {
            let value = value.clone();
            Box::pin(async move { Ok(value) })
        })
    }

    async fn wait_for(
        scheduler: &TaskScheduler,
        task_id: Uuid,
        wanted: TaskStatus,
    ) -> TaskRecord {
        for _ in 0..500 {
            if let Some(task) = scheduler.get_task(task_id) {
                if task.status == wanted {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "task {} never reached {:?}: {:?}",
            task_id,
            wanted,
            scheduler.get_task(task_id)
        );
    }

    #[tokio::test]
    async fn test_priority_queue_ordering() {
        let queue = TaskQueue::new(10);
        let low = Uuid::new_v4();
        let urgent = Uuid::new_v4();
        let normal = Uuid::new_v4();

        queue.try_put(TaskPriority::Low, low);
        queue.try_put(TaskPriority::Urgent, urgent);
        queue.try_put(TaskPriority::Normal, normal);

        assert_eq!(queue.get(DEQUEUE_TIMEOUT).await, Some(urgent));
        assert_eq!(queue.get(DEQUEUE_TIMEOUT).await, Some(normal));
        assert_eq!(queue.get(DEQUEUE_TIMEOUT).await, Some(low));
        assert_eq!(queue.get(Duration::from_millis(50)).await, None);
    }

    #[tokio::test]
    async fn test_fifo_within_priority() {
        let queue = TaskQueue::new(10);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        queue.try_put(TaskPriority::Normal, first);
        queue.try_put(TaskPriority::Normal, second);

        assert_eq!(queue.get(DEQUEUE_TIMEOUT).await, Some(first));
        assert_eq!(queue.get(DEQUEUE_TIMEOUT).await, Some(second));
    }

    #[tokio::test]
    async fn test_submit_and_complete() {
        let scheduler = Arc::new(TaskScheduler::new(config(2, 100)));
        scheduler.start();

        let task_id = scheduler
            .submit(
                "compute",
                TaskPriority::Normal,
                3,
                None,
                serde_json::json!({"n": 2}),
                Arc::new(|payload| {
                    Box::pin(async move {
                        let n = payload["n"].as_i64().unwrap_or(0);
                        Ok(serde_json::json!({"doubled": n * 2}))
                    })
                }),
            )
            .unwrap();

        let task = wait_for(&scheduler, task_id, TaskStatus::Completed).await;
        assert_eq!(task.result.unwrap()["doubled"], 4);
        assert!(task.started_at.is_some());
        assert!(task.completed_at.is_some());

        scheduler.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let scheduler = Arc::new(TaskScheduler::new(config(1, 100)));
        scheduler.start();

        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let task_id = scheduler
            .submit(
                "flaky",
                TaskPriority::High,
                3,
                None,
                serde_json::Value::Null,
                Arc::new(move |_| {
                    let counter = counter.clone();
                    Box::pin(async move {
                        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err("transient".to_string())
                        } else {
                            Ok(serde_json::json!("done"))
                        }
                    })
                }),
            )
            .unwrap();

        let task = wait_for(&scheduler, task_id, TaskStatus::Completed).await;
        assert_eq!(task.retry_count, 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        scheduler.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_retries_exhausted_ends_failed() {
        let scheduler = Arc::new(TaskScheduler::new(config(1, 100)));
        scheduler.start();

        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let task_id = scheduler
            .submit(
                "doomed",
                TaskPriority::Normal,
                2,
                None,
                serde_json::Value::Null,
                Arc::new(move |_| {
                    let counter = counter.clone();
                    Box::pin(async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err("always".to_string())
                    })
                }),
            )
            .unwrap();

        let task = wait_for(&scheduler, task_id, TaskStatus::Failed).await;
        // max_retries = k gives at most k + 1 attempts.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(task.error.as_deref(), Some("always"));

        scheduler.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_timeout_fails_with_timeout_error() {
        let scheduler = Arc::new(TaskScheduler::new(config(1, 100)));
        scheduler.start();

        let task_id = scheduler
            .submit(
                "slow",
                TaskPriority::Normal,
                3,
                Some(1),
                serde_json::Value::Null,
                Arc::new(|_| {
                    Box::pin(async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok(serde_json::Value::Null)
                    })
                }),
            )
            .unwrap();

        let task = wait_for(&scheduler, task_id, TaskStatus::Failed).await;
        assert_eq!(task.error.as_deref(), Some("timeout"));
        assert_eq!(task.retry_count, 0);

        scheduler.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_cancel_only_pending() {
        let scheduler = Arc::new(TaskScheduler::new(config(1, 100)));
        // Workers not started: submissions stay pending.
        let task_id = scheduler
            .submit(
                "idle",
                TaskPriority::Low,
                0,
                None,
                serde_json::Value::Null,
                ok_callable(serde_json::Value::Null),
            )
            .unwrap();

        assert!(scheduler.cancel(task_id));
        assert!(!scheduler.cancel(task_id));
        let task = scheduler.get_task(task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.completed_at.is_some());

        // A cancelled task is skipped once workers run.
        scheduler.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            scheduler.get_task(task_id).unwrap().status,
            TaskStatus::Cancelled
        );
        scheduler.stop(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_queue_bound_rejects_submissions() {
        let scheduler = Arc::new(TaskScheduler::new(config(1, 1)));
        scheduler
            .submit(
                "first",
                TaskPriority::Normal,
                0,
                None,
                serde_json::Value::Null,
                ok_callable(serde_json::Value::Null),
            )
            .unwrap();

        let rejected = scheduler.submit(
            "second",
            TaskPriority::Normal,
            0,
            None,
            serde_json::Value::Null,
            ok_callable(serde_json::Value::Null),
        );
        assert!(matches!(rejected, Err(GatewayError::QueueFull { .. })));
        // The rejected task leaves no record behind.
        assert_eq!(scheduler.list_tasks(None, 100, 0).len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_purges_old_terminal_tasks() {
        let scheduler = Arc::new(TaskScheduler::new(config(1, 100)));
        let task_id = scheduler
            .submit(
                "old",
                TaskPriority::Normal,
                0,
                None,
                serde_json::Value::Null,
                ok_callable(serde_json::Value::Null),
            )
            .unwrap();
        scheduler.cancel(task_id);
        scheduler.tasks.get_mut(&task_id).unwrap().completed_at =
            Some(Utc::now() - ChronoDuration::hours(25));

        assert_eq!(scheduler.cleanup_tasks(24), 1);
        assert!(scheduler.get_task(task_id).is_none());
    }

    #[tokio::test]
    async fn test_list_tasks_filters_and_paginates() {
        let scheduler = Arc::new(TaskScheduler::new(config(1, 100)));
        for i in 0..5 {
            scheduler
                .submit(
                    &format!("task-{}", i),
                    TaskPriority::Normal,
                    0,
                    None,
                    serde_json::Value::Null,
                    ok_callable(serde_json::Value::Null),
                )
                .unwrap();
        }

        let page = scheduler.list_tasks(Some(TaskStatus::Pending), 2, 1);
        assert_eq!(page.len(), 2);
        let all = scheduler.list_tasks(None, 100, 0);
        assert_eq!(all.len(), 5);
        // Newest first.
        assert!(all[0].created_at >= all[4].created_at);
    }
}
