//! Task scheduling and worker-pool types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Strict task priority; FIFO within a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Urgent,
    High,
    Normal,
    Low,
}

impl TaskPriority {
    /// Dequeue order, highest first.
    pub const ORDERED: [TaskPriority; 4] = [
        TaskPriority::Urgent,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
    ];

    pub fn lane(&self) -> usize {
        match self {
            TaskPriority::Urgent => 0,
            TaskPriority::High => 1,
            TaskPriority::Normal => 2,
            TaskPriority::Low => 3,
        }
    }
}

/// Task lifecycle. Transitions: pending → running → {completed, failed},
/// pending → cancelled, failed → pending on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Bookkeeping record for a scheduled task; the callable itself lives in the
/// scheduler and is not serializable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub name: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_secs: Option<u64>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// The named worker pools managed by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    Io,
    Cpu,
    Proxy,
    HealthCheck,
}

impl PoolKind {
    pub const ALL: [PoolKind; 4] = [
        PoolKind::Io,
        PoolKind::Cpu,
        PoolKind::Proxy,
        PoolKind::HealthCheck,
    ];
}

impl std::fmt::Display for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolKind::Io => write!(f, "io"),
            PoolKind::Cpu => write!(f, "cpu"),
            PoolKind::Proxy => write!(f, "proxy"),
            PoolKind::HealthCheck => write!(f, "health_check"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_lane_ordering() {
        let lanes: Vec<usize> = TaskPriority::ORDERED.iter().map(|p| p.lane()).collect();
        assert_eq!(lanes, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_pool_kind_names() {
        assert_eq!(PoolKind::HealthCheck.to_string(), "health_check");
        assert_eq!(
            serde_json::to_string(&PoolKind::Io).unwrap(),
            "\"io\""
        );
    }
}
