//! Background work: the priority task scheduler and the named worker pools.

pub mod pool;
pub mod scheduler;

pub use pool::{PoolSettings, WorkerPoolManager};
pub use scheduler::{TaskFn, TaskFuture, TaskPayload, TaskScheduler};
