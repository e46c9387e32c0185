//! 基于共享键值存储的分布式协调原语：锁、计数信号量和延迟任务队列。

pub mod config;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod lock;
pub mod models;
pub mod semaphore;
pub mod store;
pub mod txn;
pub mod worker;

pub use dispatch::{DelayedQueue, Dispatch, QueueConfig};
pub use error::{CoordError, Result, StoreError};
pub use lock::{LockConfig, LockManager};
pub use semaphore::{SemaphoreConfig, SemaphoreManager};
pub use store::Store;
