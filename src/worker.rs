//! 就绪队列消费者：弹出任务并按名称调用注册的处理函数。

use crate::dispatch::DelayedQueue;
use crate::error::{CoordError, Result};
use crate::txn::BoxFuture;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub type Handler = Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub struct Worker {
    queue: DelayedQueue,
    name: String,
    handlers: HashMap<String, Handler>,
    /// 单次阻塞弹出的超时时间，也决定了检查停止信号的间隔
    block_timeout: Duration,
}

impl Worker {
    pub fn new(queue: DelayedQueue, name: &str) -> Self {
        Self {
            queue,
            name: name.to_string(),
            handlers: HashMap::new(),
            block_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_block_timeout(mut self, block_timeout: Duration) -> Self {
        self.block_timeout = block_timeout;
        self
    }

    pub fn register<F, Fut>(&mut self, handler: &str, f: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handle: Handler = Arc::new(move |args| -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(f(args)) });
        self.handlers.insert(handler.to_string(), handle);
    }

    /// 消费循环，返回成功处理的任务数
    ///
    /// 无法解析的任务、未知处理函数和处理失败只记录日志，任务不会重新入队；
    /// 只有存储错误会结束循环。
    pub async fn run(&self, stop: watch::Receiver<bool>) -> Result<u64> {
        info!("[WORKER] Worker started - queue: {}", self.name);
        let mut processed = 0;

        while !*stop.borrow() && stop.has_changed().is_ok() {
            let task = match self.queue.consume(&self.name, self.block_timeout).await {
                Ok(Some(task)) => task,
                Ok(None) => continue,
                Err(CoordError::Payload(e)) => {
                    error!("[WORKER] Dropping malformed task - queue: {}, error: {}", self.name, e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let Some(handler) = self.handlers.get(&task.handler) else {
                warn!(
                    "[WORKER] Unknown handler - id: {}, queue: {}, handler: {}",
                    task.id, self.name, task.handler
                );
                continue;
            };

            match handler(task.args).await {
                Ok(()) => {
                    processed += 1;
                    debug!("[WORKER] Task done - id: {}, handler: {}", task.id, task.handler);
                }
                Err(e) => {
                    error!(
                        "[WORKER] Task failed - id: {}, handler: {}, error: {}",
                        task.id, task.handler, e
                    );
                }
            }
        }

        info!("[WORKER] Worker stopped - queue: {}, processed: {}", self.name, processed);
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::QueueConfig;
    use crate::lock::{LockConfig, LockManager};
    use crate::store::memory::MemoryStore;
    use crate::store::Store;
    use parking_lot::Mutex;
    use serde_json::json;

    #[tokio::test]
    async fn test_worker_runs_registered_handlers() {
        let store = Arc::new(MemoryStore::new());
        let locks = LockManager::new(store.clone(), LockConfig::default());
        let queue = DelayedQueue::new(store, locks, QueueConfig::default());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut worker = Worker::new(queue.clone(), "email").with_block_timeout(Duration::from_millis(10));
        let recorder = seen.clone();
        worker.register("record", move |args| {
            let recorder = recorder.clone();
            async move {
                recorder.lock().push(args);
                Ok(())
            }
        });
        worker.register("fail", |_| async { Err(anyhow::anyhow!("smtp down")) });

        for args in [json!(1), json!(2)] {
            queue.schedule("email", "record", args, Duration::ZERO).await.unwrap();
        }
        queue.schedule("email", "missing", json!(3), Duration::ZERO).await.unwrap();
        queue.schedule("email", "fail", json!(4), Duration::ZERO).await.unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(stop_rx).await });

        for _ in 0..100 {
            if queue.ready_len("email").await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop_tx.send(true).unwrap();

        let processed = handle.await.unwrap().unwrap();
        assert_eq!(processed, 2);
        assert_eq!(*seen.lock(), vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_worker_skips_malformed_payload() {
        let store = Arc::new(MemoryStore::new());
        let locks = LockManager::new(store.clone(), LockConfig::default());
        let queue = DelayedQueue::new(store.clone(), locks, QueueConfig::default());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut worker = Worker::new(queue.clone(), "email").with_block_timeout(Duration::from_millis(10));
        let recorder = seen.clone();
        worker.register("record", move |args| {
            let recorder = recorder.clone();
            async move {
                recorder.lock().push(args);
                Ok(())
            }
        });

        store.rpush("queue:email", "{broken").await.unwrap();
        queue.schedule("email", "record", json!("ok"), Duration::ZERO).await.unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(stop_rx).await });

        for _ in 0..100 {
            if !seen.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stop_tx.send(true).unwrap();

        assert_eq!(handle.await.unwrap().unwrap(), 1);
        assert_eq!(*seen.lock(), vec![json!("ok")]);
        assert_eq!(queue.ready_len("email").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_worker_stops_when_sender_dropped() {
        let store = Arc::new(MemoryStore::new());
        let locks = LockManager::new(store.clone(), LockConfig::default());
        let queue = DelayedQueue::new(store, locks, QueueConfig::default());
        let worker = Worker::new(queue, "idle").with_block_timeout(Duration::from_millis(10));

        let (stop_tx, stop_rx) = watch::channel(false);
        drop(stop_tx);

        assert_eq!(worker.run(stop_rx).await.unwrap(), 0);
    }
}
