//! 延迟任务队列。
//!
//! 生产者把任务写入以执行时间为分数的待执行集合；分发器轮询集合头部，到期后在任务锁的
//! 保护下把任务移入目标就绪队列。任务锁加上有条件的移除保证同一任务只会进入就绪队列一次。

use crate::error::{CoordError, Result};
use crate::lock::LockManager;
use crate::models::{unix_now, Task};
use crate::store::{Command, Store};
use crate::txn::{run_optimistic, Step};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// 待执行集合的 key
    pub pending_key: String,
    /// 就绪队列 key 前缀，完整 key 为 `<prefix><queue>`
    pub ready_prefix: String,
    /// 没有到期任务时的轮询间隔
    pub poll_interval: Duration,
    /// 获取任务锁的超时时间，拿不到就跳过
    pub claim_timeout: Duration,
    pub claim_hold: Duration,
    /// 移动任务时乐观事务允许重试的时间
    pub max_wait: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            pending_key: "delayed:".to_string(),
            ready_prefix: "queue:".to_string(),
            poll_interval: Duration::from_millis(100),
            claim_timeout: Duration::from_millis(10),
            claim_hold: Duration::from_secs(10),
            max_wait: Duration::from_secs(5),
        }
    }
}

/// 单次分发的结果
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// 没有到期任务
    Idle,
    Moved(String),
    /// 拿到锁时任务已被其他分发器移走
    AlreadyMoved(String),
    /// 任务锁被其他分发器持有
    Contended(String),
    /// 无法解析的待执行记录，已删除
    Discarded,
}

#[derive(Clone)]
pub struct DelayedQueue {
    store: Arc<dyn Store>,
    locks: LockManager,
    config: QueueConfig,
}

impl DelayedQueue {
    pub fn new(store: Arc<dyn Store>, locks: LockManager, config: QueueConfig) -> Self {
        Self { store, locks, config }
    }

    pub fn ready_key(&self, queue: &str) -> String {
        format!("{}{}", self.config.ready_prefix, queue)
    }

    /// 提交任务，`delay` 为零时直接进入就绪队列
    pub async fn schedule(
        &self,
        queue: &str,
        handler: &str,
        args: serde_json::Value,
        delay: Duration,
    ) -> Result<String> {
        let task = Task::new(queue, handler, args);
        let payload = serde_json::to_string(&task)?;

        if delay.is_zero() {
            self.store.rpush(&self.ready_key(queue), &payload).await?;
        } else {
            let due = unix_now() + delay.as_secs_f64();
            self.store.zadd(&self.config.pending_key, &payload, due).await?;
        }

        info!(
            "[SCHEDULE] Task scheduled - id: {}, queue: {}, handler: {}, delay: {:?}",
            task.id, task.queue, task.handler, delay
        );
        Ok(task.id)
    }

    /// 处理待执行集合头部的任务
    pub async fn dispatch_next(&self) -> Result<Dispatch> {
        let head = self.store.zrange(&self.config.pending_key, 0, 0).await?;
        let Some((member, due)) = head.into_iter().next() else {
            return Ok(Dispatch::Idle);
        };
        if due > unix_now() {
            return Ok(Dispatch::Idle);
        }

        let task: Task = match serde_json::from_str(&member) {
            Ok(task) => task,
            Err(e) => {
                error!("[DISPATCH] Discarding malformed pending entry: {} ({})", member, e);
                self.store.zrem(&self.config.pending_key, &member).await?;
                return Ok(Dispatch::Discarded);
            }
        };

        let Some(token) = self
            .locks
            .acquire(&task.id, self.config.claim_timeout, self.config.claim_hold)
            .await?
        else {
            debug!("[DISPATCH] Task claimed by another dispatcher - id: {}", task.id);
            return Ok(Dispatch::Contended(task.id));
        };

        let moved = self.move_to_ready(&member, &task).await;
        let released = self.locks.release(&task.id, &token).await;

        let moved = match moved {
            Err(e @ CoordError::Contention { .. }) => {
                warn!("[DISPATCH] Gave up moving task - id: {}, error: {}", task.id, e);
                return Err(e);
            }
            other => other?,
        };
        if !released? {
            warn!("[DISPATCH] Task lock expired while moving - id: {}", task.id);
        }

        if moved {
            info!(
                "[DISPATCH] Task ready - id: {}, queue: {}, handler: {}",
                task.id, task.queue, task.handler
            );
            Ok(Dispatch::Moved(task.id))
        } else {
            debug!("[DISPATCH] Task already moved - id: {}", task.id);
            Ok(Dispatch::AlreadyMoved(task.id))
        }
    }

    /// 任务仍在待执行集合中时，原子地删除并推入就绪队列
    ///
    /// watch 的是整个待执行集合，并发的 `schedule` 也会打断移动；持续高写入时可能在
    /// `max_wait` 内一直提交失败并返回 `Contention`。
    async fn move_to_ready(&self, member: &str, task: &Task) -> Result<bool> {
        let pending = self.config.pending_key.clone();
        let ready = self.ready_key(&task.queue);

        run_optimistic(
            self.store.as_ref(),
            std::slice::from_ref(&pending),
            self.config.max_wait,
            |tx| {
                let pending = pending.clone();
                let ready = ready.clone();
                let member = member.to_string();
                Box::pin(async move {
                    let score = tx
                        .query(Command::ZScore {
                            key: pending.clone(),
                            member: member.clone(),
                        })
                        .await?
                        .into_opt_float("ZSCORE")?;
                    if score.is_none() {
                        return Ok(Step::Done(false));
                    }
                    Ok(Step::Commit(
                        vec![
                            Command::ZRem {
                                key: pending,
                                member: member.clone(),
                            },
                            Command::RPush {
                                key: ready,
                                value: member,
                            },
                        ],
                        true,
                    ))
                })
            },
        )
        .await
    }

    /// 分发循环，`stop` 变为 true 或发送端被丢弃时退出
    ///
    /// 存储错误直接返回给调用方。
    pub async fn run_dispatcher(&self, mut stop: watch::Receiver<bool>) -> Result<()> {
        info!("[DISPATCH] Dispatcher started - pending: {}", self.config.pending_key);

        while !*stop.borrow() {
            if self.dispatch_next().await? != Dispatch::Idle {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("[DISPATCH] Dispatcher stopped");
        Ok(())
    }

    /// 从就绪队列阻塞弹出一个任务，超时返回 `None`
    ///
    /// 弹出后任务即从队列中消失，处理失败或崩溃不会重新投递。
    pub async fn consume(&self, queue: &str, block_timeout: Duration) -> Result<Option<Task>> {
        match self.store.blpop(&self.ready_key(queue), block_timeout).await? {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    pub async fn pending_len(&self) -> Result<i64> {
        Ok(self.store.zcard(&self.config.pending_key).await?)
    }

    pub async fn ready_len(&self, queue: &str) -> Result<i64> {
        Ok(self.store.llen(&self.ready_key(queue)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::lock::LockConfig;
    use crate::store::memory::MemoryStore;
    use crate::store::{Batch, Reply, Transaction};
    use async_trait::async_trait;
    use serde_json::json;

    fn queue() -> (DelayedQueue, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let locks = LockManager::new(store.clone(), LockConfig::default());
        let config = QueueConfig {
            poll_interval: Duration::from_millis(5),
            ..QueueConfig::default()
        };
        (DelayedQueue::new(store.clone(), locks, config), store)
    }

    #[tokio::test]
    async fn test_zero_delay_is_ready_immediately() {
        let (queue, _) = queue();

        let id = queue
            .schedule("email", "send_sold_email", json!({"item": "sword"}), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(queue.pending_len().await.unwrap(), 0);
        let task = queue.consume("email", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(task.id, id);
        assert_eq!(task.handler, "send_sold_email");
        assert_eq!(task.args, json!({"item": "sword"}));
    }

    #[tokio::test]
    async fn test_delayed_task_waits_until_due() {
        let (queue, _) = queue();

        let id = queue
            .schedule("email", "remind", json!([]), Duration::from_millis(80))
            .await
            .unwrap();

        assert_eq!(queue.dispatch_next().await.unwrap(), Dispatch::Idle);
        assert_eq!(queue.ready_len("email").await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(queue.dispatch_next().await.unwrap(), Dispatch::Moved(id.clone()));
        assert_eq!(queue.pending_len().await.unwrap(), 0);
        let task = queue.consume("email", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(task.id, id);
    }

    #[tokio::test]
    async fn test_claimed_task_is_skipped() {
        let (queue, _) = queue();
        let locks = queue.locks.clone();

        let id = queue
            .schedule("email", "remind", json!([]), Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        // 另一个分发器正持有任务锁
        let token = locks
            .acquire(&id, Duration::from_millis(10), Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.dispatch_next().await.unwrap(), Dispatch::Contended(id.clone()));
        assert_eq!(queue.pending_len().await.unwrap(), 1);

        locks.release(&id, &token).await.unwrap();
        assert_eq!(queue.dispatch_next().await.unwrap(), Dispatch::Moved(id));
    }

    #[tokio::test]
    async fn test_malformed_pending_entry_is_discarded() {
        let (queue, store) = queue();
        store.zadd("delayed:", "not json", 0.0).await.unwrap();

        assert_eq!(queue.dispatch_next().await.unwrap(), Dispatch::Discarded);
        assert_eq!(queue.pending_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_consume_times_out_and_rejects_bad_payload() {
        let (queue, store) = queue();

        let none = queue.consume("email", Duration::from_millis(20)).await.unwrap();
        assert!(none.is_none());

        store.rpush("queue:email", "{broken").await.unwrap();
        let err = queue.consume("email", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, CoordError::Payload(_)));
    }

    /// 所有乐观事务的提交都被打断，模拟待执行集合持续被写入
    struct BusyStore {
        inner: MemoryStore,
    }

    struct AbortingTransaction {
        inner: Box<dyn Transaction>,
    }

    #[async_trait]
    impl Transaction for AbortingTransaction {
        async fn query(&mut self, cmd: Command) -> std::result::Result<Reply, StoreError> {
            self.inner.query(cmd).await
        }

        async fn commit(&mut self, _batch: Batch) -> std::result::Result<Option<Vec<Reply>>, StoreError> {
            self.inner.unwatch().await?;
            Ok(None)
        }

        async fn unwatch(&mut self) -> std::result::Result<(), StoreError> {
            self.inner.unwatch().await
        }
    }

    #[async_trait]
    impl Store for BusyStore {
        async fn execute(&self, cmd: Command) -> std::result::Result<Reply, StoreError> {
            self.inner.execute(cmd).await
        }

        async fn exec(&self, batch: Batch) -> std::result::Result<Vec<Reply>, StoreError> {
            self.inner.exec(batch).await
        }

        async fn watch(&self, keys: &[String]) -> std::result::Result<Box<dyn Transaction>, StoreError> {
            let inner = self.inner.watch(keys).await?;
            Ok(Box::new(AbortingTransaction { inner }))
        }

        async fn blpop(&self, key: &str, timeout: Duration) -> std::result::Result<Option<String>, StoreError> {
            self.inner.blpop(key, timeout).await
        }
    }

    #[tokio::test]
    async fn test_move_gives_up_under_constant_writes() {
        let store: Arc<dyn Store> = Arc::new(BusyStore {
            inner: MemoryStore::new(),
        });
        let locks = LockManager::new(
            store.clone(),
            LockConfig {
                max_wait: Duration::from_millis(20),
                ..LockConfig::default()
            },
        );
        let config = QueueConfig {
            max_wait: Duration::from_millis(20),
            ..QueueConfig::default()
        };
        let queue = DelayedQueue::new(store, locks, config);

        queue
            .schedule("email", "send", json!({}), Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let err = queue.dispatch_next().await.unwrap_err();
        assert!(matches!(err, CoordError::Contention { .. }));
        assert_eq!(queue.pending_len().await.unwrap(), 1);
        assert_eq!(queue.ready_len("email").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_store_keeps_no_bookkeeping_after_dispatch() {
        let (queue, store) = queue();

        for i in 0..200 {
            queue
                .schedule("email", "send", json!({"n": i}), Duration::from_millis(1))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;

        let mut moved = 0;
        loop {
            match queue.dispatch_next().await.unwrap() {
                Dispatch::Idle => break,
                Dispatch::Moved(_) => moved += 1,
                other => panic!("unexpected dispatch result: {:?}", other),
            }
        }
        assert_eq!(moved, 200);

        while queue.consume("email", Duration::ZERO).await.unwrap().is_some() {}
        assert_eq!(queue.pending_len().await.unwrap(), 0);
        assert_eq!(store.tracked_versions(), 0);
    }

    #[tokio::test]
    async fn test_run_dispatcher_moves_and_stops() {
        let (queue, _) = queue();
        let (stop_tx, stop_rx) = watch::channel(false);

        let dispatcher = queue.clone();
        let handle = tokio::spawn(async move { dispatcher.run_dispatcher(stop_rx).await });

        let id = queue
            .schedule("reports", "build", json!({"day": 1}), Duration::from_millis(30))
            .await
            .unwrap();

        let task = queue
            .consume("reports", Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.id, id);

        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
