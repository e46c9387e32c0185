//! 计数信号量。
//!
//! 简单信号量只用一个以获取时间为分数的有序集合，持有者排名小于 limit 即获得许可。
//! 各客户端时钟不一致或同一时刻并发获取时，它可能放进超过 limit 个持有者。
//!
//! 公平信号量额外维护 `<name>:owner`（token → 递增票号）和 `<name>:counter`，
//! 以票号排名决定许可，不再依赖各客户端的时钟。

use crate::error::Result;
use crate::lock::LockManager;
use crate::models::unix_now;
use crate::store::{Aggregate, Command, Reply, SetOp, Store};
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SemaphoreConfig {
    /// `acquire_fair_with_lock` 获取外层锁的超时时间
    pub lock_acquire_timeout: Duration,
    /// 外层锁的持有时间
    pub lock_hold: Duration,
}

impl Default for SemaphoreConfig {
    fn default() -> Self {
        Self {
            lock_acquire_timeout: Duration::from_secs(1),
            lock_hold: Duration::from_secs(10),
        }
    }
}

fn owner_key(name: &str) -> String {
    format!("{}:owner", name)
}

fn counter_key(name: &str) -> String {
    format!("{}:counter", name)
}

/// 批次最后一条命令（ZRANK）的结果
fn last_rank(mut replies: Vec<Reply>) -> Result<Option<i64>> {
    Ok(replies.pop().unwrap_or(Reply::Nil).into_opt_int("ZRANK")?)
}

fn admitted(rank: Option<i64>, limit: u64) -> bool {
    matches!(rank, Some(r) if r >= 0 && (r as u64) < limit)
}

#[derive(Clone)]
pub struct SemaphoreManager {
    store: Arc<dyn Store>,
    locks: LockManager,
    config: SemaphoreConfig,
}

impl SemaphoreManager {
    pub fn new(store: Arc<dyn Store>, locks: LockManager, config: SemaphoreConfig) -> Self {
        Self { store, locks, config }
    }

    /// 获取简单信号量，成功返回 token
    pub async fn acquire(&self, name: &str, limit: u64, timeout: Duration) -> Result<Option<String>> {
        self.acquire_at(name, limit, timeout, unix_now()).await
    }

    async fn acquire_at(&self, name: &str, limit: u64, timeout: Duration, now: f64) -> Result<Option<String>> {
        let token = Uuid::new_v4().to_string();

        let replies = self
            .store
            .exec(vec![
                // 清理超时的持有者
                Command::ZRemRangeByScore {
                    key: name.to_string(),
                    min: f64::NEG_INFINITY,
                    max: now - timeout.as_secs_f64(),
                },
                Command::ZAdd {
                    key: name.to_string(),
                    member: token.clone(),
                    score: now,
                },
                Command::ZRank {
                    key: name.to_string(),
                    member: token.clone(),
                },
            ])
            .await?;

        let rank = last_rank(replies)?;
        if admitted(rank, limit) {
            debug!("[SEMAPHORE] Acquired - name: {}, token: {}, rank: {:?}", name, token, rank);
            return Ok(Some(token));
        }

        // 没拿到许可，删除自己的记录
        self.store.zrem(name, &token).await?;
        debug!("[SEMAPHORE] Full - name: {}, limit: {}", name, limit);
        Ok(None)
    }

    /// 释放简单信号量；返回 `false` 表示已超时被清理
    pub async fn release(&self, name: &str, token: &str) -> Result<bool> {
        let released = self.store.zrem(name, token).await?;
        debug!("[SEMAPHORE] Release - name: {}, token: {}, released: {}", name, token, released);
        Ok(released)
    }

    /// 获取公平信号量，成功返回 token
    pub async fn acquire_fair(&self, name: &str, limit: u64, timeout: Duration) -> Result<Option<String>> {
        self.acquire_fair_at(name, limit, timeout, unix_now()).await
    }

    async fn acquire_fair_at(&self, name: &str, limit: u64, timeout: Duration, now: f64) -> Result<Option<String>> {
        let token = Uuid::new_v4().to_string();
        let owner = owner_key(name);

        let mut replies = self
            .store
            .exec(vec![
                Command::ZRemRangeByScore {
                    key: name.to_string(),
                    min: f64::NEG_INFINITY,
                    max: now - timeout.as_secs_f64(),
                },
                // 只保留仍在时间集合中的持有者的票号，权重 0 让票号保持原值
                Command::ZStore {
                    op: SetOp::Inter,
                    dest: owner.clone(),
                    sources: vec![(owner.clone(), 1.0), (name.to_string(), 0.0)],
                    aggregate: Aggregate::Sum,
                    ttl: None,
                },
                Command::Incr {
                    key: counter_key(name),
                    by: 1,
                },
            ])
            .await?;
        let ticket = replies.pop().unwrap_or(Reply::Nil).into_int("INCRBY")?;

        let replies = self
            .store
            .exec(vec![
                Command::ZAdd {
                    key: name.to_string(),
                    member: token.clone(),
                    score: now,
                },
                Command::ZAdd {
                    key: owner.clone(),
                    member: token.clone(),
                    score: ticket as f64,
                },
                Command::ZRank {
                    key: owner.clone(),
                    member: token.clone(),
                },
            ])
            .await?;

        let rank = last_rank(replies)?;
        if admitted(rank, limit) {
            debug!(
                "[SEMAPHORE] Fair acquired - name: {}, token: {}, ticket: {}, rank: {:?}",
                name, token, ticket, rank
            );
            return Ok(Some(token));
        }

        self.store
            .exec(vec![
                Command::ZRem {
                    key: name.to_string(),
                    member: token.clone(),
                },
                Command::ZRem {
                    key: owner,
                    member: token,
                },
            ])
            .await?;
        debug!("[SEMAPHORE] Fair full - name: {}, ticket: {}, limit: {}", name, ticket, limit);
        Ok(None)
    }

    /// 从两个集合中同时删除持有者；返回 `false` 表示已超时被清理
    pub async fn release_fair(&self, name: &str, token: &str) -> Result<bool> {
        let replies = self
            .store
            .exec(vec![
                Command::ZRem {
                    key: name.to_string(),
                    member: token.to_string(),
                },
                Command::ZRem {
                    key: owner_key(name),
                    member: token.to_string(),
                },
            ])
            .await?;
        let released = replies
            .into_iter()
            .next()
            .unwrap_or(Reply::Nil)
            .into_bool("ZREM")?;
        debug!("[SEMAPHORE] Fair release - name: {}, token: {}, released: {}", name, token, released);
        Ok(released)
    }

    /// 刷新持有时间
    ///
    /// 返回 `false` 表示持有者已被清理，许可丢失，调用方必须停止受保护的工作。
    pub async fn refresh_fair(&self, name: &str, token: &str) -> Result<bool> {
        // ZADD 返回 1 说明是新成员，即之前已被清理
        if self.store.zadd(name, token, unix_now()).await? {
            warn!("[SEMAPHORE] Lost semaphore - name: {}, token: {}", name, token);
            self.release_fair(name, token).await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// 在同名短锁的保护下获取公平信号量，消除两个批次之间的竞争窗口
    ///
    /// 拿不到锁时返回 `None`。
    pub async fn acquire_fair_with_lock(&self, name: &str, limit: u64, timeout: Duration) -> Result<Option<String>> {
        let Some(lock_token) = self
            .locks
            .acquire(name, self.config.lock_acquire_timeout, self.config.lock_hold)
            .await?
        else {
            debug!("[SEMAPHORE] Guard lock busy - name: {}", name);
            return Ok(None);
        };

        let acquired = self.acquire_fair(name, limit, timeout).await;
        let released = self.locks.release(name, &lock_token).await;

        let acquired = acquired?;
        if !released? {
            warn!("[SEMAPHORE] Guard lock expired during acquire - name: {}", name);
        }
        Ok(acquired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockConfig;
    use crate::store::memory::MemoryStore;

    fn manager() -> (SemaphoreManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let locks = LockManager::new(store.clone(), LockConfig::default());
        (
            SemaphoreManager::new(store.clone(), locks, SemaphoreConfig::default()),
            store,
        )
    }

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_simple_acquire_up_to_limit() {
        let (sems, store) = manager();

        let a = sems.acquire("sem", 2, TIMEOUT).await.unwrap();
        let b = sems.acquire("sem", 2, TIMEOUT).await.unwrap();
        let c = sems.acquire("sem", 2, TIMEOUT).await.unwrap();

        assert!(a.is_some());
        assert!(b.is_some());
        assert!(c.is_none());
        // 失败者不留下记录
        assert_eq!(store.zcard("sem").await.unwrap(), 2);

        assert!(sems.release("sem", &a.unwrap()).await.unwrap());
        assert!(sems.acquire("sem", 2, TIMEOUT).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_simple_prunes_timed_out_holders() {
        let (sems, _) = manager();

        let stale = sems.acquire_at("sem", 1, TIMEOUT, 1000.0).await.unwrap().unwrap();
        let fresh = sems.acquire_at("sem", 1, TIMEOUT, 1011.0).await.unwrap();

        assert!(fresh.is_some());
        assert!(!sems.release("sem", &stale).await.unwrap());
    }

    #[tokio::test]
    async fn test_simple_overadmits_with_skewed_clock() {
        let (sems, _) = manager();

        // 第二个客户端的时钟慢了半秒，时间戳排到了前面
        let a = sems.acquire_at("sem", 1, TIMEOUT, 100.0).await.unwrap();
        let b = sems.acquire_at("sem", 1, TIMEOUT, 99.5).await.unwrap();

        assert!(a.is_some());
        assert!(b.is_some());
    }

    #[tokio::test]
    async fn test_fair_rejects_skewed_clock() {
        let (sems, store) = manager();

        let a = sems.acquire_fair_at("sem", 1, TIMEOUT, 100.0).await.unwrap();
        let b = sems.acquire_fair_at("sem", 1, TIMEOUT, 99.5).await.unwrap();

        assert!(a.is_some());
        assert!(b.is_none());
        assert_eq!(store.zcard("sem").await.unwrap(), 1);
        assert_eq!(store.zcard("sem:owner").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fair_admits_exactly_limit() {
        let (sems, _) = manager();

        let mut tokens = Vec::new();
        for _ in 0..3 {
            tokens.push(sems.acquire_fair("pool", 3, TIMEOUT).await.unwrap().unwrap());
        }
        assert!(sems.acquire_fair("pool", 3, TIMEOUT).await.unwrap().is_none());

        assert!(sems.release_fair("pool", &tokens[0]).await.unwrap());
        assert!(!sems.release_fair("pool", &tokens[0]).await.unwrap());
        assert!(sems.acquire_fair("pool", 3, TIMEOUT).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fair_drops_tickets_of_timed_out_holders() {
        let (sems, store) = manager();

        sems.acquire_fair_at("pool", 1, TIMEOUT, 1000.0).await.unwrap().unwrap();
        let late = sems.acquire_fair_at("pool", 1, TIMEOUT, 1011.0).await.unwrap().unwrap();

        let owners: Vec<String> = store
            .zrange("pool:owner", 0, -1)
            .await
            .unwrap()
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        assert_eq!(owners, vec![late]);
    }

    #[tokio::test]
    async fn test_refresh_detects_lost_semaphore() {
        let (sems, store) = manager();

        let token = sems.acquire_fair("pool", 1, TIMEOUT).await.unwrap().unwrap();
        assert!(sems.refresh_fair("pool", &token).await.unwrap());

        // 模拟被其他客户端当作超时清理
        store.zrem("pool", &token).await.unwrap();

        assert!(!sems.refresh_fair("pool", &token).await.unwrap());
        assert_eq!(store.zcard("pool").await.unwrap(), 0);
        assert_eq!(store.zcard("pool:owner").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_acquire_with_lock_releases_guard() {
        let (sems, store) = manager();

        let token = sems.acquire_fair_with_lock("pool", 1, TIMEOUT).await.unwrap();
        assert!(token.is_some());
        assert_eq!(store.get("lock:pool").await.unwrap(), None);

        assert!(sems.acquire_fair_with_lock("pool", 1, TIMEOUT).await.unwrap().is_none());
    }
}
