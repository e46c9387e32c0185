//! 基于 `SET NX PX` 的分布式互斥锁。
//!
//! 锁是一个 key，值为本次获取生成的随机 token；只有持有相同 token 的客户端才能续期或释放。
//! 持有者崩溃后锁依靠过期时间自动释放。

use crate::error::{CoordError, Result};
use crate::store::{Command, KeyTtl, Store};
use crate::txn::{run_optimistic, Step};
use log::{debug, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LockConfig {
    pub key_prefix: String,
    /// 两次获取尝试之间的等待时间
    pub retry_interval: Duration,
    /// 释放/续期时乐观事务允许重试的时间
    pub max_wait: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            key_prefix: "lock:".to_string(),
            retry_interval: Duration::from_millis(10),
            max_wait: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn Store>,
    config: LockConfig,
}

impl LockManager {
    pub fn new(store: Arc<dyn Store>, config: LockConfig) -> Self {
        Self { store, config }
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.config.key_prefix, name)
    }

    /// 尝试获取锁，在 `acquire_timeout` 内反复重试
    ///
    /// 成功返回 token，超时返回 `None`。即使超时为零也至少尝试一次。
    pub async fn acquire(
        &self,
        name: &str,
        acquire_timeout: Duration,
        hold_timeout: Duration,
    ) -> Result<Option<String>> {
        let token = Uuid::new_v4().to_string();
        let key = self.key(name);
        let deadline = Instant::now() + acquire_timeout;

        loop {
            if self.store.set_nx(&key, &token, Some(hold_timeout)).await? {
                debug!(
                    "[LOCK] Acquired - name: {}, token: {}, hold: {:?}",
                    name, token, hold_timeout
                );
                return Ok(Some(token));
            }

            // 没有过期时间的锁永远不会被释放，补上过期时间
            if self.store.ttl(&key).await? == KeyTtl::Persistent {
                warn!(
                    "[LOCK] Lock without expiry found, restoring lease - name: {}, hold: {:?}",
                    name, hold_timeout
                );
                self.store.expire(&key, hold_timeout).await?;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("[LOCK] Acquire timed out - name: {}", name);
                return Ok(None);
            }
            tokio::time::sleep(self.config.retry_interval.min(remaining)).await;
        }
    }

    /// 仅当锁仍由 `token` 持有时删除
    ///
    /// 返回 `false` 表示锁已过期或被他人获取。
    pub async fn release(&self, name: &str, token: &str) -> Result<bool> {
        let key = self.key(name);
        let released = run_optimistic(
            self.store.as_ref(),
            std::slice::from_ref(&key),
            self.config.max_wait,
            |tx| {
                let key = key.clone();
                let token = token.to_string();
                Box::pin(async move {
                    let current = tx
                        .query(Command::Get { key: key.clone() })
                        .await?
                        .into_opt_text("GET")?;
                    if current.as_deref() == Some(token.as_str()) {
                        Ok(Step::Commit(vec![Command::Del { key }], true))
                    } else {
                        Ok(Step::Done(false))
                    }
                })
            },
        )
        .await?;

        if released {
            info!("[RELEASE] Lock released - name: {}, token: {}", name, token);
        } else {
            warn!("[RELEASE FAILED] Lock not held by token - name: {}, token: {}", name, token);
        }
        Ok(released)
    }

    /// 续期：token 匹配时把过期时间重置为 `hold_timeout`
    pub async fn extend(&self, name: &str, token: &str, hold_timeout: Duration) -> Result<bool> {
        let key = self.key(name);
        let extended = run_optimistic(
            self.store.as_ref(),
            std::slice::from_ref(&key),
            self.config.max_wait,
            |tx| {
                let key = key.clone();
                let token = token.to_string();
                Box::pin(async move {
                    let current = tx
                        .query(Command::Get { key: key.clone() })
                        .await?
                        .into_opt_text("GET")?;
                    if current.as_deref() == Some(token.as_str()) {
                        Ok(Step::Commit(
                            vec![Command::Expire {
                                key,
                                ttl: hold_timeout,
                            }],
                            true,
                        ))
                    } else {
                        Ok(Step::Done(false))
                    }
                })
            },
        )
        .await?;

        debug!("[LOCK] Extend - name: {}, extended: {}", name, extended);
        Ok(extended)
    }

    /// 在锁的保护下执行 `work`
    ///
    /// 获取失败返回 `Timeout`；释放时发现锁已丢失返回 `Lost`，此时 `work` 的结果被丢弃。
    pub async fn with_lock<F, T>(
        &self,
        name: &str,
        acquire_timeout: Duration,
        hold_timeout: Duration,
        work: F,
    ) -> Result<T>
    where
        F: Future<Output = T>,
    {
        let token = self
            .acquire(name, acquire_timeout, hold_timeout)
            .await?
            .ok_or_else(|| CoordError::Timeout {
                operation: format!("acquire lock '{}'", name),
            })?;

        let output = work.await;

        if !self.release(name, &token).await? {
            return Err(CoordError::Lost {
                name: name.to_string(),
            });
        }
        Ok(output)
    }
}
