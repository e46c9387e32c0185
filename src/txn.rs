//! 乐观事务：watch → 读取 → 有条件提交，失败后在时间窗口内重试。

use crate::error::{CoordError, Result};
use crate::store::{Batch, Store, Transaction};
use log::debug;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const MIN_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(50);

/// 事务体读取后的决定
pub enum Step<T> {
    /// 不需要写入，直接返回
    Done(T),
    /// 提交批次，成功后返回
    Commit(Batch, T),
}

/// 在 watch `watch_keys` 的前提下反复执行 `body`，直到提交成功或超过 `max_wait`。
///
/// 每次调用至多成功提交一次；被打断的尝试不会留下任何写入。`body` 返回的错误会结束
/// 会话并直接向上传递。
pub async fn run_optimistic<T, F>(
    store: &dyn Store,
    watch_keys: &[String],
    max_wait: Duration,
    mut body: F,
) -> Result<T>
where
    T: Send,
    F: for<'a> FnMut(&'a mut (dyn Transaction + 'static)) -> BoxFuture<'a, Result<Step<T>>>,
{
    let started = Instant::now();
    let mut backoff = MIN_BACKOFF;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let mut tx = store.watch(watch_keys).await?;

        match body(tx.as_mut()).await {
            Ok(Step::Done(value)) => {
                tx.unwatch().await?;
                return Ok(value);
            }
            Ok(Step::Commit(batch, value)) => {
                if tx.commit(batch).await?.is_some() {
                    return Ok(value);
                }
                debug!(
                    "[TXN] Commit aborted - keys: {:?}, attempt: {}",
                    watch_keys, attempts
                );
            }
            Err(e) => {
                let _ = tx.unwatch().await;
                return Err(e);
            }
        }

        let waited = started.elapsed();
        if waited >= max_wait {
            return Err(CoordError::Contention {
                keys: watch_keys.to_vec(),
                waited,
            });
        }
        tokio::time::sleep(backoff.min(max_wait - waited)).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::{Command, Reply};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// 读取计数器并写回 +1
    async fn increment(store: &MemoryStore, key: &str, interfere: Option<Arc<AtomicU32>>) -> Result<i64> {
        let key = key.to_string();
        let store_for_body = store.clone();
        run_optimistic(store, &[key.clone()], Duration::from_secs(1), |tx| {
            let key = key.clone();
            let interfere = interfere.clone();
            let store = store_for_body.clone();
            Box::pin(async move {
                let current = tx
                    .query(Command::Get { key: key.clone() })
                    .await?
                    .into_opt_text("GET")?
                    .map(|s| s.parse::<i64>().unwrap_or(0))
                    .unwrap_or(0);

                // 第一次尝试时模拟另一个客户端抢先写入
                if let Some(counter) = interfere {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        store.incr(&key, 100).await?;
                    }
                }

                let next = current + 1;
                Ok(Step::Commit(
                    vec![
                        Command::Del { key: key.clone() },
                        Command::Incr { key, by: next },
                    ],
                    next,
                ))
            })
        })
        .await
    }

    #[tokio::test]
    async fn test_commit_without_conflict() {
        let store = MemoryStore::new();

        let value = increment(&store, "counter", None).await.unwrap();

        assert_eq!(value, 1);
        assert_eq!(store.get("counter").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_retries_after_conflicting_write() {
        let store = MemoryStore::new();
        let attempts = Arc::new(AtomicU32::new(0));

        let value = increment(&store, "counter", Some(attempts.clone())).await.unwrap();

        // 第一次被打断，第二次读到 100 后提交
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(value, 101);
        assert_eq!(store.get("counter").await.unwrap().as_deref(), Some("101"));
    }

    #[tokio::test]
    async fn test_done_skips_commit() {
        let store = MemoryStore::new();

        let value = run_optimistic(&store, &["k".to_string()], Duration::from_secs(1), |tx| {
            Box::pin(async move {
                let reply = tx.query(Command::Get { key: "k".to_string() }).await?;
                Ok(Step::Done(reply == Reply::Nil))
            })
        })
        .await
        .unwrap();

        assert!(value);
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_contention_after_max_wait() {
        let store = MemoryStore::new();
        let writer = store.clone();

        let result: Result<()> = run_optimistic(&store, &["hot".to_string()], Duration::from_millis(30), |_tx| {
            let writer = writer.clone();
            Box::pin(async move {
                // 每次尝试都有其他客户端修改 key
                writer.incr("hot", 1).await?;
                Ok(Step::Commit(vec![Command::Del { key: "hot".to_string() }], ()))
            })
        })
        .await;

        assert!(matches!(result, Err(CoordError::Contention { .. })));
        assert!(store.get("hot").await.unwrap().is_some());
    }
}
