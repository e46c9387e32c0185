use crate::error::StoreError;
use crate::store::{Aggregate, Batch, Command, Reply, SetOp, Store, Transaction};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

enum Value {
    Text(String),
    Sorted(HashMap<String, f64>),
    List(VecDeque<String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

/// 键空间
///
/// 只为正被 watch 的 key 记录版本号：watch 期间每次修改（包括删除和过期）都会给 key
/// 分配新的版本号，最后一个 watcher 结束时丢弃记录。
#[derive(Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
    versions: HashMap<String, u64>,
    /// key -> 打开中的 watch 数量
    watchers: HashMap<String, usize>,
    clock: u64,
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType { key: key.to_string() }
}

/// 按 (score, member) 排序，与 Redis 的排名一致
fn ranked(set: &HashMap<String, f64>) -> Vec<(String, f64)> {
    let mut members: Vec<(String, f64)> = set.iter().map(|(m, s)| (m.clone(), *s)).collect();
    members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    members
}

/// 把 Redis 风格的闭区间下标（支持负数）转换成实际下标
fn index_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start >= len || start > stop {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

impl Keyspace {
    fn touch(&mut self, key: &str) {
        self.clock += 1;
        if let Some(version) = self.versions.get_mut(key) {
            *version = self.clock;
        }
    }

    fn watch(&mut self, key: &str) -> u64 {
        self.evict_expired(key);
        *self.watchers.entry(key.to_string()).or_insert(0) += 1;
        let clock = self.clock;
        *self.versions.entry(key.to_string()).or_insert(clock)
    }

    fn unwatch(&mut self, key: &str) {
        let Some(count) = self.watchers.get_mut(key) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.watchers.remove(key);
            self.versions.remove(key);
        }
    }

    fn evict_expired(&mut self, key: &str) {
        let expired = matches!(
            self.entries.get(key),
            Some(Entry { expires_at: Some(at), .. }) if *at <= Instant::now()
        );
        if expired {
            self.entries.remove(key);
            self.touch(key);
        }
    }

    fn version(&mut self, key: &str) -> u64 {
        self.evict_expired(key);
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn entry(&mut self, key: &str) -> Option<&mut Entry> {
        self.evict_expired(key);
        self.entries.get_mut(key)
    }

    fn sorted(&mut self, key: &str) -> Result<Option<&mut HashMap<String, f64>>, StoreError> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry { value: Value::Sorted(set), .. }) => Ok(Some(set)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn sorted_or_create(&mut self, key: &str) -> Result<&mut HashMap<String, f64>, StoreError> {
        self.evict_expired(key);
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Sorted(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Sorted(set) => Ok(set),
            _ => Err(wrong_type(key)),
        }
    }

    fn list(&mut self, key: &str) -> Result<Option<&mut VecDeque<String>>, StoreError> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry { value: Value::List(list), .. }) => Ok(Some(list)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn list_or_create(&mut self, key: &str) -> Result<&mut VecDeque<String>, StoreError> {
        self.evict_expired(key);
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(VecDeque::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::List(list) => Ok(list),
            _ => Err(wrong_type(key)),
        }
    }

    /// 空集合和空列表会被删除
    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.entries.get(key).map(|e| &e.value) {
            Some(Value::Sorted(set)) => set.is_empty(),
            Some(Value::List(list)) => list.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }

    /// 修改型命令结束后的收尾：有改动则更新版本号
    fn modified(&mut self, key: &str, changed: bool) {
        self.drop_if_empty(key);
        if changed {
            self.touch(key);
        }
    }

    fn apply(&mut self, cmd: &Command) -> Result<Reply, StoreError> {
        match cmd {
            Command::Get { key } => match self.entry(key) {
                None => Ok(Reply::Nil),
                Some(Entry { value: Value::Text(s), .. }) => Ok(Reply::Text(s.clone())),
                Some(_) => Err(wrong_type(key)),
            },
            Command::SetNx { key, value, ttl } => {
                if self.entry(key).is_some() {
                    return Ok(Reply::Nil);
                }
                self.entries.insert(
                    key.clone(),
                    Entry {
                        value: Value::Text(value.clone()),
                        expires_at: ttl.map(|d| Instant::now() + d),
                    },
                );
                self.touch(key);
                Ok(Reply::Ok)
            }
            Command::Del { key } => {
                let removed = self.entry(key).is_some();
                if removed {
                    self.entries.remove(key);
                    self.touch(key);
                }
                Ok(Reply::Int(removed as i64))
            }
            Command::Expire { key, ttl } => {
                let Some(entry) = self.entry(key) else {
                    return Ok(Reply::Int(0));
                };
                if ttl.is_zero() {
                    self.entries.remove(key);
                } else {
                    entry.expires_at = Some(Instant::now() + *ttl);
                }
                self.touch(key);
                Ok(Reply::Int(1))
            }
            Command::Ttl { key } => {
                let ms = match self.entry(key) {
                    None => -2,
                    Some(Entry { expires_at: None, .. }) => -1,
                    Some(Entry { expires_at: Some(at), .. }) => {
                        at.saturating_duration_since(Instant::now()).as_millis() as i64
                    }
                };
                Ok(Reply::Int(ms))
            }
            Command::Incr { key, by } => {
                let next = match self.entry(key) {
                    None => {
                        self.entries.insert(
                            key.clone(),
                            Entry {
                                value: Value::Text(by.to_string()),
                                expires_at: None,
                            },
                        );
                        *by
                    }
                    Some(Entry { value: Value::Text(s), .. }) => {
                        let current: i64 = s
                            .parse()
                            .map_err(|_| StoreError::NotAnInteger { key: key.clone() })?;
                        let next = current
                            .checked_add(*by)
                            .ok_or_else(|| StoreError::NotAnInteger { key: key.clone() })?;
                        *s = next.to_string();
                        next
                    }
                    Some(_) => return Err(wrong_type(key)),
                };
                self.touch(key);
                Ok(Reply::Int(next))
            }

            Command::ZAdd { key, member, score } => {
                let added = self.sorted_or_create(key)?.insert(member.clone(), *score).is_none();
                self.touch(key);
                Ok(Reply::Int(added as i64))
            }
            Command::ZRem { key, member } => {
                let removed = match self.sorted(key)? {
                    Some(set) => set.remove(member).is_some(),
                    None => false,
                };
                self.modified(key, removed);
                Ok(Reply::Int(removed as i64))
            }
            Command::ZRemRangeByScore { key, min, max } => {
                let removed = match self.sorted(key)? {
                    Some(set) => {
                        let before = set.len();
                        set.retain(|_, s| *s < *min || *s > *max);
                        before - set.len()
                    }
                    None => 0,
                };
                self.modified(key, removed > 0);
                Ok(Reply::Int(removed as i64))
            }
            Command::ZRemRangeByRank { key, start, stop } => {
                let removed = match self.sorted(key)? {
                    Some(set) => {
                        let members = ranked(set);
                        match index_range(members.len(), *start, *stop) {
                            Some((from, to)) => {
                                for (member, _) in &members[from..=to] {
                                    set.remove(member);
                                }
                                to - from + 1
                            }
                            None => 0,
                        }
                    }
                    None => 0,
                };
                self.modified(key, removed > 0);
                Ok(Reply::Int(removed as i64))
            }
            Command::ZCard { key } => {
                let len = self.sorted(key)?.map_or(0, |set| set.len());
                Ok(Reply::Int(len as i64))
            }
            Command::ZRank { key, member } => {
                let rank = self
                    .sorted(key)?
                    .and_then(|set| ranked(set).iter().position(|(m, _)| m == member));
                Ok(rank.map_or(Reply::Nil, |r| Reply::Int(r as i64)))
            }
            Command::ZScore { key, member } => {
                let score = self.sorted(key)?.and_then(|set| set.get(member).copied());
                Ok(score.map_or(Reply::Nil, Reply::Float))
            }
            Command::ZRange { key, start, stop } => {
                let members = self.sorted(key)?.map(|set| ranked(set)).unwrap_or_default();
                let slice = match index_range(members.len(), *start, *stop) {
                    Some((from, to)) => members[from..=to].to_vec(),
                    None => Vec::new(),
                };
                Ok(Reply::Scored(slice))
            }
            Command::ZRangeByScore { key, min, max } => {
                let members = self.sorted(key)?.map(|set| ranked(set)).unwrap_or_default();
                Ok(Reply::Scored(
                    members
                        .into_iter()
                        .filter(|(_, s)| *s >= *min && *s <= *max)
                        .collect(),
                ))
            }
            Command::ZIncrBy { key, member, by } => {
                let set = self.sorted_or_create(key)?;
                let score = set.entry(member.clone()).or_insert(0.0);
                *score += *by;
                let score = *score;
                self.touch(key);
                Ok(Reply::Float(score))
            }
            Command::ZStore {
                op,
                dest,
                sources,
                aggregate,
                ttl,
            } => {
                let mut inputs = Vec::with_capacity(sources.len());
                for (key, weight) in sources {
                    let set = self.sorted(key)?.cloned().unwrap_or_default();
                    inputs.push((set, *weight));
                }
                let combined = combine(*op, *aggregate, &inputs);
                let len = combined.len();
                self.evict_expired(dest);
                if combined.is_empty() {
                    self.entries.remove(dest);
                } else {
                    self.entries.insert(
                        dest.clone(),
                        Entry {
                            value: Value::Sorted(combined),
                            expires_at: ttl.map(|d| Instant::now() + d),
                        },
                    );
                }
                self.touch(dest);
                Ok(Reply::Int(len as i64))
            }

            Command::LPush { key, value } => {
                let list = self.list_or_create(key)?;
                list.push_front(value.clone());
                let len = list.len();
                self.touch(key);
                Ok(Reply::Int(len as i64))
            }
            Command::RPush { key, value } => {
                let list = self.list_or_create(key)?;
                list.push_back(value.clone());
                let len = list.len();
                self.touch(key);
                Ok(Reply::Int(len as i64))
            }
            Command::LPop { key } | Command::RPop { key } => {
                let front = matches!(cmd, Command::LPop { .. });
                let popped = match self.list(key)? {
                    Some(list) if front => list.pop_front(),
                    Some(list) => list.pop_back(),
                    None => None,
                };
                self.modified(key, popped.is_some());
                Ok(popped.map_or(Reply::Nil, Reply::Text))
            }
            Command::LLen { key } => {
                let len = self.list(key)?.map_or(0, |list| list.len());
                Ok(Reply::Int(len as i64))
            }
            Command::LTrim { key, start, stop } => {
                let changed = match self.list(key)? {
                    Some(list) => {
                        let before = list.len();
                        match index_range(before, *start, *stop) {
                            Some((from, to)) => {
                                list.truncate(to + 1);
                                list.drain(..from);
                            }
                            None => list.clear(),
                        }
                        list.len() != before
                    }
                    None => false,
                };
                self.modified(key, changed);
                Ok(Reply::Ok)
            }
            Command::LRem { key, count, value } => {
                let removed = match self.list(key)? {
                    Some(list) => remove_values(list, *count, value),
                    None => 0,
                };
                self.modified(key, removed > 0);
                Ok(Reply::Int(removed as i64))
            }
            Command::LRange { key, start, stop } => {
                let items = match self.list(key)? {
                    Some(list) => match index_range(list.len(), *start, *stop) {
                        Some((from, to)) => list.range(from..=to).cloned().collect(),
                        None => Vec::new(),
                    },
                    None => Vec::new(),
                };
                Ok(Reply::List(items))
            }
        }
    }
}

fn combine(op: SetOp, aggregate: Aggregate, inputs: &[(HashMap<String, f64>, f64)]) -> HashMap<String, f64> {
    let mut combined: HashMap<String, f64> = HashMap::new();
    let mut seen: HashMap<String, usize> = HashMap::new();
    for (set, weight) in inputs {
        for (member, score) in set {
            let weighted = score * weight;
            *seen.entry(member.clone()).or_insert(0) += 1;
            combined
                .entry(member.clone())
                .and_modify(|acc| {
                    *acc = match aggregate {
                        Aggregate::Sum => *acc + weighted,
                        Aggregate::Min => acc.min(weighted),
                        Aggregate::Max => acc.max(weighted),
                    }
                })
                .or_insert(weighted);
        }
    }
    if op == SetOp::Inter {
        combined.retain(|member, _| seen.get(member) == Some(&inputs.len()));
    }
    combined
}

/// LREM 语义：count > 0 从头删除，count < 0 从尾删除，0 删除全部
fn remove_values(list: &mut VecDeque<String>, count: isize, value: &str) -> usize {
    let limit = if count == 0 { usize::MAX } else { count.unsigned_abs() };
    let mut removed = 0;
    if count >= 0 {
        let mut i = 0;
        while i < list.len() && removed < limit {
            if list[i] == value {
                list.remove(i);
                removed += 1;
            } else {
                i += 1;
            }
        }
    } else {
        let mut i = list.len();
        while i > 0 && removed < limit {
            i -= 1;
            if list[i] == value {
                list.remove(i);
                removed += 1;
            }
        }
    }
    removed
}

#[derive(Default)]
struct Shared {
    keyspace: Mutex<Keyspace>,
    waiters: DashMap<String, Arc<Notify>>,
}

impl Shared {
    /// 检查 watch 的版本号，全部未变时原子执行批次
    fn commit(&self, watched: &[(String, u64)], batch: &[Command]) -> Result<Option<Vec<Reply>>, StoreError> {
        let mut keyspace = self.keyspace.lock();
        let intact = watched.iter().all(|(key, version)| keyspace.version(key) == *version);
        for (key, _) in watched {
            keyspace.unwatch(key);
        }
        if !intact {
            return Ok(None);
        }
        let replies = batch
            .iter()
            .map(|cmd| keyspace.apply(cmd))
            .collect::<Result<Vec<_>, _>>();
        drop(keyspace);

        for key in batch.iter().filter_map(Command::pushed_key) {
            if let Some(notify) = self.waiters.get(key) {
                notify.notify_waiters();
            }
        }
        replies.map(Some)
    }

    fn run(&self, batch: &[Command]) -> Result<Vec<Reply>, StoreError> {
        Ok(self.commit(&[], batch)?.unwrap_or_default())
    }

    fn release(&self, watched: &[(String, u64)]) {
        let mut keyspace = self.keyspace.lock();
        for (key, _) in watched {
            keyspace.unwatch(key);
        }
    }
}

/// 阻塞弹出期间持有的唤醒句柄，最后一个等待者离开时从表中移除
struct Waiter<'a> {
    shared: &'a Shared,
    key: &'a str,
    notify: Arc<Notify>,
}

impl<'a> Waiter<'a> {
    fn new(shared: &'a Shared, key: &'a str) -> Self {
        let notify = shared.waiters.entry(key.to_string()).or_default().clone();
        Self { shared, key, notify }
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        // 表里一份加上自己一份
        self.shared
            .waiters
            .remove_if(self.key, |_, notify| Arc::strong_count(notify) == 2);
    }
}

/// 进程内存储
///
/// 语义与 Redis 后端一致，适用于测试和单节点部署。
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 仍在记录版本号的 key 数量
    #[cfg(test)]
    pub(crate) fn tracked_versions(&self) -> usize {
        self.shared.keyspace.lock().versions.len()
    }
}

struct MemoryTransaction {
    shared: Arc<Shared>,
    watched: Vec<(String, u64)>,
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn query(&mut self, cmd: Command) -> Result<Reply, StoreError> {
        self.shared.keyspace.lock().apply(&cmd)
    }

    async fn commit(&mut self, batch: Batch) -> Result<Option<Vec<Reply>>, StoreError> {
        let watched = std::mem::take(&mut self.watched);
        self.shared.commit(&watched, &batch)
    }

    async fn unwatch(&mut self) -> Result<(), StoreError> {
        let watched = std::mem::take(&mut self.watched);
        self.shared.release(&watched);
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.watched.is_empty() {
            self.shared.release(&self.watched);
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn execute(&self, cmd: Command) -> Result<Reply, StoreError> {
        let mut replies = self.shared.run(std::slice::from_ref(&cmd))?;
        Ok(replies.pop().unwrap_or(Reply::Nil))
    }

    async fn exec(&self, batch: Batch) -> Result<Vec<Reply>, StoreError> {
        self.shared.run(&batch)
    }

    async fn watch(&self, keys: &[String]) -> Result<Box<dyn Transaction>, StoreError> {
        let mut keyspace = self.shared.keyspace.lock();
        let watched = keys
            .iter()
            .map(|key| (key.clone(), keyspace.watch(key)))
            .collect();
        Ok(Box::new(MemoryTransaction {
            shared: self.shared.clone(),
            watched,
        }))
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        let deadline = Instant::now() + timeout;
        let waiter = Waiter::new(&self.shared, key);
        loop {
            // 先注册唤醒再检查列表，避免错过检查与等待之间的 push
            let notified = waiter.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let popped = self
                .execute(Command::LPop { key: key.to_string() })
                .await?
                .into_opt_text("LPOP")?;
            if popped.is_some() {
                return Ok(popped);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }
}
