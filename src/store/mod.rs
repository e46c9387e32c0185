pub mod memory;
pub mod redis;

use crate::error::StoreError;
use async_trait::async_trait;
use std::time::Duration;

/// 一组在 MULTI/EXEC 中原子执行的命令
pub type Batch = Vec<Command>;

/// 有序集合聚合存储的集合运算
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    Inter,
    Union,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Sum,
    Min,
    Max,
}

/// 存储支持的原子命令
///
/// 每个变体对应外部键值存储的一条命令，两个后端保证相同的语义。
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Get { key: String },
    /// 仅当 key 不存在时写入，可附带过期时间
    SetNx { key: String, value: String, ttl: Option<Duration> },
    Del { key: String },
    Expire { key: String, ttl: Duration },
    Ttl { key: String },
    Incr { key: String, by: i64 },

    ZAdd { key: String, member: String, score: f64 },
    ZRem { key: String, member: String },
    ZRemRangeByScore { key: String, min: f64, max: f64 },
    ZRemRangeByRank { key: String, start: isize, stop: isize },
    ZCard { key: String },
    ZRank { key: String, member: String },
    ZScore { key: String, member: String },
    ZRange { key: String, start: isize, stop: isize },
    ZRangeByScore { key: String, min: f64, max: f64 },
    ZIncrBy { key: String, member: String, by: f64 },
    /// ZINTERSTORE / ZUNIONSTORE，`sources` 为 (key, weight)
    ZStore {
        op: SetOp,
        dest: String,
        sources: Vec<(String, f64)>,
        aggregate: Aggregate,
        ttl: Option<Duration>,
    },

    LPush { key: String, value: String },
    RPush { key: String, value: String },
    LPop { key: String },
    RPop { key: String },
    LLen { key: String },
    LTrim { key: String, start: isize, stop: isize },
    LRem { key: String, count: isize, value: String },
    LRange { key: String, start: isize, stop: isize },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "GET",
            Command::SetNx { .. } => "SET NX",
            Command::Del { .. } => "DEL",
            Command::Expire { .. } => "PEXPIRE",
            Command::Ttl { .. } => "PTTL",
            Command::Incr { .. } => "INCRBY",
            Command::ZAdd { .. } => "ZADD",
            Command::ZRem { .. } => "ZREM",
            Command::ZRemRangeByScore { .. } => "ZREMRANGEBYSCORE",
            Command::ZRemRangeByRank { .. } => "ZREMRANGEBYRANK",
            Command::ZCard { .. } => "ZCARD",
            Command::ZRank { .. } => "ZRANK",
            Command::ZScore { .. } => "ZSCORE",
            Command::ZRange { .. } => "ZRANGE",
            Command::ZRangeByScore { .. } => "ZRANGEBYSCORE",
            Command::ZIncrBy { .. } => "ZINCRBY",
            Command::ZStore { op: SetOp::Inter, .. } => "ZINTERSTORE",
            Command::ZStore { op: SetOp::Union, .. } => "ZUNIONSTORE",
            Command::LPush { .. } => "LPUSH",
            Command::RPush { .. } => "RPUSH",
            Command::LPop { .. } => "LPOP",
            Command::RPop { .. } => "RPOP",
            Command::LLen { .. } => "LLEN",
            Command::LTrim { .. } => "LTRIM",
            Command::LRem { .. } => "LREM",
            Command::LRange { .. } => "LRANGE",
        }
    }

    /// 写入列表的命令返回被写入的 key，用于唤醒阻塞的消费者
    pub fn pushed_key(&self) -> Option<&str> {
        match self {
            Command::LPush { key, .. } | Command::RPush { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// 命令的返回值
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Ok,
    Int(i64),
    Float(f64),
    Text(String),
    /// 带分数的有序集合成员，按排名排列
    Scored(Vec<(String, f64)>),
    List(Vec<String>),
}

impl Reply {
    fn unexpected(self, command: &'static str) -> StoreError {
        StoreError::UnexpectedReply {
            command,
            detail: format!("{:?}", self),
        }
    }

    /// 整数回复视为计数，`OK` 视为成功，`Nil` 视为失败
    pub fn into_bool(self, command: &'static str) -> Result<bool, StoreError> {
        match self {
            Reply::Int(n) => Ok(n > 0),
            Reply::Ok => Ok(true),
            Reply::Nil => Ok(false),
            other => Err(other.unexpected(command)),
        }
    }

    pub fn into_int(self, command: &'static str) -> Result<i64, StoreError> {
        match self {
            Reply::Int(n) => Ok(n),
            other => Err(other.unexpected(command)),
        }
    }

    pub fn into_opt_int(self, command: &'static str) -> Result<Option<i64>, StoreError> {
        match self {
            Reply::Int(n) => Ok(Some(n)),
            Reply::Nil => Ok(None),
            other => Err(other.unexpected(command)),
        }
    }

    pub fn into_opt_float(self, command: &'static str) -> Result<Option<f64>, StoreError> {
        match self {
            Reply::Float(f) => Ok(Some(f)),
            Reply::Nil => Ok(None),
            other => Err(other.unexpected(command)),
        }
    }

    pub fn into_opt_text(self, command: &'static str) -> Result<Option<String>, StoreError> {
        match self {
            Reply::Text(s) => Ok(Some(s)),
            Reply::Nil => Ok(None),
            other => Err(other.unexpected(command)),
        }
    }

    pub fn into_scored(self, command: &'static str) -> Result<Vec<(String, f64)>, StoreError> {
        match self {
            Reply::Scored(v) => Ok(v),
            other => Err(other.unexpected(command)),
        }
    }

    pub fn into_list(self, command: &'static str) -> Result<Vec<String>, StoreError> {
        match self {
            Reply::List(v) => Ok(v),
            other => Err(other.unexpected(command)),
        }
    }
}

/// key 的剩余存活时间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    /// key 存在但没有过期时间
    Persistent,
    Expires(Duration),
}

impl KeyTtl {
    /// 按 PTTL 的约定解析：-2 不存在，-1 无过期时间
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            -2 => KeyTtl::Missing,
            n if n < 0 => KeyTtl::Persistent,
            n => KeyTtl::Expires(Duration::from_millis(n as u64)),
        }
    }
}

/// 乐观事务会话
///
/// 会话开始时 watch 的 key 若在 `commit` 之前被任何客户端修改（包括过期），
/// 整个批次都不会生效。
#[async_trait]
pub trait Transaction: Send {
    /// 在 watch 状态下读取
    async fn query(&mut self, cmd: Command) -> Result<Reply, StoreError>;

    /// 提交批次；被打断时返回 `None`
    async fn commit(&mut self, batch: Batch) -> Result<Option<Vec<Reply>>, StoreError>;

    /// 放弃会话，不写入任何内容
    async fn unwatch(&mut self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait Store: Send + Sync {
    /// 执行单条原子命令
    async fn execute(&self, cmd: Command) -> Result<Reply, StoreError>;

    /// 原子执行一个批次（MULTI/EXEC，不带 watch）
    async fn exec(&self, batch: Batch) -> Result<Vec<Reply>, StoreError>;

    /// 开始一个 watch 指定 key 的乐观事务
    async fn watch(&self, keys: &[String]) -> Result<Box<dyn Transaction>, StoreError>;

    /// 阻塞式左侧弹出，超时返回 `None`；超时为零时不阻塞
    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.execute(Command::Get { key: key.to_string() })
            .await?
            .into_opt_text("GET")
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool, StoreError> {
        self.execute(Command::SetNx {
            key: key.to_string(),
            value: value.to_string(),
            ttl,
        })
        .await?
        .into_bool("SET NX")
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        self.execute(Command::Del { key: key.to_string() })
            .await?
            .into_bool("DEL")
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.execute(Command::Expire { key: key.to_string(), ttl })
            .await?
            .into_bool("PEXPIRE")
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        let ms = self
            .execute(Command::Ttl { key: key.to_string() })
            .await?
            .into_int("PTTL")?;
        Ok(KeyTtl::from_millis(ms))
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64, StoreError> {
        self.execute(Command::Incr { key: key.to_string(), by })
            .await?
            .into_int("INCRBY")
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<bool, StoreError> {
        self.execute(Command::ZAdd {
            key: key.to_string(),
            member: member.to_string(),
            score,
        })
        .await?
        .into_bool("ZADD")
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.execute(Command::ZRem {
            key: key.to_string(),
            member: member.to_string(),
        })
        .await?
        .into_bool("ZREM")
    }

    async fn zrank(&self, key: &str, member: &str) -> Result<Option<i64>, StoreError> {
        self.execute(Command::ZRank {
            key: key.to_string(),
            member: member.to_string(),
        })
        .await?
        .into_opt_int("ZRANK")
    }

    async fn zcard(&self, key: &str) -> Result<i64, StoreError> {
        self.execute(Command::ZCard { key: key.to_string() })
            .await?
            .into_int("ZCARD")
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<(String, f64)>, StoreError> {
        self.execute(Command::ZRange {
            key: key.to_string(),
            start,
            stop,
        })
        .await?
        .into_scored("ZRANGE")
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<i64, StoreError> {
        self.execute(Command::RPush {
            key: key.to_string(),
            value: value.to_string(),
        })
        .await?
        .into_int("RPUSH")
    }

    async fn llen(&self, key: &str) -> Result<i64, StoreError> {
        self.execute(Command::LLen { key: key.to_string() })
            .await?
            .into_int("LLEN")
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError> {
        self.execute(Command::LRange {
            key: key.to_string(),
            start,
            stop,
        })
        .await?
        .into_list("LRANGE")
    }
}
