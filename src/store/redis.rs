use crate::error::StoreError;
use crate::store::{Aggregate, Batch, Command, Reply, SetOp, Store, Transaction};
use anyhow::Result;
use async_trait::async_trait;
use redis::aio::{Connection, ConnectionManager};
use redis::{FromRedisValue, Pipeline, Value};
use std::str::FromStr;
use std::time::Duration;

/// Redis 后端
///
/// 普通命令和批次走共享的 `ConnectionManager`；WATCH 和阻塞弹出的状态绑定在连接上，
/// 因此每个乐观事务和每次阻塞弹出都使用独立连接。
pub struct RedisStore {
    client: redis::Client,
    manager: ConnectionManager,
}

impl RedisStore {
    pub async fn new(
        redis_url: &str,
        username: Option<String>,
        password: Option<String>,
        db: Option<i64>,
    ) -> Result<Self> {
        // 构建连接信息
        let mut connection_info = redis::ConnectionInfo::from_str(redis_url)?;

        // 设置认证信息
        if let Some(pwd) = password {
            connection_info.redis.password = Some(pwd);
        }
        if let Some(user) = username {
            connection_info.redis.username = Some(user);
        }
        if let Some(database) = db {
            connection_info.redis.db = database;
        }

        let client = redis::Client::open(connection_info)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, manager })
    }
}

fn score_arg(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

/// Redis 的 PX/PEXPIRE 不接受 0
fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// 命令是否会展开成多条 redis 命令
fn expands(cmd: &Command) -> bool {
    matches!(cmd, Command::ZStore { ttl: Some(_), .. })
}

fn add_command(pipe: &mut Pipeline, cmd: &Command) {
    match cmd {
        Command::Get { key } => {
            pipe.cmd("GET").arg(key);
        }
        Command::SetNx { key, value, ttl } => {
            pipe.cmd("SET").arg(key).arg(value).arg("NX");
            if let Some(ttl) = ttl {
                pipe.arg("PX").arg(millis(*ttl));
            }
        }
        Command::Del { key } => {
            pipe.cmd("DEL").arg(key);
        }
        Command::Expire { key, ttl } => {
            pipe.cmd("PEXPIRE").arg(key).arg(millis(*ttl));
        }
        Command::Ttl { key } => {
            pipe.cmd("PTTL").arg(key);
        }
        Command::Incr { key, by } => {
            pipe.cmd("INCRBY").arg(key).arg(*by);
        }
        Command::ZAdd { key, member, score } => {
            pipe.cmd("ZADD").arg(key).arg(score_arg(*score)).arg(member);
        }
        Command::ZRem { key, member } => {
            pipe.cmd("ZREM").arg(key).arg(member);
        }
        Command::ZRemRangeByScore { key, min, max } => {
            pipe.cmd("ZREMRANGEBYSCORE")
                .arg(key)
                .arg(score_arg(*min))
                .arg(score_arg(*max));
        }
        Command::ZRemRangeByRank { key, start, stop } => {
            pipe.cmd("ZREMRANGEBYRANK").arg(key).arg(*start).arg(*stop);
        }
        Command::ZCard { key } => {
            pipe.cmd("ZCARD").arg(key);
        }
        Command::ZRank { key, member } => {
            pipe.cmd("ZRANK").arg(key).arg(member);
        }
        Command::ZScore { key, member } => {
            pipe.cmd("ZSCORE").arg(key).arg(member);
        }
        Command::ZRange { key, start, stop } => {
            pipe.cmd("ZRANGE")
                .arg(key)
                .arg(*start)
                .arg(*stop)
                .arg("WITHSCORES");
        }
        Command::ZRangeByScore { key, min, max } => {
            pipe.cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg(score_arg(*min))
                .arg(score_arg(*max))
                .arg("WITHSCORES");
        }
        Command::ZIncrBy { key, member, by } => {
            pipe.cmd("ZINCRBY").arg(key).arg(score_arg(*by)).arg(member);
        }
        Command::ZStore {
            op,
            dest,
            sources,
            aggregate,
            ttl,
        } => {
            let name = match op {
                SetOp::Inter => "ZINTERSTORE",
                SetOp::Union => "ZUNIONSTORE",
            };
            pipe.cmd(name).arg(dest).arg(sources.len());
            for (key, _) in sources {
                pipe.arg(key);
            }
            pipe.arg("WEIGHTS");
            for (_, weight) in sources {
                pipe.arg(score_arg(*weight));
            }
            pipe.arg("AGGREGATE").arg(match aggregate {
                Aggregate::Sum => "SUM",
                Aggregate::Min => "MIN",
                Aggregate::Max => "MAX",
            });
            if let Some(ttl) = ttl {
                pipe.cmd("PEXPIRE").arg(dest).arg(millis(*ttl)).ignore();
            }
        }
        Command::LPush { key, value } => {
            pipe.cmd("LPUSH").arg(key).arg(value);
        }
        Command::RPush { key, value } => {
            pipe.cmd("RPUSH").arg(key).arg(value);
        }
        Command::LPop { key } => {
            pipe.cmd("LPOP").arg(key);
        }
        Command::RPop { key } => {
            pipe.cmd("RPOP").arg(key);
        }
        Command::LLen { key } => {
            pipe.cmd("LLEN").arg(key);
        }
        Command::LTrim { key, start, stop } => {
            pipe.cmd("LTRIM").arg(key).arg(*start).arg(*stop);
        }
        Command::LRem { key, count, value } => {
            pipe.cmd("LREM").arg(key).arg(*count).arg(value);
        }
        Command::LRange { key, start, stop } => {
            pipe.cmd("LRANGE").arg(key).arg(*start).arg(*stop);
        }
    }
}

/// 回复类型与命令不符时报告命令名，而不是当作连接错误
fn convert<T: FromRedisValue>(cmd: &Command, value: &Value) -> Result<T, StoreError> {
    redis::from_redis_value(value).map_err(|e| StoreError::UnexpectedReply {
        command: cmd.name(),
        detail: e.to_string(),
    })
}

fn decode(cmd: &Command, value: Value) -> Result<Reply, StoreError> {
    let reply = match cmd {
        Command::Get { .. } | Command::LPop { .. } | Command::RPop { .. } => {
            match convert::<Option<String>>(cmd, &value)? {
                Some(text) => Reply::Text(text),
                None => Reply::Nil,
            }
        }
        Command::SetNx { .. } => match value {
            Value::Nil => Reply::Nil,
            _ => Reply::Ok,
        },
        Command::LTrim { .. } => Reply::Ok,
        Command::ZRank { .. } => match convert::<Option<i64>>(cmd, &value)? {
            Some(rank) => Reply::Int(rank),
            None => Reply::Nil,
        },
        Command::ZScore { .. } | Command::ZIncrBy { .. } => {
            match convert::<Option<f64>>(cmd, &value)? {
                Some(score) => Reply::Float(score),
                None => Reply::Nil,
            }
        }
        Command::ZRange { .. } | Command::ZRangeByScore { .. } => {
            Reply::Scored(convert::<Vec<(String, f64)>>(cmd, &value)?)
        }
        Command::LRange { .. } => Reply::List(convert::<Vec<String>>(cmd, &value)?),
        _ => Reply::Int(convert::<i64>(cmd, &value)?),
    };
    Ok(reply)
}

fn decode_all(batch: &[Command], values: Vec<Value>) -> Result<Vec<Reply>, StoreError> {
    if values.len() != batch.len() {
        return Err(StoreError::UnexpectedReply {
            command: "EXEC",
            detail: format!("{} replies for {} commands", values.len(), batch.len()),
        });
    }
    batch
        .iter()
        .zip(values)
        .map(|(cmd, value)| decode(cmd, value))
        .collect()
}

fn pipeline(batch: &[Command]) -> Pipeline {
    let mut pipe = redis::pipe();
    for cmd in batch {
        add_command(&mut pipe, cmd);
    }
    pipe
}

struct RedisTransaction {
    conn: Connection,
}

#[async_trait]
impl Transaction for RedisTransaction {
    async fn query(&mut self, cmd: Command) -> Result<Reply, StoreError> {
        let batch = [cmd];
        let values: Vec<Value> = pipeline(&batch).query_async(&mut self.conn).await?;
        Ok(decode_all(&batch, values)?.remove(0))
    }

    async fn commit(&mut self, batch: Batch) -> Result<Option<Vec<Reply>>, StoreError> {
        let mut pipe = pipeline(&batch);
        pipe.atomic();
        // EXEC 返回 nil 表示 watch 的 key 被修改，事务被丢弃
        let values: Option<Vec<Value>> = pipe.query_async(&mut self.conn).await?;
        match values {
            Some(values) => Ok(Some(decode_all(&batch, values)?)),
            None => Ok(None),
        }
    }

    async fn unwatch(&mut self) -> Result<(), StoreError> {
        let _: () = redis::cmd("UNWATCH").query_async(&mut self.conn).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn execute(&self, cmd: Command) -> Result<Reply, StoreError> {
        let batch = [cmd];
        let mut pipe = pipeline(&batch);
        if expands(&batch[0]) {
            pipe.atomic();
        }
        let mut conn = self.manager.clone();
        let values: Vec<Value> = pipe.query_async(&mut conn).await?;
        Ok(decode_all(&batch, values)?.remove(0))
    }

    async fn exec(&self, batch: Batch) -> Result<Vec<Reply>, StoreError> {
        let mut pipe = pipeline(&batch);
        pipe.atomic();
        let mut conn = self.manager.clone();
        let values: Vec<Value> = pipe.query_async(&mut conn).await?;
        decode_all(&batch, values)
    }

    async fn watch(&self, keys: &[String]) -> Result<Box<dyn Transaction>, StoreError> {
        let mut conn = self.client.get_async_connection().await?;
        let _: () = redis::cmd("WATCH").arg(keys).query_async(&mut conn).await?;
        Ok(Box::new(RedisTransaction { conn }))
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        if timeout.is_zero() {
            return self
                .execute(Command::LPop { key: key.to_string() })
                .await?
                .into_opt_text("LPOP");
        }
        // BLPOP 会阻塞整个连接，不能放在共享连接上
        let mut conn = self.client.get_async_connection().await?;
        let popped: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(key)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;
        Ok(popped.map(|(_, value)| value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_arg_infinity() {
        assert_eq!(score_arg(f64::NEG_INFINITY), "-inf");
        assert_eq!(score_arg(f64::INFINITY), "+inf");
        assert_eq!(score_arg(1.5), "1.5");
    }

    #[test]
    fn test_millis_never_zero() {
        assert_eq!(millis(Duration::ZERO), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
    }

    #[test]
    fn test_decode_replies() {
        let get = Command::Get { key: "k".to_string() };
        assert_eq!(decode(&get, Value::Nil).unwrap(), Reply::Nil);
        assert_eq!(
            decode(&get, Value::Data(b"v".to_vec())).unwrap(),
            Reply::Text("v".to_string())
        );

        let set_nx = Command::SetNx {
            key: "k".to_string(),
            value: "v".to_string(),
            ttl: None,
        };
        assert_eq!(decode(&set_nx, Value::Okay).unwrap(), Reply::Ok);
        assert_eq!(decode(&set_nx, Value::Nil).unwrap(), Reply::Nil);

        let range = Command::ZRange {
            key: "z".to_string(),
            start: 0,
            stop: -1,
        };
        let value = Value::Bulk(vec![Value::Data(b"a".to_vec()), Value::Data(b"1.5".to_vec())]);
        assert_eq!(
            decode(&range, value).unwrap(),
            Reply::Scored(vec![("a".to_string(), 1.5)])
        );
    }

    #[test]
    fn test_decode_reports_command_on_type_mismatch() {
        let card = Command::ZCard { key: "z".to_string() };
        let err = decode(&card, Value::Data(b"not-a-number".to_vec())).unwrap_err();
        assert!(matches!(err, StoreError::UnexpectedReply { command: "ZCARD", .. }));
    }

    #[test]
    fn test_zstore_with_ttl_expands_to_one_reply() {
        let cmd = Command::ZStore {
            op: SetOp::Union,
            dest: "dest".to_string(),
            sources: vec![("a".to_string(), 1.0), ("b".to_string(), 2.0)],
            aggregate: Aggregate::Max,
            ttl: Some(Duration::from_secs(30)),
        };
        assert!(expands(&cmd));

        let batch = vec![cmd];
        let mut pipe = pipeline(&batch);
        pipe.atomic();
        let packed = String::from_utf8(pipe.get_packed_pipeline()).unwrap();
        assert!(packed.contains("ZUNIONSTORE"));
        assert!(packed.contains("AGGREGATE"));
        assert!(packed.contains("MAX"));
        assert!(packed.contains("PEXPIRE"));
        assert!(packed.contains("30000"));

        // PEXPIRE 的回复被忽略，EXEC 结果只剩 ZUNIONSTORE 一项
        let replies = decode_all(&batch, vec![Value::Int(3)]).unwrap();
        assert_eq!(replies, vec![Reply::Int(3)]);
    }

    #[test]
    fn test_zstore_without_ttl_is_single_command() {
        let cmd = Command::ZStore {
            op: SetOp::Inter,
            dest: "dest".to_string(),
            sources: vec![("a".to_string(), 1.0)],
            aggregate: Aggregate::Sum,
            ttl: None,
        };
        assert!(!expands(&cmd));
        let packed = String::from_utf8(pipeline(std::slice::from_ref(&cmd)).get_packed_pipeline()).unwrap();
        assert!(packed.contains("ZINTERSTORE"));
        assert!(!packed.contains("PEXPIRE"));
    }

    #[test]
    fn test_decode_all_rejects_short_reply() {
        let batch = vec![Command::Del { key: "a".to_string() }, Command::Del { key: "b".to_string() }];
        let err = decode_all(&batch, vec![Value::Int(1)]).unwrap_err();
        assert!(matches!(err, StoreError::UnexpectedReply { .. }));
    }
}
