//! Redis adapter.
//!
//! One `ConnectionManager` backs the user directory store, the per-discipline
//! message ledger and the delete-task queue.

use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, RedisError};
use tracing::{debug, info};

use pigeon_core::{
    domain::{ChatId, MessageId},
    errors::Error,
    ports::{DeleteTask, DeleteTaskSink, DirectoryStore, MessageLedger, StoreWrite},
    Result,
};

const DELETE_TASKS_KEY: &str = "delete_tasks";

fn storage_err(context: &str, e: RedisError) -> Error {
    Error::Storage(format!("{context}: {e}"))
}

pub async fn connect(dsn: &str) -> Result<ConnectionManager> {
    let client = Client::open(dsn).map_err(|e| storage_err("invalid redis dsn", e))?;
    let manager = ConnectionManager::new(client)
        .await
        .map_err(|e| storage_err("failed to connect to redis", e))?;
    info!("redis connected");
    Ok(manager)
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[derive(Clone)]
pub struct RedisDirectoryStore {
    redis: ConnectionManager,
}

impl RedisDirectoryStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    /// Foreground snapshot, used once on shutdown.
    pub async fn save(&self) -> Result<()> {
        redis::cmd("SAVE")
            .query_async::<_, ()>(&mut self.redis.clone())
            .await
            .map_err(|e| storage_err("SAVE failed", e))?;
        info!("redis snapshot saved");
        Ok(())
    }
}

fn write_pipeline(writes: &[StoreWrite]) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic();
    for w in writes {
        match w {
            StoreWrite::Delete { key } => {
                pipe.del(key).ignore();
            }
            StoreWrite::SetRemove { key, member } => {
                pipe.srem(key, member).ignore();
            }
            StoreWrite::Put { key, value, ttl } => {
                pipe.set_ex(key, value, ttl_secs(*ttl)).ignore();
            }
            StoreWrite::SetAdd { key, member, ttl } => {
                pipe.sadd(key, member).ignore();
                pipe.cmd("EXPIRE").arg(key).arg(ttl_secs(*ttl)).ignore();
            }
        }
    }
    pipe
}

fn is_bgsave_in_progress(e: &RedisError) -> bool {
    e.to_string().contains("already in progress")
}

#[async_trait]
impl DirectoryStore for RedisDirectoryStore {
    async fn get_refresh(&self, key: &str, ttl: Duration) -> Result<Option<Vec<u8>>> {
        redis::cmd("GETEX")
            .arg(key)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async::<_, Option<Vec<u8>>>(&mut self.redis.clone())
            .await
            .map_err(|e| storage_err("GETEX failed", e))
    }

    async fn members(&self, key: &str) -> Result<Vec<String>> {
        redis::cmd("SMEMBERS")
            .arg(key)
            .query_async::<_, Vec<String>>(&mut self.redis.clone())
            .await
            .map_err(|e| storage_err("SMEMBERS failed", e))
    }

    async fn apply(&self, writes: Vec<StoreWrite>) -> Result<()> {
        write_pipeline(&writes)
            .query_async::<_, ()>(&mut self.redis.clone())
            .await
            .map_err(|e| storage_err("directory write failed", e))
    }

    async fn persist(&self) -> Result<()> {
        match redis::cmd("BGSAVE")
            .query_async::<_, ()>(&mut self.redis.clone())
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_bgsave_in_progress(&e) => {
                debug!("background save already running");
                Ok(())
            }
            Err(e) => Err(storage_err("BGSAVE failed", e)),
        }
    }
}

#[derive(Clone)]
pub struct RedisMessageLedger {
    redis: ConnectionManager,
    ttl: Duration,
}

impl RedisMessageLedger {
    pub fn new(redis: ConnectionManager, ttl: Duration) -> Self {
        Self { redis, ttl }
    }
}

fn ledger_key(chat_id: ChatId, discipline_id: u32) -> String {
    format!("score_msg:{chat_id}:{discipline_id}")
}

#[async_trait]
impl MessageLedger for RedisMessageLedger {
    async fn get(&self, chat_id: ChatId, discipline_id: u32) -> Result<Option<MessageId>> {
        let id = redis::cmd("GET")
            .arg(ledger_key(chat_id, discipline_id))
            .query_async::<_, Option<i32>>(&mut self.redis.clone())
            .await
            .map_err(|e| storage_err("ledger read failed", e))?;
        Ok(id.map(MessageId))
    }

    async fn put(&self, chat_id: ChatId, discipline_id: u32, message_id: MessageId) -> Result<()> {
        redis::cmd("SET")
            .arg(ledger_key(chat_id, discipline_id))
            .arg(message_id.0)
            .arg("EX")
            .arg(ttl_secs(self.ttl))
            .query_async::<_, ()>(&mut self.redis.clone())
            .await
            .map_err(|e| storage_err("ledger write failed", e))
    }

    async fn clear(&self, chat_id: ChatId, discipline_id: u32) -> Result<()> {
        redis::cmd("DEL")
            .arg(ledger_key(chat_id, discipline_id))
            .query_async::<_, ()>(&mut self.redis.clone())
            .await
            .map_err(|e| storage_err("ledger delete failed", e))
    }
}

/// Sorted set of pending deletions, scored by the epoch second they are due.
#[derive(Clone)]
pub struct RedisDeleteTaskSink {
    redis: ConnectionManager,
}

impl RedisDeleteTaskSink {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl DeleteTaskSink for RedisDeleteTaskSink {
    async fn schedule(&self, task: DeleteTask) -> Result<()> {
        let member = serde_json::to_string(&task)?;
        redis::cmd("ZADD")
            .arg(DELETE_TASKS_KEY)
            .arg(task.scheduled_at)
            .arg(member)
            .query_async::<_, ()>(&mut self.redis.clone())
            .await
            .map_err(|e| storage_err("ZADD failed", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed(writes: &[StoreWrite]) -> String {
        String::from_utf8_lossy(&write_pipeline(writes).get_packed_pipeline()).into_owned()
    }

    #[test]
    fn directory_writes_are_one_transaction() {
        let ttl = Duration::from_secs(60);
        let out = packed(&[
            StoreWrite::Delete { key: "10".into() },
            StoreWrite::SetRemove {
                key: "5".into(),
                member: "10".into(),
            },
            StoreWrite::Put {
                key: "10".into(),
                value: vec![8, 6],
                ttl,
            },
            StoreWrite::SetAdd {
                key: "6".into(),
                member: "10".into(),
                ttl,
            },
        ]);

        let order: Vec<_> = ["MULTI", "DEL", "SREM", "SETEX", "SADD", "EXPIRE", "EXEC"]
            .iter()
            .map(|cmd| out.find(cmd).unwrap())
            .collect();
        assert!(order.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn ledger_key_is_per_chat_and_discipline() {
        assert_eq!(ledger_key(ChatId(-100), 234), "score_msg:-100:234");
    }

    #[test]
    fn ttl_never_rounds_down_to_zero() {
        assert_eq!(ttl_secs(Duration::from_millis(300)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(3600)), 3600);
    }

    #[test]
    fn delete_task_member_is_json() {
        let task = DeleteTask {
            scheduled_at: 1_700_000_000,
            message_id: 7,
            chat_id: 42,
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&task).unwrap()).unwrap();
        assert_eq!(json["chat_id"], 42);
        assert_eq!(json["message_id"], 7);
    }
}
