//! Hexagonal ports for the external systems the relay talks to.
//!
//! Kafka, Redis and the chat channel are implemented in adapter crates; the core
//! only depends on these traits.

use std::time::Duration;

use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageId},
    Result,
};

/// One record read from a partitioned, offset-ordered log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl LogMessage {
    pub fn key_matches(&self, expected: &str) -> bool {
        self.key.as_deref() == Some(expected.as_bytes())
    }
}

/// A consumer-group reader over one stream.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Waits for the next message. Dropping the future must be safe (it is raced
    /// against a deadline and against cancellation).
    async fn fetch(&self) -> Result<LogMessage>;

    /// Durably records the given messages as processed. `messages` is in receipt order.
    async fn commit(&self, messages: &[LogMessage]) -> Result<()>;
}

/// Atomic write unit for the directory store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreWrite {
    Delete { key: String },
    SetRemove { key: String, member: String },
    Put { key: String, value: Vec<u8>, ttl: Duration },
    SetAdd { key: String, member: String, ttl: Duration },
}

/// Key-value + set storage backing the user directory.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    /// Reads a value and refreshes its TTL.
    async fn get_refresh(&self, key: &str, ttl: Duration) -> Result<Option<Vec<u8>>>;

    async fn members(&self, key: &str) -> Result<Vec<String>>;

    /// Applies all writes as one atomic batch.
    async fn apply(&self, writes: Vec<StoreWrite>) -> Result<()>;

    /// Requests a background snapshot of the store.
    async fn persist(&self) -> Result<()>;
}

/// Remembers the latest message id per (chat, discipline).
#[async_trait]
pub trait MessageLedger: Send + Sync {
    async fn get(&self, chat_id: ChatId, discipline_id: u32) -> Result<Option<MessageId>>;
    async fn put(&self, chat_id: ChatId, discipline_id: u32, message_id: MessageId) -> Result<()>;
    async fn clear(&self, chat_id: ChatId, discipline_id: u32) -> Result<()>;
}

/// A message deletion to be performed later by an external scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeleteTask {
    pub scheduled_at: i64,
    pub message_id: i32,
    pub chat_id: i64,
}

#[async_trait]
pub trait DeleteTaskSink: Send + Sync {
    async fn schedule(&self, task: DeleteTask) -> Result<()>;
}

/// Publishes a logout for a chat identity (a `UserAuthorized` event with no student).
#[async_trait]
pub trait LogoutPublisher: Send + Sync {
    async fn logout(&self, chat_id: ChatId) -> Result<()>;
}
