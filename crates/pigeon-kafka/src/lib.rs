//! Kafka adapter (rdkafka).
//!
//! Implements the `pigeon-core` [`EventLog`] over a manually committed
//! `StreamConsumer`, and the [`LogoutPublisher`] over a `FutureProducer` writing to
//! the authorization topic.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use rdkafka::{
    config::ClientConfig,
    consumer::{CommitMode, Consumer, StreamConsumer},
    message::Message,
    producer::{FutureProducer, FutureRecord},
    Offset, TopicPartitionList,
};
use tracing::{debug, info};

use pigeon_core::{
    domain::ChatId,
    errors::Error,
    events::{UserAuthorizedEvent, USER_AUTHORIZED_KEY},
    ports::{EventLog, LogMessage, LogoutPublisher},
    Result,
};

fn log_err(context: &str, e: rdkafka::error::KafkaError) -> Error {
    Error::Log(format!("{context}: {e}"))
}

/// One consumer-group member subscribed to a single topic.
pub struct KafkaEventLog {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaEventLog {
    pub fn new(brokers: &str, group_id: &str, topic: &str, timeout: Duration) -> Result<Self> {
        let session_timeout = timeout.max(Duration::from_secs(6)).as_millis().to_string();
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", &session_timeout)
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| log_err("failed to create kafka consumer", e))?;

        consumer
            .subscribe(&[topic])
            .map_err(|e| log_err("failed to subscribe", e))?;

        info!(brokers, group_id, topic, "kafka consumer subscribed");
        Ok(Self {
            consumer,
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl EventLog for KafkaEventLog {
    async fn fetch(&self) -> Result<LogMessage> {
        let msg = self
            .consumer
            .recv()
            .await
            .map_err(|e| log_err("kafka recv failed", e))?;

        Ok(LogMessage {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key: msg.key().map(<[u8]>::to_vec),
            payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        })
    }

    async fn commit(&self, messages: &[LogMessage]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut tpl = TopicPartitionList::new();
        for ((topic, partition), next) in next_offsets(messages) {
            tpl.add_partition_offset(&topic, partition, Offset::Offset(next))
                .map_err(|e| log_err("bad commit position", e))?;
        }

        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| log_err("kafka commit failed", e))?;
        debug!(topic = %self.topic, count = messages.len(), "offsets committed");
        Ok(())
    }
}

/// Kafka commits name the next offset to read, per partition.
fn next_offsets(messages: &[LogMessage]) -> BTreeMap<(String, i32), i64> {
    let mut out: BTreeMap<(String, i32), i64> = BTreeMap::new();
    for m in messages {
        let next = out
            .entry((m.topic.clone(), m.partition))
            .or_insert(m.offset + 1);
        *next = (*next).max(m.offset + 1);
    }
    out
}

/// Publishes logouts as `UserAuthorized` messages with no student.
#[derive(Clone)]
pub struct KafkaLogoutPublisher {
    producer: FutureProducer,
    topic: String,
    client_name: String,
    timeout: Duration,
}

impl KafkaLogoutPublisher {
    pub fn new(brokers: &str, topic: &str, client_name: &str, timeout: Duration) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", "all")
            .create()
            .map_err(|e| log_err("failed to create kafka producer", e))?;

        info!(brokers, topic, "kafka logout publisher initialized");
        Ok(Self {
            producer,
            topic: topic.to_string(),
            client_name: client_name.to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl LogoutPublisher for KafkaLogoutPublisher {
    async fn logout(&self, chat_id: ChatId) -> Result<()> {
        let event = UserAuthorizedEvent::logout(&self.client_name, chat_id);
        let payload = serde_json::to_vec(&event)?;

        let record = FutureRecord::to(&self.topic)
            .key(USER_AUTHORIZED_KEY)
            .payload(&payload);

        match self.producer.send(record, self.timeout).await {
            Ok((partition, offset)) => {
                info!(chat = %chat_id, partition, offset, "logout published");
                Ok(())
            }
            Err((e, _)) => Err(log_err("failed to publish logout", e)),
        }
    }
}
