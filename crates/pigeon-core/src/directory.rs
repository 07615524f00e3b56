//! Durable mapping between chat identities and students.
//!
//! Storage layout:
//! - `{chat_id}` → protobuf-encoded [`UserRecord`], TTL refreshed on every read
//! - `{student_id}` → set of chat ids, TTL refreshed on every write
//!
//! A chat id belongs to at most one student's set, and student `0` never has one.

use std::{sync::Arc, time::Duration};

use prost::Message;

use crate::{
    domain::{ChatId, StudentId},
    errors::Error,
    events::{Gender, UserAuthorizedEvent},
    ports::{DirectoryStore, StoreWrite},
    Result,
};

/// 7 months.
pub const USER_EXPIRATION: Duration = Duration::from_secs(60 * 60 * 24 * 210);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum GenderType {
    Unknown = 0,
    Male = 1,
    Female = 2,
}

#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct UserRecord {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(string, tag = "2")]
    pub last_name: String,
    #[prost(string, tag = "3")]
    pub first_name: String,
    #[prost(string, tag = "4")]
    pub middle_name: String,
    #[prost(enumeration = "GenderType", tag = "5")]
    pub gender: i32,
}

impl UserRecord {
    pub fn student_id(&self) -> StudentId {
        StudentId(self.id)
    }

    pub fn domain_gender(&self) -> Gender {
        match GenderType::try_from(self.gender) {
            Ok(GenderType::Male) => Gender::Male,
            Ok(GenderType::Female) => Gender::Female,
            _ => Gender::Unknown,
        }
    }
}

impl From<&UserAuthorizedEvent> for UserRecord {
    fn from(ev: &UserAuthorizedEvent) -> Self {
        let gender = match ev.gender {
            Gender::Unknown => GenderType::Unknown,
            Gender::Male => GenderType::Male,
            Gender::Female => GenderType::Female,
        };
        Self {
            id: ev.student_id,
            last_name: ev.last_name.clone(),
            first_name: ev.first_name.clone(),
            middle_name: ev.middle_name.clone(),
            gender: gender as i32,
        }
    }
}

pub struct UserDirectory {
    store: Arc<dyn DirectoryStore>,
    ttl: Duration,
}

impl UserDirectory {
    pub fn new(store: Arc<dyn DirectoryStore>) -> Self {
        Self::with_ttl(store, USER_EXPIRATION)
    }

    pub fn with_ttl(store: Arc<dyn DirectoryStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Associates `chat_id` with `record`, dropping any previous association first.
    ///
    /// A record with student `0` only removes. All writes go out as one atomic batch.
    pub async fn save(&self, chat_id: ChatId, record: &UserRecord) -> Result<()> {
        let chat_key = chat_id.to_string();
        let previous = self.lookup(chat_id).await?;

        let mut writes = Vec::with_capacity(4);
        if previous.id != record.id {
            writes.push(StoreWrite::Delete {
                key: chat_key.clone(),
            });
            if !previous.student_id().is_anonymous() {
                writes.push(StoreWrite::SetRemove {
                    key: previous.student_id().to_string(),
                    member: chat_key.clone(),
                });
            }
        }

        if !record.student_id().is_anonymous() {
            writes.push(StoreWrite::Put {
                key: chat_key.clone(),
                value: record.encode_to_vec(),
                ttl: self.ttl,
            });
            writes.push(StoreWrite::SetAdd {
                key: record.student_id().to_string(),
                member: chat_key,
                ttl: self.ttl,
            });
        }

        if writes.is_empty() {
            return Ok(());
        }
        self.store.apply(writes).await
    }

    /// The stored record, or an anonymous one when absent.
    pub async fn lookup(&self, chat_id: ChatId) -> Result<UserRecord> {
        let Some(raw) = self
            .store
            .get_refresh(&chat_id.to_string(), self.ttl)
            .await?
        else {
            return Ok(UserRecord::default());
        };

        UserRecord::decode(raw.as_slice())
            .map_err(|e| Error::Decode(format!("user record for chat {chat_id}: {e}")))
    }

    pub async fn lookup_chats(&self, student_id: StudentId) -> Result<Vec<ChatId>> {
        if student_id.is_anonymous() {
            return Ok(Vec::new());
        }
        let members = self.store.members(&student_id.to_string()).await?;
        Ok(members.iter().filter_map(|m| ChatId::parse(m)).collect())
    }

    pub async fn commit(&self) -> Result<()> {
        self.store.persist().await
    }
}
