//! Typed events carried by the two consumed streams.
//!
//! Payloads are JSON objects with PascalCase field names; the score value of a
//! `ScoreChanged` event sits at the top level next to the lesson ids.

use serde::{Deserialize, Serialize};

use crate::domain::{ChatId, StudentId};

pub const USER_AUTHORIZED_KEY: &str = "UserAuthorized";
pub const SCORE_CHANGED_KEY: &str = "ScoreChanged";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Gender {
    #[default]
    Unknown,
    Male,
    Female,
}

impl TryFrom<u8> for Gender {
    type Error = String;

    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        match v {
            0 => Ok(Gender::Unknown),
            1 => Ok(Gender::Male),
            2 => Ok(Gender::Female),
            other => Err(format!("unknown gender {other}")),
        }
    }
}

impl From<Gender> for u8 {
    fn from(g: Gender) -> Self {
        match g {
            Gender::Unknown => 0,
            Gender::Male => 1,
            Gender::Female => 2,
        }
    }
}

/// A user finished (or revoked) authorization in some client application.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UserAuthorizedEvent {
    pub client: String,
    pub client_user_id: String,
    pub student_id: u32,
    pub last_name: String,
    pub first_name: String,
    pub middle_name: String,
    pub gender: Gender,
}

impl UserAuthorizedEvent {
    /// The event written when a chat logs out: same stream, `StudentId` = 0.
    pub fn logout(client: &str, chat_id: ChatId) -> Self {
        Self {
            client: client.to_string(),
            client_user_id: chat_id.to_string(),
            ..Default::default()
        }
    }

    pub fn student_id(&self) -> StudentId {
        StudentId(self.student_id)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ScoreValue {
    pub value: f32,
    pub is_absent: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ScoreChangedEvent {
    pub id: u32,
    pub student_id: u32,
    pub lesson_id: u32,
    pub lesson_part: u8,
    pub discipline_id: u32,
    pub year: u16,
    pub semester: u8,
    #[serde(flatten)]
    pub score_value: ScoreValue,
    pub previous: ScoreValue,
    pub is_deleted: bool,
}

impl ScoreChangedEvent {
    pub fn student_id(&self) -> StudentId {
        StudentId(self.student_id)
    }
}
