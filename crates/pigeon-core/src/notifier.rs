//! Maps a changing score onto one mutable chat message per (chat, discipline).
//!
//! | new vs previous | previous message | action                     |
//! |-----------------|------------------|----------------------------|
//! | equal           | none             | nothing                    |
//! | equal           | some             | delete it                  |
//! | different       | none             | send a new one             |
//! | different       | some             | edit in place (same id)    |
//!
//! "Not modified" on edit counts as success. A stale reference (message already
//! gone) falls back to a fresh send on edit and to success on delete.

use std::sync::Arc;

use tracing::debug;

use crate::{
    compose,
    dispatcher::{Delivery, NotificationDispatcher},
    domain::{ChatId, MessageId, MessageRef},
    errors::{ChannelError, Error},
    events::{ScoreChangedEvent, ScoreValue},
    messaging::types::SendOptions,
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Created(MessageId),
    Edited(MessageId),
    Deleted,
    /// The chat turned out to be unreachable and was evicted.
    Evicted,
}

impl Transition {
    /// The message id to remember for the next change, if any.
    pub fn message_id(self) -> Option<MessageId> {
        match self {
            Transition::Created(id) | Transition::Edited(id) => Some(id),
            _ => None,
        }
    }
}

pub struct ScoreNotifier {
    dispatcher: Arc<NotificationDispatcher>,
}

impl ScoreNotifier {
    pub fn new(dispatcher: Arc<NotificationDispatcher>) -> Self {
        Self { dispatcher }
    }

    pub async fn apply(
        &self,
        chat_id: ChatId,
        previous_message: Option<MessageId>,
        event: &ScoreChangedEvent,
    ) -> Result<Transition> {
        let new_score = effective_score(event);

        if new_score == event.previous {
            let Some(message_id) = previous_message else {
                return Ok(Transition::Unchanged);
            };
            return self.delete(MessageRef { chat_id, message_id }).await;
        }

        let (text, opts) = compose::score_changed(event, &new_score);
        let Some(message_id) = previous_message else {
            return self.create(chat_id, &text, &opts).await;
        };

        let msg = MessageRef { chat_id, message_id };
        match self.dispatcher.edit(msg, &text, &opts).await {
            Ok(Delivery::Delivered(())) => Ok(Transition::Edited(message_id)),
            Ok(Delivery::Evicted) => Ok(Transition::Evicted),
            Err(Error::Channel(ChannelError::NotModified)) => Ok(Transition::Edited(message_id)),
            Err(Error::Channel(ChannelError::MessageNotFound)) => {
                debug!(chat = %chat_id, message = message_id.0, "edit target gone, sending anew");
                self.create(chat_id, &text, &opts).await
            }
            Err(e) => Err(e),
        }
    }

    async fn create(
        &self,
        chat_id: ChatId,
        text: &str,
        opts: &SendOptions,
    ) -> Result<Transition> {
        match self.dispatcher.send(chat_id, text, opts).await? {
            Delivery::Delivered(msg) => Ok(Transition::Created(msg.message_id)),
            Delivery::Evicted => Ok(Transition::Evicted),
        }
    }

    async fn delete(&self, msg: MessageRef) -> Result<Transition> {
        match self.dispatcher.delete(msg).await {
            Ok(Delivery::Delivered(())) => Ok(Transition::Deleted),
            Ok(Delivery::Evicted) => Ok(Transition::Evicted),
            Err(Error::Channel(ChannelError::MessageNotFound)) => Ok(Transition::Deleted),
            Err(e) => Err(e),
        }
    }
}

/// A deleted score reads as empty.
fn effective_score(event: &ScoreChangedEvent) -> ScoreValue {
    if event.is_deleted {
        ScoreValue::default()
    } else {
        event.score_value
    }
}
