//! Telegram adapter (teloxide).
//!
//! This crate implements the `pigeon-core` MessagingPort over the Telegram Bot API
//! and runs the inbound update loop.

use async_trait::async_trait;

use teloxide::{
    prelude::*,
    types::{KeyboardButton, KeyboardMarkup, KeyboardRemove, ReplyMarkup},
    ApiError, RequestError,
};

pub mod router;

use pigeon_core::{
    domain::{ChatId, MessageId, MessageRef},
    errors::ChannelError,
    messaging::{
        port::{ChannelResult, MessagingPort},
        types::{Keyboard, ParseMode, SendOptions},
    },
};

/// Builds the bot, pointing it at a custom Bot API server when `api_url` is set.
pub fn bot(token: &str, api_url: Option<&str>) -> anyhow::Result<Bot> {
    let bot = Bot::new(token);
    match api_url {
        Some(url) => Ok(bot.set_api_url(url.parse()?)),
        None => Ok(bot),
    }
}

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn tg_msg_id(message_id: MessageId) -> teloxide::types::MessageId {
        teloxide::types::MessageId(message_id.0)
    }

}

fn tg_parse_mode(mode: ParseMode) -> Option<teloxide::types::ParseMode> {
    match mode {
        ParseMode::Plain => None,
        ParseMode::Html => Some(teloxide::types::ParseMode::Html),
    }
}

fn reply_markup(keyboard: &Keyboard) -> Option<ReplyMarkup> {
    match keyboard {
        Keyboard::None => None,
        Keyboard::Reply(labels) => Some(ReplyMarkup::Keyboard(
            KeyboardMarkup::new(labels.iter().map(|l| vec![KeyboardButton::new(l)]))
                .resize_keyboard(true),
        )),
        Keyboard::Remove => Some(ReplyMarkup::KeyboardRemove(KeyboardRemove::new())),
    }
}

/// Sorts Bot API failures into what the dispatcher and the state machine act on.
fn classify(e: RequestError) -> ChannelError {
    match e {
        RequestError::RetryAfter(d) => ChannelError::RetryAfter(d),
        RequestError::Api(api) => match api {
            ApiError::BotBlocked
            | ApiError::ChatNotFound
            | ApiError::UserDeactivated
            | ApiError::BotKicked
            | ApiError::BotKickedFromSupergroup => ChannelError::Unreachable(api.to_string()),
            ApiError::MessageNotModified => ChannelError::NotModified,
            ApiError::MessageToEditNotFound | ApiError::MessageToDeleteNotFound => {
                ChannelError::MessageNotFound
            }
            other => ChannelError::Other(other.to_string()),
        },
        other => ChannelError::Other(other.to_string()),
    }
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
    async fn send(
        &self,
        chat_id: ChatId,
        text: &str,
        opts: &SendOptions,
    ) -> ChannelResult<MessageRef> {
        let mut req = self.bot.send_message(Self::tg_chat(chat_id), text);
        if let Some(mode) = tg_parse_mode(opts.parse_mode) {
            req = req.parse_mode(mode);
        }
        if let Some(markup) = reply_markup(&opts.keyboard) {
            req = req.reply_markup(markup);
        }
        if opts.protect_content {
            req = req.protect_content(true);
        }

        let msg = req.await.map_err(classify)?;
        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn edit(&self, msg: MessageRef, text: &str, opts: &SendOptions) -> ChannelResult<()> {
        // Reply keyboards cannot be attached to an edited message.
        let mut req = self.bot.edit_message_text(
            Self::tg_chat(msg.chat_id),
            Self::tg_msg_id(msg.message_id),
            text,
        );
        if let Some(mode) = tg_parse_mode(opts.parse_mode) {
            req = req.parse_mode(mode);
        }

        req.await.map_err(classify)?;
        Ok(())
    }

    async fn delete(&self, msg: MessageRef) -> ChannelResult<()> {
        self.bot
            .delete_message(Self::tg_chat(msg.chat_id), Self::tg_msg_id(msg.message_id))
            .await
            .map_err(classify)?;
        Ok(())
    }
}
