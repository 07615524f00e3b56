use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageRef},
    errors::ChannelError,
    messaging::types::SendOptions,
};

pub type ChannelResult<T> = std::result::Result<T, ChannelError>;

/// Raw outbound channel.
///
/// Implementations do one API call per method and classify failures into
/// [`ChannelError`]; rate limiting, retries and eviction live in the dispatcher.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    async fn send(&self, chat_id: ChatId, text: &str, opts: &SendOptions)
        -> ChannelResult<MessageRef>;

    async fn edit(&self, msg: MessageRef, text: &str, opts: &SendOptions) -> ChannelResult<()>;

    async fn delete(&self, msg: MessageRef) -> ChannelResult<()>;
}
