//! Rate-limited, retrying front of the messaging channel.
//!
//! Every outbound call:
//! - takes a token from the shared [`TokenBucket`] (suspends, observes cancellation)
//! - on flood control sleeps the server-provided duration and retries, up to
//!   `max_attempts` calls in total; the last error surfaces when the budget runs out
//! - on "recipient unreachable" publishes a logout for the chat and reports
//!   [`Delivery::Evicted`] instead of an error

use std::{future::Future, sync::Arc};

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    domain::{ChatId, MessageRef},
    errors::{ChannelError, Error},
    messaging::{port::MessagingPort, types::SendOptions},
    metrics::{ErrorKind, RelayMetrics},
    ports::LogoutPublisher,
    ratelimit::TokenBucket,
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct DispatcherSettings {
    pub rate_per_second: f64,
    pub burst: u32,
    pub max_attempts: u32,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            rate_per_second: 1.0,
            burst: 30,
            max_attempts: 5,
        }
    }
}

/// Outcome of a call whose failure may have been absorbed by eviction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery<T> {
    Delivered(T),
    /// The recipient is gone; its directory entry is being evicted.
    Evicted,
}

pub struct NotificationDispatcher {
    messenger: Arc<dyn MessagingPort>,
    evictor: Arc<dyn LogoutPublisher>,
    limiter: TokenBucket,
    metrics: Arc<RelayMetrics>,
    cancel: CancellationToken,
    max_attempts: u32,
}

impl NotificationDispatcher {
    pub fn new(
        messenger: Arc<dyn MessagingPort>,
        evictor: Arc<dyn LogoutPublisher>,
        metrics: Arc<RelayMetrics>,
        settings: DispatcherSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            messenger,
            evictor,
            limiter: TokenBucket::new(settings.rate_per_second, settings.burst),
            metrics,
            cancel,
            max_attempts: settings.max_attempts.max(1),
        }
    }

    pub async fn send(
        &self,
        chat_id: ChatId,
        text: &str,
        opts: &SendOptions,
    ) -> Result<Delivery<MessageRef>> {
        let messenger = &self.messenger;
        let outcome = self
            .with_retry(move || messenger.send(chat_id, text, opts))
            .await;
        self.absorb_unreachable(chat_id, outcome).await
    }

    pub async fn edit(
        &self,
        msg: MessageRef,
        text: &str,
        opts: &SendOptions,
    ) -> Result<Delivery<()>> {
        let messenger = &self.messenger;
        let outcome = self.with_retry(move || messenger.edit(msg, text, opts)).await;
        self.absorb_unreachable(msg.chat_id, outcome).await
    }

    pub async fn delete(&self, msg: MessageRef) -> Result<Delivery<()>> {
        let messenger = &self.messenger;
        let outcome = self.with_retry(move || messenger.delete(msg)).await;
        self.absorb_unreachable(msg.chat_id, outcome).await
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: Future<Output = std::result::Result<T, ChannelError>>,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if self.limiter.acquire(&self.cancel).await? {
                self.metrics.error(ErrorKind::RateLimit);
            }

            match op().await {
                Ok(v) => return Ok(v),
                Err(ChannelError::RetryAfter(d)) => {
                    self.metrics.error(ErrorKind::TooManyRequests);
                    if attempts >= self.max_attempts {
                        return Err(ChannelError::RetryAfter(d).into());
                    }
                    warn!(attempt = attempts, retry_after = ?d, "flood control, backing off");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                        _ = sleep(d) => {}
                    }
                }
                Err(other) => return Err(other.into()),
            }
        }
    }

    async fn absorb_unreachable<T>(
        &self,
        chat_id: ChatId,
        outcome: Result<T>,
    ) -> Result<Delivery<T>> {
        match outcome {
            Ok(v) => Ok(Delivery::Delivered(v)),
            Err(Error::Channel(ChannelError::Unreachable(reason))) => {
                info!(chat = %chat_id, %reason, "recipient unreachable, evicting");
                self.metrics.evicted();
                self.evictor.logout(chat_id).await?;
                Ok(Delivery::Evicted)
            }
            Err(e) => Err(e),
        }
    }
}
