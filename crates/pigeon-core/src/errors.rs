use std::time::Duration;

/// Core error type.
///
/// Adapter crates map their specific errors into this type so the consumer loops
/// and the dispatcher can tell absorbable failures from ones that must surface.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("event log error: {0}")]
    Log(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("operation cancelled")]
    Cancelled,

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by the outbound messaging channel, already classified.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// Flood control; the server asks to wait before the next call.
    #[error("too many requests, retry after {0:?}")]
    RetryAfter(Duration),

    /// Chat not found, bot blocked by the user or user deactivated.
    #[error("recipient unreachable: {0}")]
    Unreachable(String),

    /// Edit with content identical to what the message already shows.
    #[error("message is not modified")]
    NotModified,

    /// The referenced message no longer exists (deleted or too old).
    #[error("message not found")]
    MessageNotFound,

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
