//! Outbound chat channel abstraction (Telegram today).

pub mod port;
pub mod types;
