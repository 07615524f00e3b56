//! Core logic for the score notification relay.
//!
//! This crate is framework-agnostic. Kafka / Redis / Telegram live behind ports
//! (traits) implemented in adapter crates.

pub mod compose;
pub mod config;
pub mod consumer;
pub mod directory;
pub mod dispatcher;
pub mod domain;
pub mod errors;
pub mod events;
pub mod executor;
pub mod handlers;
pub mod logging;
pub mod messaging;
pub mod metrics;
pub mod notifier;
pub mod ports;
pub mod ratelimit;

pub use errors::{Error, Result};
