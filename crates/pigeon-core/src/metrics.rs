use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::{errors::Error, Result};

/// Counters for the relay, registered on a registry owned by this sink.
///
/// Built once by the binary and shared (`Arc`) with every component that counts.
/// Tests construct their own instance, so nothing is global.
#[derive(Clone)]
pub struct RelayMetrics {
    registry: Registry,
    errors: IntCounterVec,
    events_handled: IntCounterVec,
    commits: IntCounterVec,
    evictions: IntCounter,
}

/// Label values of `error_count{type}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    OnError,
    OnUpdate,
    RateLimit,
    TooManyRequests,
}

impl ErrorKind {
    fn label(self) -> &'static str {
        match self {
            ErrorKind::OnError => "onError",
            ErrorKind::OnUpdate => "onUpdate",
            ErrorKind::RateLimit => "rateLimit",
            ErrorKind::TooManyRequests => "tooManyRequests",
        }
    }
}

impl RelayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let errors = IntCounterVec::new(
            Opts::new("error_count", "Errors observed by the relay"),
            &["type"],
        )
        .map_err(metrics_err)?;
        let events_handled = IntCounterVec::new(
            Opts::new("events_handled_total", "Events handled without error"),
            &["stream"],
        )
        .map_err(metrics_err)?;
        let commits = IntCounterVec::new(
            Opts::new("commits_total", "Offset commits issued"),
            &["stream"],
        )
        .map_err(metrics_err)?;
        let evictions = IntCounter::new(
            "evictions_total",
            "Chats evicted after the channel reported them unreachable",
        )
        .map_err(metrics_err)?;

        registry
            .register(Box::new(errors.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(events_handled.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(commits.clone()))
            .map_err(metrics_err)?;
        registry
            .register(Box::new(evictions.clone()))
            .map_err(metrics_err)?;

        Ok(Self {
            registry,
            errors,
            events_handled,
            commits,
            evictions,
        })
    }

    pub fn error(&self, kind: ErrorKind) {
        self.errors.with_label_values(&[kind.label()]).inc();
    }

    pub fn event_handled(&self, stream: &str) {
        self.events_handled.with_label_values(&[stream]).inc();
    }

    pub fn committed(&self, stream: &str) {
        self.commits.with_label_values(&[stream]).inc();
    }

    pub fn evicted(&self) {
        self.evictions.inc();
    }

    pub fn error_count(&self, kind: ErrorKind) -> u64 {
        self.errors.with_label_values(&[kind.label()]).get()
    }

    pub fn eviction_count(&self) -> u64 {
        self.evictions.get()
    }

    /// Text exposition of every counter.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_err)?;
        String::from_utf8(buffer).map_err(|e| Error::External(format!("metrics: {e}")))
    }
}

fn metrics_err(e: prometheus::Error) -> Error {
    Error::External(format!("metrics: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_are_isolated_per_instance() {
        let a = RelayMetrics::new().unwrap();
        let b = RelayMetrics::new().unwrap();
        a.error(ErrorKind::TooManyRequests);
        a.error(ErrorKind::TooManyRequests);
        a.evicted();

        assert_eq!(a.error_count(ErrorKind::TooManyRequests), 2);
        assert_eq!(b.error_count(ErrorKind::TooManyRequests), 0);
        assert_eq!(a.eviction_count(), 1);

        let text = a.render().unwrap();
        assert!(text.contains("error_count{type=\"tooManyRequests\"} 2"));
    }
}
