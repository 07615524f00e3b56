//! At-least-once consumption of one log stream.
//!
//! The loop is strictly sequential: fetch, then decode + handle, then (maybe) commit.
//! A message joins the pending batch only after its handler returned `Ok`; the batch
//! is flushed (handler commit first, then the log commit) once it holds
//! `commit_threshold` handled messages or has been open for `commit_interval`.
//! While a batch is open the fetch is bounded by that deadline.
//!
//! Log commits are cumulative per partition, so once a message of a partition fails
//! nothing later from that partition is committed during this run; the failed
//! message comes back after a restart.

use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    metrics::{ErrorKind, RelayMetrics},
    ports::{EventLog, LogMessage},
    Result,
};

const FETCH_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Per-stream capabilities the consumer needs from its handler.
#[async_trait]
pub trait EventHandler: Send + Sync {
    type Event: Send;

    /// Only messages with this key are decoded. An empty key makes the consumer inert.
    fn expected_key(&self) -> &str;

    fn decode(&self, payload: &[u8]) -> Result<Self::Event>;

    async fn handle(&self, event: Self::Event) -> Result<()>;

    /// Makes the effects of every handled event durable. Runs before the log commit.
    async fn commit(&self) -> Result<()>;
}

#[derive(Clone, Copy, Debug)]
pub struct ConsumerSettings {
    pub commit_threshold: usize,
    pub commit_interval: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            commit_threshold: 10,
            commit_interval: Duration::from_secs(60),
        }
    }
}

/// Positions waiting for the next flush, in receipt order.
#[derive(Debug, Default)]
struct PendingCommit {
    messages: Vec<LogMessage>,
    handled: usize,
    opened_at: Option<Instant>,
}

impl PendingCommit {
    fn is_open(&self) -> bool {
        self.handled > 0
    }

    fn push_handled(&mut self, message: LogMessage) {
        if self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
        }
        self.handled += 1;
        self.messages.push(message);
    }

    fn push_skipped(&mut self, message: LogMessage) {
        self.messages.push(message);
    }

    fn deadline(&self, interval: Duration) -> Option<Instant> {
        self.opened_at.map(|t| t + interval)
    }

    fn clear(&mut self) {
        self.messages.clear();
        self.handled = 0;
        self.opened_at = None;
    }
}

pub struct LogConsumer<H: EventHandler> {
    stream: String,
    log: Arc<dyn EventLog>,
    handler: Arc<H>,
    settings: ConsumerSettings,
    metrics: Arc<RelayMetrics>,
    disabled: bool,
}

impl<H: EventHandler> LogConsumer<H> {
    pub fn new(
        stream: impl Into<String>,
        log: Arc<dyn EventLog>,
        handler: Arc<H>,
        settings: ConsumerSettings,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            stream: stream.into(),
            log,
            handler,
            settings: ConsumerSettings {
                commit_threshold: settings.commit_threshold.max(1),
                ..settings
            },
            metrics,
            disabled: false,
        }
    }

    pub fn disable(&mut self) {
        self.disabled = true;
    }

    /// Runs until `cancel` fires. An open batch is abandoned, not flushed.
    pub async fn run(self, cancel: CancellationToken) {
        let stream = self.stream.as_str();
        if self.disabled || self.handler.expected_key().is_empty() {
            info!(stream, "consumer is inert");
            return;
        }

        info!(stream, key = self.handler.expected_key(), "consuming started");

        let mut batch = PendingCommit::default();
        let mut poisoned: HashSet<(String, i32)> = HashSet::new();

        loop {
            let fetched = match batch.deadline(self.settings.commit_interval) {
                None => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    res = self.log.fetch() => Some(res),
                },
                Some(deadline) => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    res = timeout_at(deadline, self.log.fetch()) => res.ok(),
                },
            };

            match fetched {
                Some(Ok(message)) => self.process(message, &mut batch, &mut poisoned).await,
                Some(Err(e)) => {
                    self.metrics.error(ErrorKind::OnError);
                    warn!(stream, error = %e, "fetch failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(FETCH_ERROR_BACKOFF) => {}
                    }
                }
                None => {}
            }

            if self.should_flush(&batch) {
                self.flush(&mut batch).await;
            }
        }

        if batch.is_open() {
            info!(
                stream,
                pending = batch.messages.len(),
                "stopping with an uncommitted batch, it will be redelivered"
            );
        }
        info!(stream, "consuming done");
    }

    fn should_flush(&self, batch: &PendingCommit) -> bool {
        if !batch.is_open() {
            return false;
        }
        if batch.handled >= self.settings.commit_threshold {
            return true;
        }
        batch
            .deadline(self.settings.commit_interval)
            .map(|d| Instant::now() >= d)
            .unwrap_or(false)
    }

    async fn process(
        &self,
        message: LogMessage,
        batch: &mut PendingCommit,
        poisoned: &mut HashSet<(String, i32)>,
    ) {
        let stream = self.stream.as_str();
        let partition = (message.topic.clone(), message.partition);

        if !message.key_matches(self.handler.expected_key()) {
            if poisoned.contains(&partition) {
                return;
            }
            if batch.is_open() {
                batch.push_skipped(message);
            } else if let Err(e) = self.log.commit(std::slice::from_ref(&message)).await {
                warn!(stream, offset = message.offset, error = %e, "failed to commit skipped message");
            }
            return;
        }

        let outcome = match self.handler.decode(&message.payload) {
            Ok(event) => self.handler.handle(event).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                self.metrics.event_handled(stream);
                if poisoned.contains(&partition) {
                    debug!(stream, offset = message.offset, "handled behind a failed message, not committing");
                } else {
                    batch.push_handled(message);
                }
            }
            Err(e) => {
                self.metrics.error(ErrorKind::OnError);
                error!(
                    stream,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "failed to process message"
                );
                poisoned.insert(partition);
            }
        }
    }

    async fn flush(&self, batch: &mut PendingCommit) {
        let stream = self.stream.as_str();
        let count = batch.messages.len();

        let result = match self.handler.commit().await {
            Ok(()) => self.log.commit(&batch.messages).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.metrics.committed(stream);
                info!(stream, count, "committed");
                batch.clear();
            }
            Err(e) => {
                self.metrics.error(ErrorKind::OnError);
                error!(stream, count, error = %e, "commit failed, will retry");
                // Give the store a full interval before the time-based retry.
                batch.opened_at = Some(Instant::now());
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::errors::Error;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Single-topic log with cumulative per-partition commits, like Kafka.
    #[derive(Default)]
    pub(crate) struct FakeLog {
        queue: Mutex<VecDeque<LogMessage>>,
        all: Vec<LogMessage>,
        pub(crate) commits: Mutex<Vec<Vec<i64>>>,
    }

    impl FakeLog {
        pub(crate) fn new(messages: Vec<LogMessage>) -> Self {
            Self {
                queue: Mutex::new(messages.clone().into()),
                all: messages,
                commits: Mutex::new(Vec::new()),
            }
        }

        /// A new reader of the same group: resumes after the committed watermark.
        pub(crate) fn reopen(&self) -> Self {
            let committed = self.commits.lock().unwrap().concat();
            let watermark = committed.iter().max().map(|o| o + 1).unwrap_or(0);
            let rest = self
                .all
                .iter()
                .filter(|m| m.offset >= watermark)
                .cloned()
                .collect();
            Self::new(rest)
        }

        pub(crate) fn committed_offsets(&self) -> Vec<i64> {
            self.commits.lock().unwrap().concat()
        }
    }

    #[async_trait]
    impl EventLog for FakeLog {
        async fn fetch(&self) -> Result<LogMessage> {
            let next = self.queue.lock().unwrap().pop_front();
            match next {
                Some(m) => Ok(m),
                None => std::future::pending().await,
            }
        }

        async fn commit(&self, messages: &[LogMessage]) -> Result<()> {
            self.commits
                .lock()
                .unwrap()
                .push(messages.iter().map(|m| m.offset).collect());
            Ok(())
        }
    }

    pub(crate) fn message(offset: i64, key: &str, payload: &str) -> LogMessage {
        LogMessage {
            topic: "t".to_string(),
            partition: 0,
            offset,
            key: Some(key.as_bytes().to_vec()),
            payload: payload.as_bytes().to_vec(),
        }
    }

    /// Payload is a number; handling fails for the numbers in `fail`.
    #[derive(Default)]
    struct NumberHandler {
        key: String,
        fail: Vec<u32>,
        handled: Mutex<Vec<u32>>,
        commits: Mutex<usize>,
    }

    impl NumberHandler {
        fn new(fail: Vec<u32>) -> Self {
            Self {
                key: "Number".to_string(),
                fail,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl EventHandler for NumberHandler {
        type Event = u32;

        fn expected_key(&self) -> &str {
            &self.key
        }

        fn decode(&self, payload: &[u8]) -> Result<u32> {
            std::str::from_utf8(payload)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::Decode("not a number".to_string()))
        }

        async fn handle(&self, n: u32) -> Result<()> {
            if self.fail.contains(&n) {
                return Err(Error::External(format!("boom {n}")));
            }
            self.handled.lock().unwrap().push(n);
            Ok(())
        }

        async fn commit(&self) -> Result<()> {
            *self.commits.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn numbers(range: std::ops::Range<i64>) -> Vec<LogMessage> {
        range
            .map(|i| message(i, "Number", &i.to_string()))
            .collect()
    }

    fn consumer(log: Arc<FakeLog>, handler: Arc<NumberHandler>) -> LogConsumer<NumberHandler> {
        LogConsumer::new(
            "numbers",
            log,
            handler,
            ConsumerSettings::default(),
            Arc::new(RelayMetrics::new().unwrap()),
        )
    }

    /// Runs the consumer until the log is drained and it is idle for `idle`, then stops it.
    async fn run_for(c: LogConsumer<NumberHandler>, idle: Duration) {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(c.run(cancel.clone()));
        sleep(idle).await;
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn threshold_batch_is_committed_once() {
        let log = Arc::new(FakeLog::new(numbers(0..10)));
        let handler = Arc::new(NumberHandler::new(vec![]));

        run_for(consumer(log.clone(), handler.clone()), Duration::from_secs(1)).await;

        assert_eq!(*log.commits.lock().unwrap(), vec![(0..10).collect::<Vec<_>>()]);
        assert_eq!(*handler.commits.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_waits_for_the_deadline() {
        let log = Arc::new(FakeLog::new(numbers(0..3)));
        let handler = Arc::new(NumberHandler::new(vec![]));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(consumer(log.clone(), handler.clone()).run(cancel.clone()));

        sleep(Duration::from_secs(59)).await;
        assert!(log.commits.lock().unwrap().is_empty());

        sleep(Duration::from_secs(2)).await;
        assert_eq!(*log.commits.lock().unwrap(), vec![vec![0, 1, 2]]);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn every_position_committed_at_most_once() {
        let log = Arc::new(FakeLog::new(numbers(0..25)));
        let handler = Arc::new(NumberHandler::new(vec![]));

        run_for(consumer(log.clone(), handler.clone()), Duration::from_secs(61)).await;

        let committed = log.committed_offsets();
        assert_eq!(committed, (0..25).collect::<Vec<_>>());
        assert_eq!(log.commits.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_abandons_the_open_batch() {
        let log = Arc::new(FakeLog::new(numbers(0..4)));
        let handler = Arc::new(NumberHandler::new(vec![]));

        run_for(consumer(log.clone(), handler.clone()), Duration::from_secs(5)).await;

        assert!(log.commits.lock().unwrap().is_empty());
        assert_eq!(*handler.commits.lock().unwrap(), 0);
        assert_eq!(handler.handled.lock().unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_message_is_never_committed_and_redelivered() {
        let log = Arc::new(FakeLog::new(numbers(0..10)));
        let handler = Arc::new(NumberHandler::new(vec![4]));

        run_for(consumer(log.clone(), handler.clone()), Duration::from_secs(61)).await;
        assert_eq!(log.committed_offsets(), vec![0, 1, 2, 3]);

        let reopened = Arc::new(log.reopen());
        let healthy = Arc::new(NumberHandler::new(vec![]));
        run_for(consumer(reopened.clone(), healthy.clone()), Duration::from_secs(61)).await;

        assert_eq!(healthy.handled.lock().unwrap().first(), Some(&4));
        assert_eq!(reopened.committed_offsets(), (4..10).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn decode_error_is_treated_like_a_failed_handle() {
        let mut messages = numbers(0..2);
        messages.push(message(2, "Number", "not-a-number"));
        let log = Arc::new(FakeLog::new(messages));
        let handler = Arc::new(NumberHandler::new(vec![]));

        run_for(consumer(log.clone(), handler.clone()), Duration::from_secs(61)).await;

        assert_eq!(log.committed_offsets(), vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_keys_are_not_handled_and_do_not_count() {
        let mut messages = vec![message(0, "Other", "x")];
        messages.extend((1..11).map(|i| message(i, "Number", &i.to_string())));
        messages.insert(5, message(100, "Other", "y"));
        let log = Arc::new(FakeLog::new(messages));
        let handler = Arc::new(NumberHandler::new(vec![]));

        run_for(consumer(log.clone(), handler.clone()), Duration::from_secs(1)).await;

        let commits = log.commits.lock().unwrap();
        // Skipped with no open batch: committed on its own.
        assert_eq!(commits[0], vec![0]);
        // Skipped inside an open batch: rides along, ten handled trigger the flush.
        assert_eq!(commits[1].len(), 11);
        assert!(commits[1].contains(&100));
        assert_eq!(handler.handled.lock().unwrap().len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_key_or_disabled_consumer_is_inert() {
        let log = Arc::new(FakeLog::new(numbers(0..3)));
        let mut handler = NumberHandler::new(vec![]);
        handler.key.clear();
        let handler = Arc::new(handler);

        // Returns on its own, without cancellation.
        consumer(log.clone(), handler.clone())
            .run(CancellationToken::new())
            .await;
        assert!(handler.handled.lock().unwrap().is_empty());

        let mut disabled = consumer(log.clone(), Arc::new(NumberHandler::new(vec![])));
        disabled.disable();
        disabled.run(CancellationToken::new()).await;
        assert_eq!(log.queue.lock().unwrap().len(), 3);
    }
}
