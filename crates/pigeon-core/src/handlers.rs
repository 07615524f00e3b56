//! Stream handlers and the notification worker behind them.
//!
//! Handlers only touch the directory and enqueue; every channel call happens on the
//! single [`NotificationWorker`] draining the bounded queue. A full queue suspends
//! the consumer loop in `handle`, which is the backpressure point.
//!
//! A handler's `commit` puts a [`Notification::Flush`] marker behind its events and
//! waits for the worker to reach it, so a log position is only committed once its
//! notification went out. After a notification is dropped to cancellation every
//! later marker fails, keeping those positions uncommitted for redelivery.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::{
    compose,
    consumer::EventHandler,
    directory::{UserDirectory, UserRecord},
    dispatcher::NotificationDispatcher,
    domain::ChatId,
    errors::Error,
    events::{ScoreChangedEvent, UserAuthorizedEvent, SCORE_CHANGED_KEY, USER_AUTHORIZED_KEY},
    metrics::{ErrorKind, RelayMetrics},
    notifier::{ScoreNotifier, Transition},
    ports::{DeleteTask, DeleteTaskSink, MessageLedger},
    Result,
};

#[derive(Debug)]
pub enum Notification {
    Authorized(UserAuthorizedEvent),
    ScoreChanged(ScoreChangedEvent),
    /// Answered once everything queued before it has been processed.
    Flush(oneshot::Sender<Result<()>>),
}

pub type NotificationQueue = mpsc::Sender<Notification>;

pub fn notification_queue(capacity: usize) -> (NotificationQueue, mpsc::Receiver<Notification>) {
    mpsc::channel(capacity.max(1))
}

async fn enqueue(queue: &NotificationQueue, n: Notification) -> Result<()> {
    queue
        .send(n)
        .await
        .map_err(|_| Error::External("notification queue is closed".to_string()))
}

/// Waits until the worker has processed everything enqueued so far.
async fn flush(queue: &NotificationQueue) -> Result<()> {
    let (done, processed) = oneshot::channel();
    enqueue(queue, Notification::Flush(done)).await?;
    processed
        .await
        .map_err(|_| Error::External("notification worker stopped".to_string()))?
}

fn decode_json<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| Error::Decode(e.to_string()))
}

/// Keeps the directory in sync with authorizations of this deployment's client.
pub struct UserAuthorizedHandler {
    client_name: String,
    directory: Arc<UserDirectory>,
    queue: NotificationQueue,
}

impl UserAuthorizedHandler {
    pub fn new(client_name: &str, directory: Arc<UserDirectory>, queue: NotificationQueue) -> Self {
        Self {
            client_name: client_name.to_string(),
            directory,
            queue,
        }
    }
}

#[async_trait]
impl EventHandler for UserAuthorizedHandler {
    type Event = UserAuthorizedEvent;

    fn expected_key(&self) -> &str {
        USER_AUTHORIZED_KEY
    }

    fn decode(&self, payload: &[u8]) -> Result<UserAuthorizedEvent> {
        decode_json(payload)
    }

    async fn handle(&self, event: UserAuthorizedEvent) -> Result<()> {
        if event.client != self.client_name {
            return Ok(());
        }
        let chat_id = ChatId::parse(&event.client_user_id).ok_or_else(|| {
            Error::Decode(format!("invalid chat id {:?}", event.client_user_id))
        })?;

        self.directory
            .save(chat_id, &UserRecord::from(&event))
            .await?;
        enqueue(&self.queue, Notification::Authorized(event)).await
    }

    async fn commit(&self) -> Result<()> {
        flush(&self.queue).await?;
        self.directory.commit().await
    }
}

pub struct ScoreChangedHandler {
    queue: NotificationQueue,
}

impl ScoreChangedHandler {
    pub fn new(queue: NotificationQueue) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl EventHandler for ScoreChangedHandler {
    type Event = ScoreChangedEvent;

    fn expected_key(&self) -> &str {
        SCORE_CHANGED_KEY
    }

    fn decode(&self, payload: &[u8]) -> Result<ScoreChangedEvent> {
        decode_json(payload)
    }

    async fn handle(&self, event: ScoreChangedEvent) -> Result<()> {
        if event.student_id().is_anonymous() {
            return Ok(());
        }
        enqueue(&self.queue, Notification::ScoreChanged(event)).await
    }

    async fn commit(&self) -> Result<()> {
        flush(&self.queue).await
    }
}

pub struct NotificationWorker {
    directory: Arc<UserDirectory>,
    dispatcher: Arc<NotificationDispatcher>,
    notifier: ScoreNotifier,
    ledger: Arc<dyn MessageLedger>,
    delete_tasks: Arc<dyn DeleteTaskSink>,
    message_lifetime: Duration,
    metrics: Arc<RelayMetrics>,
}

impl NotificationWorker {
    pub fn new(
        directory: Arc<UserDirectory>,
        dispatcher: Arc<NotificationDispatcher>,
        ledger: Arc<dyn MessageLedger>,
        delete_tasks: Arc<dyn DeleteTaskSink>,
        message_lifetime: Duration,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            directory,
            notifier: ScoreNotifier::new(dispatcher.clone()),
            dispatcher,
            ledger,
            delete_tasks,
            message_lifetime,
            metrics,
        }
    }

    /// Drains the queue until every sender is gone.
    pub async fn run(self, mut queue: mpsc::Receiver<Notification>) {
        info!("notification worker started");
        let mut interrupted = false;
        while let Some(notification) = queue.recv().await {
            if let Notification::Flush(done) = notification {
                let outcome = if interrupted {
                    Err(Error::Cancelled)
                } else {
                    Ok(())
                };
                let _ = done.send(outcome);
                continue;
            }
            if let Err(e) = self.process(notification).await {
                if e.is_cancelled() {
                    interrupted = true;
                    debug!("notification dropped during shutdown, its position stays uncommitted");
                } else {
                    self.metrics.error(ErrorKind::OnError);
                    error!(error = %e, "notification failed");
                }
            }
        }
        info!("notification worker done");
    }

    async fn process(&self, notification: Notification) -> Result<()> {
        match notification {
            Notification::Authorized(event) => self.user_authorized(&event).await,
            Notification::ScoreChanged(event) => self.score_changed(&event).await,
            Notification::Flush(done) => {
                let _ = done.send(Ok(()));
                Ok(())
            }
        }
    }

    async fn user_authorized(&self, event: &UserAuthorizedEvent) -> Result<()> {
        let Some(chat_id) = ChatId::parse(&event.client_user_id) else {
            return Ok(());
        };
        let (text, opts) = if event.student_id().is_anonymous() {
            compose::logout_finished()
        } else {
            compose::welcome_authorized(&UserRecord::from(event))
        };
        self.dispatcher.send(chat_id, &text, &opts).await?;
        Ok(())
    }

    async fn score_changed(&self, event: &ScoreChangedEvent) -> Result<()> {
        let chats = self.directory.lookup_chats(event.student_id()).await?;
        for chat_id in chats {
            match self.notify_chat(chat_id, event).await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    self.metrics.error(ErrorKind::OnError);
                    warn!(chat = %chat_id, score = event.id, error = %e, "score notification failed");
                }
            }
        }
        Ok(())
    }

    async fn notify_chat(&self, chat_id: ChatId, event: &ScoreChangedEvent) -> Result<()> {
        let discipline = event.discipline_id;
        let previous = self.ledger.get(chat_id, discipline).await?;

        match self.notifier.apply(chat_id, previous, event).await? {
            Transition::Created(message_id) => {
                self.ledger.put(chat_id, discipline, message_id).await?;
                let scheduled_at = chrono::Utc::now().timestamp()
                    + i64::try_from(self.message_lifetime.as_secs()).unwrap_or(i64::MAX / 2);
                self.delete_tasks
                    .schedule(DeleteTask {
                        scheduled_at,
                        message_id: message_id.0,
                        chat_id: chat_id.0,
                    })
                    .await?;
            }
            Transition::Deleted | Transition::Evicted => {
                if previous.is_some() {
                    self.ledger.clear(chat_id, discipline).await?;
                }
            }
            Transition::Edited(_) | Transition::Unchanged => {}
        }
        Ok(())
    }
}
