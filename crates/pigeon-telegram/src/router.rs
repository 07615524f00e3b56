//! Inbound update loop: the few chat commands the relay answers itself.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use teloxide::{
    dispatching::{Dispatcher, ShutdownToken},
    dptree,
    prelude::*,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pigeon_core::{
    compose::{self, RESET_COMMAND},
    directory::UserDirectory,
    dispatcher::NotificationDispatcher,
    domain::ChatId,
    metrics::{ErrorKind, RelayMetrics},
    ports::LogoutPublisher,
};

pub struct RouterState {
    pub directory: Arc<UserDirectory>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub logout: Arc<dyn LogoutPublisher>,
    pub metrics: Arc<RelayMetrics>,
}

/// Polls for updates until `cancel` fires.
pub async fn run_polling(bot: Bot, state: Arc<RouterState>, cancel: CancellationToken) {
    match bot.get_me().await {
        Ok(me) => info!(username = %me.username(), "telegram bot started"),
        Err(e) => warn!(error = %e, "get_me failed"),
    }

    let handler = Update::filter_message().endpoint(handle_message);
    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build();

    let token = dispatcher.shutdown_token();
    let stopper = stop_on_cancel(cancel, token);

    dispatcher.dispatch().await;
    // dispatch() may return on its own; nothing is left to stop then.
    stopper.abort();
    info!("telegram update loop done");
}

type Stopped<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Something that can stop a running update loop.
trait Stop: Send + Sync + 'static {
    /// `None` while the loop is not running yet.
    fn try_stop(&self) -> Option<Stopped<'_>>;
}

impl Stop for ShutdownToken {
    fn try_stop(&self) -> Option<Stopped<'_>> {
        self.shutdown().ok().map(|done| Box::pin(done) as Stopped<'_>)
    }
}

/// Stops the loop once `cancel` fires, retrying while it has not started yet.
fn stop_on_cancel(cancel: CancellationToken, stop: impl Stop) -> JoinHandle<()> {
    tokio::spawn(async move {
        cancel.cancelled().await;
        loop {
            if let Some(done) = stop.try_stop() {
                done.await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
}

async fn handle_message(msg: Message, state: Arc<RouterState>) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let chat_id = ChatId(msg.chat.id.0);

    if let Err(e) = respond(&state, chat_id, text).await {
        if e.is_cancelled() {
            debug!(chat = %chat_id, "reply dropped during shutdown");
        } else {
            state.metrics.error(ErrorKind::OnUpdate);
            warn!(chat = %chat_id, error = %e, "failed to handle update");
        }
    }
    Ok(())
}

/// `/cmd@botname args` → `"/cmd"`.
fn command(text: &str) -> String {
    let first = text.split_whitespace().next().unwrap_or("");
    first.split('@').next().unwrap_or("").to_lowercase()
}

async fn respond(state: &RouterState, chat_id: ChatId, text: &str) -> pigeon_core::Result<()> {
    if command(text) == RESET_COMMAND {
        // The logout notice follows once the event comes back from the log.
        return state.logout.logout(chat_id).await;
    }

    let user = state.directory.lookup(chat_id).await?;
    let (reply, opts) = if user.student_id().is_anonymous() {
        compose::welcome_anonymous()
    } else {
        compose::welcome_authorized(&user)
    };
    state.dispatcher.send(chat_id, &reply, &opts).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pigeon_core::{
        directory::UserRecord,
        dispatcher::DispatcherSettings,
        domain::{MessageId, MessageRef},
        messaging::{
            port::{ChannelResult, MessagingPort},
            types::SendOptions,
        },
        ports::{DirectoryStore, StoreWrite},
        Result,
    };
    use prost::Message as _;
    use std::{collections::HashMap, sync::Mutex};

    #[derive(Default)]
    struct Store {
        values: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl DirectoryStore for Store {
        async fn get_refresh(&self, key: &str, _ttl: Duration) -> Result<Option<Vec<u8>>> {
            Ok(self.values.lock().unwrap().get(key).cloned())
        }
        async fn members(&self, _key: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn apply(&self, _writes: Vec<StoreWrite>) -> Result<()> {
            Ok(())
        }
        async fn persist(&self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Replies {
        sent: Mutex<Vec<(ChatId, String)>>,
    }

    #[async_trait]
    impl MessagingPort for Replies {
        async fn send(&self, chat_id: ChatId, text: &str, _: &SendOptions) -> ChannelResult<MessageRef> {
            self.sent.lock().unwrap().push((chat_id, text.to_string()));
            Ok(MessageRef {
                chat_id,
                message_id: MessageId(1),
            })
        }
        async fn edit(&self, _: MessageRef, _: &str, _: &SendOptions) -> ChannelResult<()> {
            Ok(())
        }
        async fn delete(&self, _: MessageRef) -> ChannelResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Logouts {
        chats: Mutex<Vec<ChatId>>,
    }

    #[async_trait]
    impl LogoutPublisher for Logouts {
        async fn logout(&self, chat_id: ChatId) -> Result<()> {
            self.chats.lock().unwrap().push(chat_id);
            Ok(())
        }
    }

    fn state(store: Arc<Store>) -> (RouterState, Arc<Replies>, Arc<Logouts>) {
        let replies = Arc::new(Replies::default());
        let logouts = Arc::new(Logouts::default());
        let metrics = Arc::new(RelayMetrics::new().unwrap());
        let dispatcher = NotificationDispatcher::new(
            replies.clone(),
            logouts.clone(),
            metrics.clone(),
            DispatcherSettings::default(),
            CancellationToken::new(),
        );
        let state = RouterState {
            directory: Arc::new(UserDirectory::new(store)),
            dispatcher: Arc::new(dispatcher),
            logout: logouts.clone(),
            metrics,
        };
        (state, replies, logouts)
    }

    /// Refuses to stop until it has been asked `ready_after` times.
    struct SlowStart {
        ready_after: usize,
        asked: Arc<Mutex<usize>>,
    }

    impl Stop for SlowStart {
        fn try_stop(&self) -> Option<Stopped<'_>> {
            let mut asked = self.asked.lock().unwrap();
            *asked += 1;
            (*asked >= self.ready_after).then(|| Box::pin(async {}) as Stopped<'_>)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_retried_until_the_loop_runs() {
        let cancel = CancellationToken::new();
        let asked = Arc::new(Mutex::new(0));
        let stopper = stop_on_cancel(
            cancel.clone(),
            SlowStart {
                ready_after: 3,
                asked: asked.clone(),
            },
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*asked.lock().unwrap(), 0);

        cancel.cancel();
        stopper.await.unwrap();
        assert_eq!(*asked.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_stopper_gives_up_retrying() {
        let cancel = CancellationToken::new();
        let stopper = stop_on_cancel(
            cancel.clone(),
            SlowStart {
                ready_after: usize::MAX,
                asked: Arc::default(),
            },
        );
        cancel.cancel();
        tokio::time::sleep(Duration::from_secs(1)).await;

        stopper.abort();
        assert!(stopper.await.unwrap_err().is_cancelled());
    }

    #[test]
    fn parses_commands_with_bot_suffix() {
        assert_eq!(command("/reset@pigeon_bot now"), "/reset");
        assert_eq!(command("/LIST"), "/list");
        assert_eq!(command("hello"), "hello");
        assert_eq!(command(""), "");
    }

    #[tokio::test]
    async fn reset_publishes_a_logout_without_replying() {
        let (state, replies, logouts) = state(Arc::new(Store::default()));

        respond(&state, ChatId(42), "/reset").await.unwrap();

        assert_eq!(*logouts.chats.lock().unwrap(), vec![ChatId(42)]);
        assert!(replies.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_chat_is_asked_to_authorize() {
        let (state, replies, _) = state(Arc::new(Store::default()));

        respond(&state, ChatId(42), "/start").await.unwrap();

        let sent = replies.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("авторизацію"));
    }

    #[tokio::test]
    async fn known_chat_is_greeted_by_name() {
        let store = Arc::new(Store::default());
        let record = UserRecord {
            id: 5,
            first_name: "Олена".to_string(),
            ..Default::default()
        };
        store
            .values
            .lock()
            .unwrap()
            .insert("42".to_string(), record.encode_to_vec());
        let (state, replies, _) = state(store);

        respond(&state, ChatId(42), "/list").await.unwrap();

        assert!(replies.sent.lock().unwrap()[0].1.contains("Олена"));
    }
}
