use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use pigeon_core::{
    config::Config,
    consumer::LogConsumer,
    directory::UserDirectory,
    dispatcher::NotificationDispatcher,
    executor::{shutdown_signal, Executor},
    handlers::{notification_queue, NotificationWorker, ScoreChangedHandler, UserAuthorizedHandler},
    metrics::RelayMetrics,
};
use pigeon_kafka::{KafkaEventLog, KafkaLogoutPublisher};
use pigeon_redis::{RedisDeleteTaskSink, RedisDirectoryStore, RedisMessageLedger};
use pigeon_telegram::{
    router::{run_polling, RouterState},
    TelegramMessenger,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pigeon_core::logging::init("pigeon")?;

    let cfg = Config::load()?;
    let metrics = Arc::new(RelayMetrics::new()?);
    let cancel = CancellationToken::new();

    let redis = pigeon_redis::connect(&cfg.redis_dsn).await?;
    let store = Arc::new(RedisDirectoryStore::new(redis.clone()));
    let directory = Arc::new(UserDirectory::with_ttl(store.clone(), cfg.user_ttl));
    let ledger = Arc::new(RedisMessageLedger::new(
        redis.clone(),
        cfg.score_message_lifetime,
    ));
    let delete_tasks = Arc::new(RedisDeleteTaskSink::new(redis));

    let logout = Arc::new(KafkaLogoutPublisher::new(
        &cfg.kafka_host,
        &cfg.authorized_users_topic,
        &cfg.client_name,
        cfg.kafka_timeout,
    )?);

    let bot = pigeon_telegram::bot(&cfg.telegram_token, cfg.telegram_url.as_deref())?;
    let dispatcher = Arc::new(NotificationDispatcher::new(
        Arc::new(TelegramMessenger::new(bot.clone())),
        logout.clone(),
        metrics.clone(),
        cfg.dispatcher_settings(),
        cancel.clone(),
    ));

    // The consumers' handlers own the only senders: once both consumers stop, the
    // worker drains what is left and returns.
    let (queue, notifications) = notification_queue(cfg.notification_queue_capacity);

    let authorized = LogConsumer::new(
        cfg.authorized_users_topic.clone(),
        Arc::new(KafkaEventLog::new(
            &cfg.kafka_host,
            &cfg.client_name,
            &cfg.authorized_users_topic,
            cfg.kafka_timeout,
        )?),
        Arc::new(UserAuthorizedHandler::new(
            &cfg.client_name,
            directory.clone(),
            queue.clone(),
        )),
        cfg.consumer_settings(),
        metrics.clone(),
    );
    let scores = LogConsumer::new(
        cfg.score_changes_topic.clone(),
        Arc::new(KafkaEventLog::new(
            &cfg.kafka_host,
            &cfg.client_name,
            &cfg.score_changes_topic,
            cfg.kafka_timeout,
        )?),
        Arc::new(ScoreChangedHandler::new(queue)),
        cfg.consumer_settings(),
        metrics.clone(),
    );
    let worker = NotificationWorker::new(
        directory.clone(),
        dispatcher.clone(),
        ledger,
        delete_tasks,
        cfg.score_message_lifetime,
        metrics.clone(),
    );
    let router = Arc::new(RouterState {
        directory,
        dispatcher,
        logout,
        metrics: metrics.clone(),
    });

    let mut exec = Executor::new(cancel.clone());
    exec.spawn("authorized-users-consumer", authorized.run(cancel.clone()));
    exec.spawn("score-changes-consumer", scores.run(cancel.clone()));
    exec.spawn("notification-worker", worker.run(notifications));
    exec.spawn("telegram-updates", run_polling(bot, router, cancel.clone()));

    let signals = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal(signals.clone()).await {
            error!(error = %e, "failed to install signal handlers");
            signals.cancel();
        }
    });

    info!(client = %cfg.client_name, "pigeon started");
    exec.join().await;

    if let Err(e) = store.save().await {
        error!(error = %e, "final redis snapshot failed");
    }
    match metrics.render() {
        Ok(text) => info!("final metrics:\n{text}"),
        Err(e) => error!(error = %e, "failed to render metrics"),
    }
    info!("pigeon stopped");
    Ok(())
}
