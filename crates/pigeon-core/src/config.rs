use std::{env, path::Path, time::Duration};

use crate::{
    consumer::ConsumerSettings, dispatcher::DispatcherSettings, errors::Error, Result,
};

const DEFAULT_CLIENT_NAME: &str = "telegram-app";
const DAY: u64 = 24 * 60 * 60;

/// Typed configuration for the relay process.
#[derive(Clone, Debug)]
pub struct Config {
    // Deployment
    pub client_name: String,

    // Kafka
    pub kafka_host: String,
    pub kafka_timeout: Duration,
    pub authorized_users_topic: String,
    pub score_changes_topic: String,
    pub commit_threshold: usize,
    pub commit_interval: Duration,

    // Redis
    pub redis_dsn: String,
    pub user_ttl: Duration,

    // Telegram
    pub telegram_token: String,
    pub telegram_url: Option<String>,
    pub rate_limit_per_second: f64,
    pub rate_limit_burst: u32,
    pub send_max_attempts: u32,
    pub score_message_lifetime: Duration,

    pub notification_queue_capacity: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"))?;

        let kafka_host = required("KAFKA_HOST")?;
        let redis_dsn = required("REDIS_DSN")?;
        let telegram_token = required("TELEGRAM_TOKEN")?;

        let client_name = env_str("CLIENT_NAME")
            .and_then(non_empty)
            .unwrap_or_else(|| DEFAULT_CLIENT_NAME.to_string());

        Ok(Self {
            client_name,
            kafka_host,
            kafka_timeout: Duration::from_secs(env_u64("KAFKA_TIMEOUT").unwrap_or(10).max(1)),
            authorized_users_topic: env_str("AUTHORIZED_USERS_TOPIC")
                .and_then(non_empty)
                .unwrap_or_else(|| "authorized_users".to_string()),
            score_changes_topic: env_str("SCORES_CHANGES_TOPIC")
                .and_then(non_empty)
                .unwrap_or_else(|| "scores_changes_feed".to_string()),
            commit_threshold: env_usize("COMMIT_THRESHOLD").unwrap_or(10).max(1),
            commit_interval: Duration::from_secs(env_u64("COMMIT_INTERVAL").unwrap_or(60).max(1)),
            redis_dsn,
            user_ttl: Duration::from_secs(env_u64("USER_TTL_DAYS").unwrap_or(210) * DAY),
            telegram_token,
            telegram_url: env_str("TELEGRAM_URL").and_then(non_empty),
            rate_limit_per_second: env_f64("RATE_LIMIT_PER_SECOND")
                .filter(|v| *v > 0.0)
                .unwrap_or(1.0),
            rate_limit_burst: env_u32("RATE_LIMIT_BURST").unwrap_or(30).max(1),
            send_max_attempts: env_u32("SEND_MAX_ATTEMPTS").unwrap_or(5).max(1),
            score_message_lifetime: Duration::from_secs(
                env_u64("SCORE_MESSAGE_LIFETIME").unwrap_or(47) * 60 * 60,
            ),
            notification_queue_capacity: env_usize("NOTIFICATION_QUEUE_CAPACITY")
                .unwrap_or(100)
                .max(1),
        })
    }

    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            commit_threshold: self.commit_threshold,
            commit_interval: self.commit_interval,
        }
    }

    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            rate_per_second: self.rate_limit_per_second,
            burst: self.rate_limit_burst,
            max_attempts: self.send_max_attempts,
        }
    }
}

fn load_dotenv_if_present(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    // dotenvy never overrides variables that are already set.
    dotenvy::from_path(path)
        .map(|_| ())
        .map_err(|e| Error::Config(format!("error loading {}: {e}", path.display())))
}

fn required(key: &str) -> Result<String> {
    env_str(key)
        .and_then(non_empty)
        .ok_or_else(|| Error::Config(format!("{key} environment variable is required")))
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_f64(key: &str) -> Option<f64> {
    env_str(key).and_then(|s| s.trim().parse::<f64>().ok())
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_empty_trims_and_rejects_blank() {
        assert_eq!(non_empty("  x ".to_string()), Some("x".to_string()));
        assert_eq!(non_empty("   ".to_string()), None);
    }

    #[test]
    fn missing_dotenv_is_not_an_error() {
        let path = std::path::PathBuf::from(format!("/tmp/pigeon-env-{}", std::process::id()));
        assert!(load_dotenv_if_present(&path).is_ok());
    }

    #[test]
    fn required_reports_the_key() {
        let err = required("PIGEON_TEST_SURELY_UNSET_KEY").unwrap_err();
        assert!(err.to_string().contains("PIGEON_TEST_SURELY_UNSET_KEY"));
    }
}
