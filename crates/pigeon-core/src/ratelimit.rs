use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::{errors::Error, Result};

#[derive(Clone, Debug)]
struct Bucket {
    tokens: f64,
    last_update: Instant,
}

/// Shared token bucket in front of every outbound channel call.
///
/// Starts full (`burst` tokens) and refills at `refill_per_sec`. The bucket is the only
/// shared mutable state of the dispatcher, guarded by a mutex that is never held
/// across a sleep.
#[derive(Debug)]
pub struct TokenBucket {
    max_tokens: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    pub fn new(refill_per_sec: f64, burst: u32) -> Self {
        let max_tokens = f64::from(burst.max(1));
        Self {
            max_tokens,
            refill_per_sec: refill_per_sec.max(1e-9),
            bucket: Mutex::new(Bucket {
                tokens: max_tokens,
                last_update: Instant::now(),
            }),
        }
    }

    /// Takes a token if one is available, otherwise returns how long until one is.
    pub async fn try_acquire(&self) -> std::result::Result<(), Duration> {
        let mut bucket = self.bucket.lock().await;
        let now = Instant::now();

        let elapsed = now.duration_since(bucket.last_update).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.max_tokens);
        bucket.last_update = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }

        let secs = (1.0 - bucket.tokens) / self.refill_per_sec;
        Err(Duration::from_secs_f64(secs.max(0.0)))
    }

    /// Waits for a token. Returns `Error::Cancelled` as soon as `cancel` fires.
    ///
    /// The returned flag is true when the caller had to wait.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<bool> {
        let mut waited = false;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.try_acquire().await {
                Ok(()) => return Ok(waited),
                Err(wait) => {
                    waited = true;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        _ = sleep(wait) => {}
                    }
                }
            }
        }
    }
}
