//! Runs the relay's long-lived workers under one cancellation token.

use std::future::Future;

use tokio::{
    signal::unix::{signal, SignalKind},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::Result;

pub struct Executor {
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Executor {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            tasks: Vec::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Starts `worker` on the runtime. A worker that returns before shutdown was
    /// requested is logged; the others keep running.
    pub fn spawn<F>(&mut self, name: &'static str, worker: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            worker.await;
            if !cancel.is_cancelled() {
                warn!(worker = name, "worker exited before shutdown");
            }
        });
        self.tasks.push((name, handle));
    }

    /// Waits for every worker, in the order they were spawned.
    pub async fn join(self) {
        for (name, handle) in self.tasks {
            match handle.await {
                Ok(()) => info!(worker = name, "worker stopped"),
                Err(e) => error!(worker = name, error = %e, "worker panicked"),
            }
        }
    }
}

/// Cancels `cancel` on SIGINT, SIGTERM or SIGQUIT. Returns early if it is cancelled
/// by someone else.
pub async fn shutdown_signal(cancel: CancellationToken) -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    let name = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = quit.recv() => "SIGQUIT",
    };

    info!(signal = name, "shutting down");
    cancel.cancel();
    Ok(())
}
