//! Shutdown coordination for long-lived background loops
//!
//! Each loop receives a `watch::Receiver<bool>` that flips to `true` on stop.
//! Loops only check it at their own boundaries, so whatever unit of work is in
//! flight (one message, one tick) always runs to completion.

use std::future::Future;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::error;

/// Owner side of a spawned loop
pub struct TaskControl {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TaskControl {
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(body(shutdown_rx));
        Self {
            name,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Request shutdown and wait for the loop to exit. Safe to call more than
    /// once and from any task; later callers wait for the first to finish.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);

        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(task = self.name, "Background task panicked");
                }
            }
        }
    }
}

/// Resolve once shutdown is requested or the controlling side is gone
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Sleep for `delay` unless shutdown arrives first.
/// Returns true if the full delay elapsed.
pub async fn interruptible_sleep(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = wait_for_shutdown(shutdown) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
