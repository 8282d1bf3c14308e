//! Background removal of failure counters after a successful read.
//!
//! The read path hands the id to the worker and returns immediately. Each
//! deletion runs under its own timeout, and at most `max_concurrent` run at
//! once; while that many are in flight the worker stops draining the queue.
//! Failures are logged and dropped, since a stale counter expires with its
//! TTL anyway.

use super::lifecycle::SecretManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Sender side of the cleanup worker.
#[derive(Debug, Clone)]
pub struct CleanupHandle {
    tx: mpsc::Sender<String>,
}

impl CleanupHandle {
    /// Spawn the worker. It stops once every handle has been dropped.
    pub fn spawn(
        manager: Arc<SecretManager>,
        timeout: Duration,
        queue_size: usize,
        max_concurrent: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let worker = tokio::spawn(run_worker(rx, manager, timeout, max_concurrent.max(1)));
        (Self { tx }, worker)
    }

    /// Queue the counter of `id` for deletion without waiting.
    ///
    /// Returns false if the queue is full or the worker is gone.
    pub fn schedule(&self, id: &str) -> bool {
        match self.tx.try_send(id.to_string()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(id, "Cleanup queue full, leaving attempts counter to expire");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(id, "Cleanup worker stopped, leaving attempts counter to expire");
                false
            }
        }
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<String>,
    manager: Arc<SecretManager>,
    timeout: Duration,
    max_concurrent: usize,
) {
    info!(max_concurrent, "Attempts counter cleanup worker started");
    let mut in_flight = JoinSet::new();

    while let Some(id) = rx.recv().await {
        while in_flight.try_join_next().is_some() {}
        while in_flight.len() >= max_concurrent {
            in_flight.join_next().await;
        }

        let manager = manager.clone();
        in_flight.spawn(async move {
            match tokio::time::timeout(timeout, manager.clear_failure_counter(&id)).await {
                Ok(()) => debug!(id = %id, "Attempts counter cleared"),
                Err(_) => warn!(id = %id, timeout_ms = timeout.as_millis() as u64, "Attempts counter cleanup timed out"),
            }
        });
    }

    while in_flight.join_next().await.is_some() {}
    info!("Attempts counter cleanup worker stopped");
}
