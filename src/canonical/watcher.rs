//! Canonical Watcher
//!
//! Background task that polls the durable version and reloads the store
//! when another process has promoted mappings. A failed poll leaves the
//! current snapshot in place; the store's staleness tolerance decides when
//! lookups stop trusting it.

use crate::canonical::store::CanonicalStore;
use crate::error::{NqlError, Result};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

enum WatcherMessage {
    /// Poll immediately; replies with whether a reload happened.
    Refresh(oneshot::Sender<Result<bool>>),
    Shutdown,
}

pub struct CanonicalWatcher {
    sender: mpsc::Sender<WatcherMessage>,
    handle: JoinHandle<()>,
}

impl CanonicalWatcher {
    /// Spawn the polling loop on the current tokio runtime.
    pub fn spawn(store: CanonicalStore, poll_interval: Duration) -> Self {
        let (sender, mut receiver) = mpsc::channel(8);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = poll_interval.as_millis() as u64, "Canonical watcher started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = poll_once(&store).await {
                            warn!(error = %err, "Canonical version poll failed");
                        }
                    }
                    message = receiver.recv() => match message {
                        Some(WatcherMessage::Refresh(reply)) => {
                            let _ = reply.send(poll_once(&store).await);
                        }
                        Some(WatcherMessage::Shutdown) | None => break,
                    }
                }
            }
            info!("Canonical watcher stopped");
        });
        Self { sender, handle }
    }

    /// Force a poll and wait for it.
    pub async fn refresh_now(&self) -> Result<bool> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(WatcherMessage::Refresh(reply))
            .await
            .map_err(|_| NqlError::unavailable("canonical watcher stopped"))?;
        response
            .await
            .map_err(|_| NqlError::unavailable("canonical watcher dropped refresh"))?
    }

    pub async fn shutdown(self) {
        let _ = self.sender.send(WatcherMessage::Shutdown).await;
        if let Err(err) = self.handle.await {
            warn!(error = %err, "Canonical watcher task ended abnormally");
        }
    }
}

/// Returns true when a newer version was loaded.
async fn poll_once(store: &CanonicalStore) -> Result<bool> {
    let durable = store.durable_version_with_timeout().await?;
    let current = store.version()?;
    if durable <= current {
        store.mark_fresh();
        return Ok(false);
    }
    debug!(durable, current, "Canonical version advanced");
    store.reload_with_timeout().await?;
    Ok(true)
}
