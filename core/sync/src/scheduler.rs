//! Sync scheduling: manual, periodic and on-demand modes.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use fieldsync_common::{Error, Result};

use crate::engine::{SyncEngine, SyncSummary};

/// When background syncs are triggered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Only explicit requests.
    Manual,
    /// After every recorded local mutation.
    OnDemand,
    /// At regular intervals.
    Periodic { interval: Duration },
}

type SyncReply = oneshot::Sender<Result<SyncSummary>>;

/// Front end of the scheduler, used to request syncs and change the mode.
pub struct SyncScheduler {
    mode: Arc<RwLock<SyncMode>>,
    mode_changed: Arc<Notify>,
    request_tx: mpsc::Sender<SyncReply>,
    shutdown: CancellationToken,
}

impl SyncScheduler {
    /// Create a scheduler for `engine`, starting in the engine's configured mode.
    pub fn new(engine: Arc<SyncEngine>) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(16);
        let mode = Arc::new(RwLock::new(engine.config().sync_mode.clone()));
        let mode_changed = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();

        let scheduler = Self {
            mode: mode.clone(),
            mode_changed: mode_changed.clone(),
            request_tx,
            shutdown: shutdown.clone(),
        };

        let handle = SyncSchedulerHandle {
            engine,
            mode,
            mode_changed,
            request_rx,
            shutdown,
        };

        (scheduler, handle)
    }

    /// Run a sync through the scheduler and wait for its result.
    pub async fn request_sync(&self) -> Result<SyncSummary> {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.request_tx
            .send(reply_tx)
            .await
            .map_err(|_| Error::Transient("Scheduler not running".to_string()))?;

        reply_rx
            .await
            .map_err(|_| Error::Transient("Scheduler stopped before replying".to_string()))?
    }

    /// Change the sync mode.
    pub async fn set_mode(&self, mode: SyncMode) {
        *self.mode.write().await = mode;
        self.mode_changed.notify_one();
    }

    /// Get current sync mode.
    pub async fn get_mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    /// Stop the background task once its current sync, if any, finishes.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Background half of the scheduler.
pub struct SyncSchedulerHandle {
    engine: Arc<SyncEngine>,
    mode: Arc<RwLock<SyncMode>>,
    mode_changed: Arc<Notify>,
    request_rx: mpsc::Receiver<SyncReply>,
    shutdown: CancellationToken,
}

impl SyncSchedulerHandle {
    /// Run the scheduler loop. Spawn this in a tokio task.
    pub async fn run(mut self) {
        info!("Sync scheduler started");

        loop {
            let mode = self.mode.read().await.clone();
            let engine = self.engine.clone();

            let periodic = async {
                match &mode {
                    SyncMode::Periodic { interval } => tokio::time::sleep(*interval).await,
                    _ => std::future::pending::<()>().await,
                }
            };
            let on_change = async {
                match &mode {
                    SyncMode::OnDemand => engine.changed().await,
                    _ => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                request = self.request_rx.recv() => match request {
                    Some(reply) => {
                        debug!("Processing sync request");
                        let result = self.engine.request_sync().await;
                        let _ = reply.send(result);
                    }
                    None => break,
                },
                _ = self.mode_changed.notified() => {
                    debug!("Sync mode changed to {:?}", *self.mode.read().await);
                }
                _ = periodic => self.background_sync("periodic").await,
                _ = on_change => self.background_sync("local change").await,
            }
        }

        info!("Sync scheduler shutting down");
    }

    async fn background_sync(&self, trigger: &str) {
        debug!("Triggering {} sync", trigger);
        match self.engine.request_sync().await {
            Ok(summary) => info!(
                "Background sync completed: {} uploaded, {} failed",
                summary.upload.confirmed,
                summary.upload.failures.len()
            ),
            Err(err) if !err.is_fatal() => debug!("Background sync skipped: {}", err),
            Err(err) => error!("Background sync failed: {}", err),
        }
    }
}
