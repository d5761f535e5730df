//! Sync orchestrator: the single entry point for local mutations and sync sessions.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify, OwnedMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fieldsync_common::{EditId, Entity, EntityId, Error, LocalEdit, Result};
use fieldsync_gateway::RemoteGateway;
use fieldsync_storage::KvStore;

use crate::config::SyncConfig;
use crate::download::{DownloadCoordinator, DownloadSummary};
use crate::edit_log::{EditCounts, EditLog};
use crate::locks::KeyedLocks;
use crate::progress::{DownloadProgress, ProgressBroadcaster};
use crate::retry::RetryExecutor;
use crate::store::{EntityStore, IdGenerator, UuidIdGenerator};
use crate::upload::{UploadCoordinator, UploadSummary};

/// Phase of the sync state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncPhase {
    Idle,
    Uploading,
    Downloading,
}

impl SyncPhase {
    fn as_u8(self) -> u8 {
        match self {
            SyncPhase::Idle => 0,
            SyncPhase::Uploading => 1,
            SyncPhase::Downloading => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => SyncPhase::Uploading,
            2 => SyncPhase::Downloading,
            _ => SyncPhase::Idle,
        }
    }
}

/// Result of one sync session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub session: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    /// Stale IN_FLIGHT edits demoted to PENDING before uploading.
    pub reconciled: usize,
    pub upload: UploadSummary,
    pub download: Option<DownloadSummary>,
    pub download_error: Option<String>,
}

impl SyncSummary {
    /// Whether both phases reached the server and the download was applied.
    ///
    /// Per-edit failures are reported in `upload.failures` and do not make
    /// the session unsuccessful.
    pub fn is_success(&self) -> bool {
        self.upload.transport_error.is_none() && self.download_error.is_none()
    }
}

/// Snapshot of the engine for status displays.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub is_syncing: bool,
    pub edits: EditCounts,
    pub entities: usize,
    pub last_sync: Option<SyncSummary>,
}

/// Resets the engine to IDLE when a session ends, however it ends.
struct SessionGuard<'a> {
    engine: &'a SyncEngine,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.engine.current.lock().unwrap_or_else(|p| p.into_inner()).take();
        self.engine.set_phase(SyncPhase::Idle);
    }
}

/// Offline-first sync engine.
///
/// Local mutations go through [`SyncEngine::save_entity`] and
/// [`SyncEngine::delete_entity`], which log an edit and update the entity
/// store atomically per identifier. [`SyncEngine::request_sync`] runs one
/// session: upload, then download.
pub struct SyncEngine {
    store: Arc<EntityStore>,
    log: Arc<EditLog>,
    gateway: Arc<dyn RemoteGateway>,
    locks: Arc<KeyedLocks>,
    progress: ProgressBroadcaster,
    uploader: UploadCoordinator,
    downloader: DownloadCoordinator,
    config: SyncConfig,
    phase: AtomicU8,
    current: Mutex<Option<CancellationToken>>,
    last_summary: RwLock<Option<SyncSummary>>,
    changes: Notify,
}

impl SyncEngine {
    /// Open the engine over a key-value store and a remote gateway.
    ///
    /// Every IN_FLIGHT edit left by a previous process is returned to PENDING.
    pub async fn open(
        kv: Arc<dyn KvStore>,
        gateway: Arc<dyn RemoteGateway>,
        config: SyncConfig,
    ) -> Result<Self> {
        Self::open_with_generator(kv, gateway, config, Arc::new(UuidIdGenerator)).await
    }

    /// Like [`SyncEngine::open`] with a custom identifier source for new entities.
    pub async fn open_with_generator(
        kv: Arc<dyn KvStore>,
        gateway: Arc<dyn RemoteGateway>,
        config: SyncConfig,
        ids: Arc<dyn IdGenerator>,
    ) -> Result<Self> {
        let store = Arc::new(EntityStore::open_with_generator(kv.clone(), ids).await?);
        let log = Arc::new(EditLog::open(kv, config.retry.clone()).await?);

        let reconciled = log.reconcile_in_flight(Duration::ZERO).await?;
        if reconciled > 0 {
            info!("Startup reconciliation returned {} edits to pending", reconciled);
        }

        let locks = Arc::new(KeyedLocks::new());
        let progress = ProgressBroadcaster::new(config.progress_capacity);
        let uploader = UploadCoordinator::new(
            gateway.clone(),
            store.clone(),
            log.clone(),
            locks.clone(),
            config.clone(),
        );
        let downloader = DownloadCoordinator::new(
            gateway.clone(),
            store.clone(),
            log.clone(),
            locks.clone(),
            progress.clone(),
        );

        Ok(Self {
            store,
            log,
            gateway,
            locks,
            progress,
            uploader,
            downloader,
            config,
            phase: AtomicU8::new(SyncPhase::Idle.as_u8()),
            current: Mutex::new(None),
            last_summary: RwLock::new(None),
            changes: Notify::new(),
        })
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Get the entity store.
    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    /// Get the edit log.
    pub fn edit_log(&self) -> &Arc<EditLog> {
        &self.log
    }

    /// Current phase.
    pub fn phase(&self) -> SyncPhase {
        SyncPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Whether a sync session is running.
    pub fn is_syncing(&self) -> bool {
        self.phase() != SyncPhase::Idle
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.phase.store(phase.as_u8(), Ordering::SeqCst);
    }

    /// Subscribe to download progress. Only future events are delivered.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<DownloadProgress> {
        self.progress.subscribe()
    }

    /// Resolves after the next recorded local mutation.
    pub async fn changed(&self) {
        self.changes.notified().await;
    }

    /// Record a local create or update.
    ///
    /// Assigns an identifier if absent. A local identifier that has since
    /// been replaced by a server identifier is redirected to it. The edit is
    /// durably logged before the entity store changes.
    ///
    /// # Errors
    /// - Storage errors if either write fails
    pub async fn save_entity(&self, mut entity: Entity) -> Result<Entity> {
        let (id, _guard) = self.lock_entity(&mut entity).await;
        entity.updated_at = Utc::now();

        let edit = if self.store.contains(&id).await {
            LocalEdit::update(entity.clone())?
        } else {
            LocalEdit::create(entity.clone())?
        };
        let edit = self.log.append(edit).await?;
        let saved = self.store.save(entity).await?;

        debug!(entity = %id, edit = %edit.id, kind = ?edit.kind, "Local mutation recorded");
        self.changes.notify_one();
        Ok(saved)
    }

    /// Record a local delete. Deleting an unknown entity is a no-op.
    pub async fn delete_entity(&self, id: &EntityId) -> Result<()> {
        let mut target = Entity::with_id(id.clone());
        let (current, _guard) = self.lock_entity(&mut target).await;
        let id = &current;
        if !self.store.contains(id).await {
            debug!(entity = %id, "Delete of unknown entity ignored");
            return Ok(());
        }

        let edit = self.log.append(LocalEdit::delete(id.clone())).await?;
        self.store.delete(id).await?;

        debug!(entity = %id, edit = %edit.id, "Local delete recorded");
        self.changes.notify_one();
        Ok(())
    }

    /// Fetch an entity, following a server-assigned identifier change.
    pub async fn get_entity(&self, id: &EntityId) -> Result<Entity> {
        let id = self.store.resolve(id).await;
        self.store.get(&id).await
    }

    /// Lock the current identifier of `entity`, assigning one if absent.
    ///
    /// Retries if the identifier was re-keyed while waiting for its lock.
    async fn lock_entity(&self, entity: &mut Entity) -> (EntityId, OwnedMutexGuard<()>) {
        loop {
            let id = self.store.assign_id(entity).await;
            let guard = self.locks.lock(id.as_str()).await;
            if self.store.resolve(&id).await == id {
                return (id, guard);
            }
        }
    }

    /// All entities ordered by identifier.
    pub async fn list_entities(&self) -> Vec<Entity> {
        self.store.list().await
    }

    /// Terminally failed edits awaiting user attention.
    pub async fn failed_edits(&self) -> Vec<LocalEdit> {
        self.log.failed_edits().await
    }

    /// Queue a failed edit for another upload.
    pub async fn requeue_failed(&self, id: &EditId) -> Result<()> {
        self.log.requeue_failed(id).await?;
        self.changes.notify_one();
        Ok(())
    }

    /// Drop an edit without uploading it. The local entity is left as is.
    pub async fn discard_edit(&self, id: &EditId) -> Result<()> {
        self.log.discard(id).await
    }

    /// Engine status.
    pub async fn status(&self) -> SyncStatus {
        let phase = self.phase();
        SyncStatus {
            phase,
            is_syncing: phase != SyncPhase::Idle,
            edits: self.log.counts().await,
            entities: self.store.len().await,
            last_sync: self.last_summary.read().await.clone(),
        }
    }

    /// Cancel the running session, if any. Returns whether one was running.
    pub fn cancel(&self) -> bool {
        let current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        match current.as_ref() {
            Some(token) => {
                info!("Cancelling sync session");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run one sync session: upload pending edits, then download and merge.
    ///
    /// # Errors
    /// - `Busy` if a session is already running; the running one is unaffected
    /// - `Cancelled` if [`SyncEngine::cancel`] was called
    /// - Storage errors from the edit log or entity store
    pub async fn request_sync(&self) -> Result<SyncSummary> {
        self.request_sync_with(CancellationToken::new()).await
    }

    /// Like [`SyncEngine::request_sync`], also stopping when `cancel` fires.
    pub async fn request_sync_with(&self, cancel: CancellationToken) -> Result<SyncSummary> {
        if self
            .phase
            .compare_exchange(
                SyncPhase::Idle.as_u8(),
                SyncPhase::Uploading.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            debug!("Sync requested while {:?}", self.phase());
            return Err(Error::Busy);
        }

        *self.current.lock().unwrap_or_else(|p| p.into_inner()) = Some(cancel.clone());
        let _guard = SessionGuard { engine: self };

        let result = self.run_session(&cancel).await;
        match &result {
            Ok(summary) => {
                *self.last_summary.write().await = Some(summary.clone());
            }
            Err(Error::Cancelled) => info!("Sync cancelled"),
            Err(err) => warn!("Sync failed: {}", err),
        }
        result
    }

    async fn run_session(&self, cancel: &CancellationToken) -> Result<SyncSummary> {
        let session = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(%session, "Sync started against {}", self.gateway.name());

        let reconciled = self
            .log
            .reconcile_in_flight(self.config.in_flight_timeout)
            .await?;

        let upload = self.uploader.run(cancel).await?;

        self.set_phase(SyncPhase::Downloading);
        let executor = RetryExecutor::new(self.config.download_retry());
        let download = executor
            .execute_with_condition(
                || self.downloader.run(cancel),
                |err| err.is_retriable() && !cancel.is_cancelled(),
            )
            .await;

        let (download, download_error) = match download {
            Ok(summary) => (Some(summary), None),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(err @ (Error::Network(_) | Error::RemoteService { .. } | Error::Transient(_))) => {
                (None, Some(err.to_string()))
            }
            Err(err) => return Err(err),
        };

        let summary = SyncSummary {
            session,
            started_at,
            duration: clock.elapsed(),
            reconciled,
            upload,
            download,
            download_error,
        };
        info!(
            %session,
            "Sync finished in {:?}: {} uploaded, {} failed, download {}",
            summary.duration,
            summary.upload.confirmed,
            summary.upload.failures.len(),
            if summary.download_error.is_none() { "ok" } else { "failed" }
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SequentialIdGenerator;
    use fieldsync_gateway::MemoryGateway;
    use fieldsync_storage::MemoryKv;

    async fn engine(gateway: Arc<MemoryGateway>) -> SyncEngine {
        SyncEngine::open_with_generator(
            Arc::new(MemoryKv::new()),
            gateway,
            SyncConfig::default(),
            Arc::new(SequentialIdGenerator::new()),
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_phase_encoding() {
        for phase in [SyncPhase::Idle, SyncPhase::Uploading, SyncPhase::Downloading] {
            assert_eq!(SyncPhase::from_u8(phase.as_u8()), phase);
        }
    }

    #[tokio::test]
    async fn test_save_logs_create_then_update() {
        let engine = engine(Arc::new(MemoryGateway::new())).await;

        let saved = engine
            .save_entity(Entity::new().with_field("crew", "A"))
            .await
            .unwrap();
        let id = saved.id.clone().unwrap();
        assert_eq!(id.as_str(), "local-1");

        engine
            .save_entity(saved.with_field("crew", "B"))
            .await
            .unwrap();

        let kinds: Vec<_> = engine
            .edit_log()
            .pending_edits()
            .await
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![fieldsync_common::EditKind::Create, fieldsync_common::EditKind::Update]
        );
    }

    #[tokio::test]
    async fn test_delete_unknown_entity_is_noop() {
        let engine = engine(Arc::new(MemoryGateway::new())).await;
        engine
            .delete_entity(&EntityId::new("ghost").unwrap())
            .await
            .unwrap();
        assert_eq!(engine.status().await.edits.total(), 0);
    }

    #[tokio::test]
    async fn test_status_after_sync() {
        let engine = engine(Arc::new(MemoryGateway::new())).await;
        engine.save_entity(Entity::new()).await.unwrap();

        let before = engine.status().await;
        assert_eq!(before.phase, SyncPhase::Idle);
        assert_eq!(before.edits.pending, 1);

        let summary = engine.request_sync().await.unwrap();
        assert!(summary.is_success());

        let after = engine.status().await;
        assert!(!after.is_syncing);
        assert_eq!(after.edits.total(), 0);
        assert_eq!(after.entities, 1);
        assert_eq!(after.last_sync.unwrap().session, summary.session);
    }

    #[tokio::test]
    async fn test_cancel_without_session() {
        let engine = engine(Arc::new(MemoryGateway::new())).await;
        assert!(!engine.cancel());
    }

    #[tokio::test]
    async fn test_mutation_wakes_waiters() {
        let engine = Arc::new(engine(Arc::new(MemoryGateway::new())).await);
        let waiter = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.changed().await })
        };
        tokio::task::yield_now().await;

        engine.save_entity(Entity::new()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
