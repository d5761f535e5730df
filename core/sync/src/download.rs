//! Download coordinator: pulls remote state and merges it with local-edit-wins.

use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fieldsync_common::{Entity, Error, Result};
use fieldsync_gateway::{DatasetSnapshot, RemoteGateway, TransferProgress};

use crate::edit_log::EditLog;
use crate::locks::KeyedLocks;
use crate::progress::ProgressBroadcaster;
use crate::store::EntityStore;

/// Outcome of applying one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSummary {
    pub received: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Remote versions ignored because a local edit is still unsynced.
    pub kept_local: usize,
    /// Remote entities without a usable identifier.
    pub invalid: usize,
}

/// Downloads the remote dataset and reconciles the entity store with it.
pub struct DownloadCoordinator {
    gateway: Arc<dyn RemoteGateway>,
    store: Arc<EntityStore>,
    log: Arc<EditLog>,
    locks: Arc<KeyedLocks>,
    progress: ProgressBroadcaster,
}

impl DownloadCoordinator {
    pub fn new(
        gateway: Arc<dyn RemoteGateway>,
        store: Arc<EntityStore>,
        log: Arc<EditLog>,
        locks: Arc<KeyedLocks>,
        progress: ProgressBroadcaster,
    ) -> Self {
        Self {
            gateway,
            store,
            log,
            locks,
            progress,
        }
    }

    /// Download and merge one snapshot as a single progress session.
    ///
    /// `cancel` interrupts the transfer only. Once the snapshot has arrived
    /// the merge runs to completion.
    ///
    /// # Errors
    /// - `Network` or `RemoteService` if the snapshot could not be fetched
    /// - `Cancelled` if `cancel` fired before the snapshot arrived
    /// - Storage errors while merging
    pub async fn run(&self, cancel: &CancellationToken) -> Result<DownloadSummary> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let session = self.progress.begin();
        session.report(Some(0.0), "Downloading dataset");

        let relay = |progress: TransferProgress| session.report(progress.fraction, progress.message);
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.gateway.download_snapshot(&relay) => result,
        };
        let snapshot = match fetched {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!("Download from {} failed: {}", self.gateway.name(), err);
                session.fail(err.to_string());
                return Err(err);
            }
        };

        session.report(None, format!("Applying {} entities", snapshot.entities.len()));
        match self.merge(snapshot).await {
            Ok(summary) => {
                session.complete(format!("Downloaded {} entities", summary.received));
                Ok(summary)
            }
            Err(err) => {
                session.fail(err.to_string());
                Err(err)
            }
        }
    }

    /// Apply a snapshot to the entity store.
    ///
    /// Remote entities overwrite local ones unless a PENDING or IN_FLIGHT
    /// edit targets them. Local entities absent remotely are kept.
    pub async fn merge(&self, snapshot: DatasetSnapshot) -> Result<DownloadSummary> {
        let mut summary = DownloadSummary {
            received: snapshot.entities.len() + snapshot.invalid,
            invalid: snapshot.invalid,
            ..Default::default()
        };

        for remote in snapshot.entities {
            let Some(id) = remote.id.clone() else {
                warn!("Ignoring remote entity without identifier");
                summary.invalid += 1;
                continue;
            };

            let _guard = self.locks.lock(id.as_str()).await;
            if self.log.has_unsynced(&id).await {
                debug!(entity = %id, "Keeping local version with unsynced edits");
                summary.kept_local += 1;
                continue;
            }

            match self.store.get(&id).await {
                Ok(local) if same_content(&local, &remote) => summary.unchanged += 1,
                Ok(_) => {
                    self.store.save(remote).await?;
                    summary.updated += 1;
                }
                Err(Error::NotFound(_)) => {
                    self.store.save(remote).await?;
                    summary.inserted += 1;
                }
                Err(err) => return Err(err),
            }
        }

        info!(
            "Merged snapshot: {} inserted, {} updated, {} unchanged, {} kept local",
            summary.inserted, summary.updated, summary.unchanged, summary.kept_local
        );
        Ok(summary)
    }
}

fn same_content(local: &Entity, remote: &Entity) -> bool {
    local.fields == remote.fields && local.geometry == remote.geometry
}
