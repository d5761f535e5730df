//! Upload coordinator: drains the edit log through the remote gateway.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fieldsync_common::{EditId, EditState, EntityId, Error, LocalEdit, Result};
use fieldsync_gateway::{EditOutcome, RemoteGateway, UploadOutcome};

use crate::config::SyncConfig;
use crate::edit_log::EditLog;
use crate::locks::KeyedLocks;
use crate::store::EntityStore;

/// An edit that will not be retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EditFailure {
    pub edit_id: EditId,
    pub target: EntityId,
    pub reason: String,
    /// Refused by server-side validation, as opposed to retries exhausted.
    pub rejected: bool,
}

impl EditFailure {
    /// The failure as an error of the common taxonomy.
    pub fn to_error(&self) -> Error {
        if self.rejected {
            Error::ValidationRejected(format!("{}: {}", self.target, self.reason))
        } else {
            Error::Transient(format!("{}: {}", self.target, self.reason))
        }
    }
}

/// Outcome of one upload phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSummary {
    /// Edits submitted to the gateway, counting each retry.
    pub attempted: usize,
    pub confirmed: usize,
    /// Retriable failures returned to PENDING with a backoff deadline.
    pub retry_scheduled: usize,
    /// Edits returned to PENDING after a transport failure.
    pub released: usize,
    /// Per-edit permanent failures.
    pub failures: Vec<EditFailure>,
    /// Set when a whole batch failed to reach the server.
    pub transport_error: Option<String>,
}

/// How a batch left the dispatch stream.
enum Sent {
    Done(Result<UploadOutcome>),
    /// The request was in progress when the session was cancelled.
    Interrupted,
    /// Cancelled before the request was made.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoundEnd {
    Drained,
    Aborted,
    Cancelled,
}

/// Submits PENDING edits to the remote service in FIFO order.
pub struct UploadCoordinator {
    gateway: Arc<dyn RemoteGateway>,
    store: Arc<EntityStore>,
    log: Arc<EditLog>,
    locks: Arc<KeyedLocks>,
    config: SyncConfig,
}

impl UploadCoordinator {
    pub fn new(
        gateway: Arc<dyn RemoteGateway>,
        store: Arc<EntityStore>,
        log: Arc<EditLog>,
        locks: Arc<KeyedLocks>,
        config: SyncConfig,
    ) -> Self {
        Self {
            gateway,
            store,
            log,
            locks,
            config,
        }
    }

    /// Run upload rounds until nothing is due.
    ///
    /// With `wait_for_retries` set, the phase also sleeps until edits in
    /// backoff become due, so it ends only when every edit is confirmed,
    /// terminally failed or released after a transport failure.
    ///
    /// Cancellation interrupts only requests still waiting on the gateway.
    /// Outcomes already received are always applied in full.
    ///
    /// # Errors
    /// - `Cancelled` when `cancel` fires; interrupted edits stay IN_FLIGHT
    ///   and edits never sent return to PENDING
    /// - Storage errors from the edit log or the entity store
    pub async fn run(&self, cancel: &CancellationToken) -> Result<UploadSummary> {
        let mut summary = UploadSummary::default();

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let selected = self.select_round().await?;
            if selected.is_empty() {
                if !self.config.wait_for_retries {
                    break;
                }
                let Some(retry_at) = self.log.next_retry_at(Utc::now()).await else {
                    break;
                };
                let wait = (retry_at - Utc::now()).to_std().unwrap_or_default();
                debug!("Waiting {:?} for edits in backoff", wait);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(wait) => continue,
                }
            }

            summary.attempted += selected.len();
            match self.dispatch(selected, cancel, &mut summary).await? {
                RoundEnd::Drained => {}
                RoundEnd::Aborted => break,
                RoundEnd::Cancelled => return Err(Error::Cancelled),
            }
        }

        info!(
            "Upload finished: {} confirmed, {} failed, {} awaiting retry, {} released",
            summary.confirmed,
            summary.failures.len(),
            summary.retry_scheduled,
            summary.released
        );
        Ok(summary)
    }

    /// Mark the next round of due edits IN_FLIGHT.
    ///
    /// Only the oldest PENDING edit of each target is eligible, and targets
    /// with an edit already IN_FLIGHT are skipped.
    async fn select_round(&self) -> Result<Vec<LocalEdit>> {
        let now = Utc::now();
        let limit = self.config.round_size();
        let mut blocked = self.log.in_flight_targets().await;
        let mut selected: Vec<LocalEdit> = Vec::new();

        for edit in self.log.pending_edits().await {
            if selected.len() >= limit {
                break;
            }
            if !blocked.insert(edit.target.clone()) || !edit.is_due(now) {
                continue;
            }

            match self.log.mark_in_flight(&edit.id).await {
                Ok(edit) => selected.push(edit),
                Err(Error::Conflict(reason)) => debug!(edit = %edit.id, %reason, "Edit skipped"),
                Err(err) => {
                    let ids: Vec<EditId> = selected.iter().map(|e| e.id.clone()).collect();
                    self.log.release(&ids).await?;
                    return Err(err);
                }
            }
        }

        Ok(selected)
    }

    /// Upload one round.
    async fn dispatch(
        &self,
        selected: Vec<LocalEdit>,
        cancel: &CancellationToken,
        summary: &mut UploadSummary,
    ) -> Result<RoundEnd> {
        let mut unresolved: HashSet<EditId> = selected.iter().map(|e| e.id.clone()).collect();
        let batches: Vec<Vec<LocalEdit>> = selected
            .chunks(self.config.batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect();

        let gateway = &self.gateway;
        let mut results = stream::iter(batches)
            .map(|batch| async move {
                if cancel.is_cancelled() {
                    return (batch, Sent::Skipped);
                }
                debug!("Uploading batch of {} edits to {}", batch.len(), gateway.name());
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Sent::Interrupted,
                    result = gateway.upload_batch(&batch) => Sent::Done(result),
                };
                (batch, sent)
            })
            .buffer_unordered(self.config.parallelism.max(1));

        let mut end = RoundEnd::Drained;
        while let Some((batch, sent)) = results.next().await {
            match sent {
                Sent::Done(Ok(outcome)) => {
                    for edit in &batch {
                        self.apply_outcome(edit, outcome.outcome_for(&edit.id), summary)
                            .await?;
                        unresolved.remove(&edit.id);
                    }
                }
                Sent::Done(Err(err)) => {
                    warn!("Upload batch of {} edits failed: {}", batch.len(), err);
                    summary.transport_error = Some(err.to_string());
                    end = RoundEnd::Aborted;
                    break;
                }
                Sent::Interrupted => {
                    debug!("Upload of {} edits interrupted", batch.len());
                    for edit in &batch {
                        unresolved.remove(&edit.id);
                    }
                    end = RoundEnd::Cancelled;
                }
                Sent::Skipped => end = RoundEnd::Cancelled,
            }
        }
        drop(results);

        if end != RoundEnd::Drained && !unresolved.is_empty() {
            let ids: Vec<EditId> = unresolved.into_iter().collect();
            summary.released += self.log.release(&ids).await?;
        }
        Ok(end)
    }

    async fn apply_outcome(
        &self,
        edit: &LocalEdit,
        outcome: EditOutcome,
        summary: &mut UploadSummary,
    ) -> Result<()> {
        match outcome {
            EditOutcome::Accepted { server_id } => {
                if let Some(server_id) = server_id.filter(|id| *id != edit.target) {
                    self.adopt_server_id(&edit.target, &server_id).await?;
                }
                self.log.mark_confirmed(&edit.id).await?;
                summary.confirmed += 1;
            }
            EditOutcome::Rejected { reason } => {
                self.log.mark_failed(&edit.id, reason.clone(), false).await?;
                summary.failures.push(EditFailure {
                    edit_id: edit.id.clone(),
                    target: edit.target.clone(),
                    reason,
                    rejected: true,
                });
            }
            EditOutcome::ServerError { message, retriable } => {
                let state = self
                    .log
                    .mark_failed(&edit.id, message.clone(), retriable)
                    .await?;
                if state == EditState::Failed {
                    summary.failures.push(EditFailure {
                        edit_id: edit.id.clone(),
                        target: edit.target.clone(),
                        reason: message,
                        rejected: false,
                    });
                } else {
                    summary.retry_scheduled += 1;
                }
            }
        }
        Ok(())
    }

    /// Move a locally created entity and its remaining edits to the server identifier.
    async fn adopt_server_id(&self, local: &EntityId, server: &EntityId) -> Result<()> {
        let _local = self.locks.lock(local.as_str()).await;
        let _server = self.locks.lock(server.as_str()).await;
        self.store.rekey(local, server).await?;
        self.log.retarget(local, server).await?;
        Ok(())
    }
}
