//! Durable log of local edits awaiting server confirmation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use fieldsync_common::{EditId, EditState, EntityId, Error, LocalEdit, Result};
use fieldsync_storage::KvStore;

use crate::retry::RetryConfig;

/// Key prefix under which edits are persisted.
pub const EDIT_PREFIX: &str = "edit/";

fn edit_key(id: &EditId) -> String {
    format!("{}{}", EDIT_PREFIX, id)
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Number of edits in each unconfirmed state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EditCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub failed: usize,
}

impl EditCounts {
    /// Edits not yet confirmed by the server, failed ones included.
    pub fn total(&self) -> usize {
        self.pending + self.in_flight + self.failed
    }
}

struct LogState {
    edits: HashMap<EditId, LocalEdit>,
    next_sequence: u64,
}

/// Append-friendly record of unconfirmed mutations.
///
/// Each edit is stored under its own key so a state change rewrites only
/// that edit. Every operation persists before it updates the in-memory
/// index and returns.
pub struct EditLog {
    kv: Arc<dyn KvStore>,
    retry: RetryConfig,
    state: Mutex<LogState>,
}

impl EditLog {
    /// Load the log from `kv`.
    pub async fn open(kv: Arc<dyn KvStore>, retry: RetryConfig) -> Result<Self> {
        let mut edits = HashMap::new();
        let mut next_sequence = 0;

        for (key, value) in kv.list_prefix(EDIT_PREFIX).await? {
            let edit: LocalEdit = serde_json::from_slice(&value).map_err(|e| {
                Error::Serialization(format!("Corrupt edit record {}: {}", key, e))
            })?;
            next_sequence = next_sequence.max(edit.sequence + 1);
            edits.insert(edit.id.clone(), edit);
        }

        info!("Edit log opened on {} with {} edits", kv.name(), edits.len());

        Ok(Self {
            kv,
            retry,
            state: Mutex::new(LogState {
                edits,
                next_sequence,
            }),
        })
    }

    /// Retry policy applied by [`EditLog::mark_failed`].
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    async fn persist(&self, edit: &LocalEdit) -> Result<()> {
        let bytes = serde_json::to_vec(edit)?;
        self.kv.put(&edit_key(&edit.id), bytes).await
    }

    /// Durably record a new edit as PENDING.
    ///
    /// # Errors
    /// - `Conflict` if an edit with the same identifier exists
    /// - Storage errors if the edit could not be persisted
    pub async fn append(&self, mut edit: LocalEdit) -> Result<LocalEdit> {
        let mut state = self.state.lock().await;
        if state.edits.contains_key(&edit.id) {
            return Err(Error::Conflict(format!("Edit {} already logged", edit.id)));
        }

        edit.sequence = state.next_sequence;
        edit.state = EditState::Pending;
        self.persist(&edit).await?;

        state.next_sequence += 1;
        state.edits.insert(edit.id.clone(), edit.clone());
        debug!(edit = %edit.id, target = %edit.target, kind = ?edit.kind, "Edit appended");
        Ok(edit)
    }

    /// Fetch an edit.
    pub async fn get(&self, id: &EditId) -> Result<LocalEdit> {
        self.state
            .lock()
            .await
            .edits
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Edit {}", id)))
    }

    fn sorted(mut edits: Vec<LocalEdit>) -> Vec<LocalEdit> {
        edits.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.sequence.cmp(&b.sequence))
        });
        edits
    }

    /// PENDING edits, oldest first. Includes edits waiting for a backoff deadline.
    pub async fn pending_edits(&self) -> Vec<LocalEdit> {
        self.with_state(EditState::Pending).await
    }

    /// Terminally failed edits, oldest first.
    pub async fn failed_edits(&self) -> Vec<LocalEdit> {
        self.with_state(EditState::Failed).await
    }

    /// Every logged edit, oldest first.
    pub async fn all_edits(&self) -> Vec<LocalEdit> {
        let state = self.state.lock().await;
        Self::sorted(state.edits.values().cloned().collect())
    }

    async fn with_state(&self, wanted: EditState) -> Vec<LocalEdit> {
        let state = self.state.lock().await;
        Self::sorted(
            state
                .edits
                .values()
                .filter(|e| e.state == wanted)
                .cloned()
                .collect(),
        )
    }

    /// Targets that currently have an edit IN_FLIGHT.
    pub async fn in_flight_targets(&self) -> HashSet<EntityId> {
        let state = self.state.lock().await;
        state
            .edits
            .values()
            .filter(|e| e.state == EditState::InFlight)
            .map(|e| e.target.clone())
            .collect()
    }

    /// Select an edit for upload.
    ///
    /// # Errors
    /// - `NotFound` if the edit is not in the log
    /// - `Conflict` if the edit is not PENDING or another edit for the same
    ///   target is IN_FLIGHT
    pub async fn mark_in_flight(&self, id: &EditId) -> Result<LocalEdit> {
        let mut state = self.state.lock().await;
        let edit = state
            .edits
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("Edit {}", id)))?;

        let busy = state
            .edits
            .values()
            .any(|other| other.id != *id && other.target == edit.target && other.state == EditState::InFlight);
        if busy {
            return Err(Error::Conflict(format!(
                "Another edit for {} is already in flight",
                edit.target
            )));
        }

        let mut updated = edit.clone();
        updated.mark_in_flight(Utc::now())?;
        self.persist(&updated).await?;
        state.edits.insert(id.clone(), updated.clone());
        Ok(updated)
    }

    /// Remove an edit the server accepted.
    pub async fn mark_confirmed(&self, id: &EditId) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.edits.contains_key(id) {
            return Err(Error::NotFound(format!("Edit {}", id)));
        }

        self.kv.delete(&edit_key(id)).await?;
        state.edits.remove(id);
        debug!(edit = %id, "Edit confirmed");
        Ok(())
    }

    /// Record a failed upload attempt.
    ///
    /// A retriable failure with budget left returns the edit to PENDING with
    /// a backoff deadline; anything else makes it terminally FAILED.
    /// Returns the resulting state.
    pub async fn mark_failed(
        &self,
        id: &EditId,
        reason: impl Into<String>,
        retriable: bool,
    ) -> Result<EditState> {
        let reason = reason.into();
        let mut state = self.state.lock().await;
        let mut edit = state
            .edits
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Edit {}", id)))?;

        if retriable && !self.retry.is_exhausted(edit.attempts + 1) {
            let delay = self.retry.delay_for_attempt(edit.attempts);
            edit.mark_retry(reason, Utc::now() + to_chrono(delay));
            debug!(edit = %id, attempts = edit.attempts, ?delay, "Edit scheduled for retry");
        } else {
            warn!(edit = %id, target = %edit.target, %reason, "Edit failed permanently");
            edit.mark_failed(reason);
        }

        self.persist(&edit).await?;
        let new_state = edit.state;
        state.edits.insert(id.clone(), edit);
        Ok(new_state)
    }

    /// Return IN_FLIGHT edits to PENDING without charging an attempt.
    ///
    /// Used when the server provably never saw them. Unknown or no longer
    /// in-flight identifiers are skipped.
    pub async fn release(&self, ids: &[EditId]) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut released = 0;
        for id in ids {
            let Some(edit) = state.edits.get(id) else {
                continue;
            };
            if edit.state != EditState::InFlight {
                continue;
            }
            let mut edit = edit.clone();
            edit.release();
            self.persist(&edit).await?;
            state.edits.insert(id.clone(), edit);
            released += 1;
        }
        Ok(released)
    }

    /// Demote IN_FLIGHT edits older than `threshold` back to PENDING.
    ///
    /// Their server-side outcome is unknown, so they are treated as unconfirmed.
    pub async fn reconcile_in_flight(&self, threshold: Duration) -> Result<usize> {
        let cutoff = Utc::now() - to_chrono(threshold);
        let stale: Vec<EditId> = {
            let state = self.state.lock().await;
            state
                .edits
                .values()
                .filter(|e| {
                    e.state == EditState::InFlight
                        && e.in_flight_since.map_or(true, |since| since <= cutoff)
                })
                .map(|e| e.id.clone())
                .collect()
        };

        let released = self.release(&stale).await?;
        if released > 0 {
            info!("Reconciled {} stale in-flight edits back to pending", released);
        }
        Ok(released)
    }

    /// Whether a PENDING or IN_FLIGHT edit targets `target`.
    pub async fn has_unsynced(&self, target: &EntityId) -> bool {
        let state = self.state.lock().await;
        state
            .edits
            .values()
            .any(|e| e.target == *target && e.is_unsynced())
    }

    /// Edit counts per state.
    pub async fn counts(&self) -> EditCounts {
        let state = self.state.lock().await;
        let mut counts = EditCounts::default();
        for edit in state.edits.values() {
            match edit.state {
                EditState::Pending => counts.pending += 1,
                EditState::InFlight => counts.in_flight += 1,
                EditState::Failed => counts.failed += 1,
                EditState::Confirmed => {}
            }
        }
        counts
    }

    /// Earliest backoff deadline among PENDING edits that are not yet due.
    pub async fn next_retry_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let state = self.state.lock().await;
        state
            .edits
            .values()
            .filter(|e| e.state == EditState::Pending)
            .filter_map(|e| e.next_attempt_at)
            .filter(|at| *at > now)
            .min()
    }

    /// Put a terminally failed edit back in the queue with a fresh retry budget.
    ///
    /// # Errors
    /// - `NotFound` if the edit is not in the log
    /// - `Conflict` if the edit is not FAILED
    pub async fn requeue_failed(&self, id: &EditId) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut edit = state
            .edits
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Edit {}", id)))?;
        if edit.state != EditState::Failed {
            return Err(Error::Conflict(format!("Edit {} is not failed", id)));
        }

        edit.requeue();
        self.persist(&edit).await?;
        state.edits.insert(id.clone(), edit);
        info!(edit = %id, "Failed edit requeued");
        Ok(())
    }

    /// Drop an edit the user abandoned.
    ///
    /// # Errors
    /// - `NotFound` if the edit is not in the log
    /// - `Conflict` if the edit is IN_FLIGHT
    pub async fn discard(&self, id: &EditId) -> Result<()> {
        let mut state = self.state.lock().await;
        let edit = state
            .edits
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("Edit {}", id)))?;
        if edit.state == EditState::InFlight {
            return Err(Error::Conflict(format!("Edit {} is in flight", id)));
        }

        self.kv.delete(&edit_key(id)).await?;
        state.edits.remove(id);
        info!(edit = %id, "Edit discarded");
        Ok(())
    }

    /// Point every unconfirmed edit for `from` at `to`.
    pub async fn retarget(&self, from: &EntityId, to: &EntityId) -> Result<usize> {
        let mut state = self.state.lock().await;
        let ids: Vec<EditId> = state
            .edits
            .values()
            .filter(|e| e.target == *from)
            .map(|e| e.id.clone())
            .collect();

        for id in &ids {
            if let Some(edit) = state.edits.get(id) {
                let mut edit = edit.clone();
                edit.retarget(to);
                self.persist(&edit).await?;
                state.edits.insert(id.clone(), edit);
            }
        }

        if !ids.is_empty() {
            debug!("Retargeted {} edits from {} to {}", ids.len(), from, to);
        }
        Ok(ids.len())
    }
}
