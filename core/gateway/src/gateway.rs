//! Remote gateway trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use fieldsync_common::{EditId, Entity, EntityId, LocalEdit, Result};

/// Server verdict for one submitted edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EditOutcome {
    /// Applied by the server. `server_id` is set when the server assigned
    /// its own identifier to a newly created entity.
    Accepted { server_id: Option<EntityId> },
    /// Permanently refused by server-side validation.
    Rejected { reason: String },
    /// The server failed to process the edit.
    ServerError { message: String, retriable: bool },
}

impl EditOutcome {
    /// Outcome for an edit the server did not report on.
    pub fn missing() -> Self {
        EditOutcome::ServerError {
            message: "No result returned for edit".to_string(),
            retriable: true,
        }
    }
}

/// Per-edit outcomes of one batch upload.
#[derive(Debug, Clone, Default)]
pub struct UploadOutcome {
    outcomes: HashMap<EditId, EditOutcome>,
}

impl UploadOutcome {
    /// Create an empty outcome set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one edit.
    pub fn insert(&mut self, edit_id: EditId, outcome: EditOutcome) {
        self.outcomes.insert(edit_id, outcome);
    }

    /// Outcome reported for an edit, if any.
    pub fn get(&self, edit_id: &EditId) -> Option<&EditOutcome> {
        self.outcomes.get(edit_id)
    }

    /// Outcome for an edit, treating a missing report as a retriable server error.
    pub fn outcome_for(&self, edit_id: &EditId) -> EditOutcome {
        self.outcomes
            .get(edit_id)
            .cloned()
            .unwrap_or_else(EditOutcome::missing)
    }

    /// Number of reported outcomes.
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// Whether no outcome was reported.
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Iterate over reported outcomes.
    pub fn iter(&self) -> impl Iterator<Item = (&EditId, &EditOutcome)> {
        self.outcomes.iter()
    }
}

/// Remote dataset state at a point in time.
///
/// Decoding is lenient per entity: a record that fails to decode (for
/// example one with a blank identifier) is dropped and counted in
/// `invalid` instead of failing the whole snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawSnapshot")]
pub struct DatasetSnapshot {
    pub entities: Vec<Entity>,
    pub generated_at: DateTime<Utc>,
    /// Entity records dropped while decoding.
    #[serde(skip)]
    pub invalid: usize,
}

impl DatasetSnapshot {
    /// Snapshot of the given entities generated now.
    pub fn new(entities: Vec<Entity>) -> Self {
        Self {
            entities,
            generated_at: Utc::now(),
            invalid: 0,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSnapshot {
    #[serde(default)]
    entities: Vec<serde_json::Value>,
    #[serde(default = "Utc::now")]
    generated_at: DateTime<Utc>,
}

impl From<RawSnapshot> for DatasetSnapshot {
    fn from(raw: RawSnapshot) -> Self {
        let mut invalid = 0;
        let entities = raw
            .entities
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<Entity>(value) {
                Ok(entity) => Some(entity),
                Err(e) => {
                    warn!("Dropping undecodable remote entity: {}", e);
                    invalid += 1;
                    None
                }
            })
            .collect();

        Self {
            entities,
            generated_at: raw.generated_at,
            invalid,
        }
    }
}

/// Progress report emitted while a snapshot transfers.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    /// Completed fraction, `None` when the total size is unknown.
    pub fraction: Option<f64>,
    pub message: String,
}

impl TransferProgress {
    pub fn new(fraction: Option<f64>, message: impl Into<String>) -> Self {
        Self {
            fraction,
            message: message.into(),
        }
    }
}

/// Remote geodatabase service.
///
/// Implementations must be safe to share between tasks.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Get the gateway name (e.g., "http", "memory").
    fn name(&self) -> &str;

    /// Submit a batch of edits.
    ///
    /// # Postconditions
    /// - Returns an outcome per edit; partial batch failure is reported
    ///   through the per-edit outcomes, never as an `Err`
    ///
    /// # Errors
    /// - `Error::Network` when the service could not be reached at all
    ///   (unreachable host, timeout). The server never saw the batch.
    ///   Also returned when an accepted response could not be read; the
    ///   batch is then resubmitted and the remote deduplicates by edit id.
    async fn upload_batch(&self, edits: &[LocalEdit]) -> Result<UploadOutcome>;

    /// Download the current dataset.
    ///
    /// `on_progress` is invoked as data arrives.
    ///
    /// # Errors
    /// - `Error::Network` on transport failure
    /// - `Error::RemoteService` when the server reports an error
    async fn download_snapshot(
        &self,
        on_progress: &(dyn Fn(TransferProgress) + Send + Sync),
    ) -> Result<DatasetSnapshot>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_outcome_is_retriable_error() {
        let outcomes = UploadOutcome::new();
        let id = EditId::generate();
        assert_eq!(
            outcomes.outcome_for(&id),
            EditOutcome::ServerError {
                message: "No result returned for edit".to_string(),
                retriable: true
            }
        );
    }

    #[test]
    fn test_snapshot_defaults() {
        let snapshot: DatasetSnapshot = serde_json::from_str("{}").unwrap();
        assert!(snapshot.entities.is_empty());
        assert_eq!(snapshot.invalid, 0);
    }

    #[test]
    fn test_snapshot_drops_entities_with_blank_ids() {
        let json = r#"{
            "entities": [
                {"id": "", "updatedAt": "2026-01-01T00:00:00Z"},
                {"id": "   "},
                {"id": "hydrant-3", "fields": {"status": "ok"}}
            ]
        }"#;
        let snapshot: DatasetSnapshot = serde_json::from_str(json).unwrap();

        assert_eq!(snapshot.invalid, 2);
        assert_eq!(snapshot.entities.len(), 1);
        assert_eq!(
            snapshot.entities[0].id.as_ref().map(|id| id.as_str()),
            Some("hydrant-3")
        );
    }
}
