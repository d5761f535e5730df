//! Local edits: durable records of mutations awaiting server confirmation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::types::{EditId, EntityId};
use crate::{Error, Result};

/// Kind of mutation an edit records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EditKind {
    Create,
    Update,
    Delete,
}

/// Synchronization state of an edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EditState {
    /// Waiting to be uploaded (possibly after a backoff deadline).
    Pending,
    /// Submitted to the remote service, outcome not yet known.
    InFlight,
    /// Permanently failed; needs user attention.
    Failed,
    /// Accepted by the remote service. Confirmed edits are removed from the log.
    Confirmed,
}

/// A pending create/update/delete against an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalEdit {
    pub id: EditId,
    pub kind: EditKind,
    /// Identifier of the entity this edit mutates.
    pub target: EntityId,
    /// Full entity snapshot for creates and updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Entity>,
    pub created_at: DateTime<Utc>,
    /// Append order within the log; breaks ties between equal timestamps.
    #[serde(default)]
    pub sequence: u64,
    pub state: EditState,
    /// Number of failed upload attempts so far.
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Earliest time a retry may be dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_flight_since: Option<DateTime<Utc>>,
}

impl LocalEdit {
    fn new(kind: EditKind, target: EntityId, payload: Option<Entity>) -> Self {
        Self {
            id: EditId::generate(),
            kind,
            target,
            payload,
            created_at: Utc::now(),
            sequence: 0,
            state: EditState::Pending,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
            in_flight_since: None,
        }
    }

    /// Record the creation of an entity.
    ///
    /// # Errors
    /// - Returns error if the entity has no identifier yet
    pub fn create(entity: Entity) -> Result<Self> {
        let target = entity.require_id()?.clone();
        Ok(Self::new(EditKind::Create, target, Some(entity)))
    }

    /// Record a modification of an existing entity.
    ///
    /// # Errors
    /// - Returns error if the entity has no identifier yet
    pub fn update(entity: Entity) -> Result<Self> {
        let target = entity.require_id()?.clone();
        Ok(Self::new(EditKind::Update, target, Some(entity)))
    }

    /// Record the deletion of an entity.
    pub fn delete(target: EntityId) -> Self {
        Self::new(EditKind::Delete, target, None)
    }

    /// Whether the edit still has to reach the server.
    pub fn is_unsynced(&self) -> bool {
        matches!(self.state, EditState::Pending | EditState::InFlight)
    }

    /// Whether the edit may be dispatched at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == EditState::Pending && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Transition PENDING -> IN_FLIGHT.
    pub fn mark_in_flight(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.state != EditState::Pending {
            return Err(Error::Conflict(format!(
                "Edit {} is {:?}, not pending",
                self.id, self.state
            )));
        }
        self.state = EditState::InFlight;
        self.in_flight_since = Some(now);
        Ok(())
    }

    /// Return an unconfirmed edit to PENDING without charging an attempt.
    pub fn release(&mut self) {
        if self.state == EditState::InFlight {
            self.state = EditState::Pending;
        }
        self.in_flight_since = None;
    }

    /// Record a failed attempt that may be retried after `retry_at`.
    pub fn mark_retry(&mut self, reason: impl Into<String>, retry_at: DateTime<Utc>) {
        self.attempts += 1;
        self.state = EditState::Pending;
        self.last_error = Some(reason.into());
        self.next_attempt_at = Some(retry_at);
        self.in_flight_since = None;
    }

    /// Record a failure that will not be retried.
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.attempts += 1;
        self.state = EditState::Failed;
        self.last_error = Some(reason.into());
        self.next_attempt_at = None;
        self.in_flight_since = None;
    }

    /// Put a terminally failed edit back in the queue with a fresh budget.
    pub fn requeue(&mut self) {
        self.state = EditState::Pending;
        self.attempts = 0;
        self.next_attempt_at = None;
        self.in_flight_since = None;
    }

    /// Point the edit at a new entity identifier.
    pub fn retarget(&mut self, new_target: &EntityId) {
        self.target = new_target.clone();
        if let Some(payload) = self.payload.as_mut() {
            payload.id = Some(new_target.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entity(id: &str) -> Entity {
        Entity::with_id(EntityId::new(id).unwrap()).with_field("note", "x")
    }

    #[test]
    fn test_create_requires_id() {
        assert!(LocalEdit::create(Entity::new()).is_err());
        let edit = LocalEdit::create(entity("a")).unwrap();
        assert_eq!(edit.kind, EditKind::Create);
        assert_eq!(edit.target.as_str(), "a");
        assert_eq!(edit.state, EditState::Pending);
    }

    #[test]
    fn test_delete_has_no_payload() {
        let edit = LocalEdit::delete(EntityId::new("a").unwrap());
        assert!(edit.payload.is_none());
        let json = serde_json::to_value(&edit).unwrap();
        assert!(json.get("payload").is_none());
        assert_eq!(json["kind"], "DELETE");
    }

    #[test]
    fn test_in_flight_only_from_pending() {
        let mut edit = LocalEdit::create(entity("a")).unwrap();
        edit.mark_in_flight(Utc::now()).unwrap();
        assert_eq!(edit.state, EditState::InFlight);
        assert!(matches!(edit.mark_in_flight(Utc::now()), Err(Error::Conflict(_))));

        edit.release();
        assert_eq!(edit.state, EditState::Pending);
        assert_eq!(edit.attempts, 0);
    }

    #[test]
    fn test_retry_deadline_controls_due() {
        let now = Utc::now();
        let mut edit = LocalEdit::create(entity("a")).unwrap();
        edit.mark_in_flight(now).unwrap();
        edit.mark_retry("503", now + Duration::seconds(10));

        assert_eq!(edit.attempts, 1);
        assert!(!edit.is_due(now));
        assert!(edit.is_due(now + Duration::seconds(11)));
        assert!(edit.is_unsynced());
    }

    #[test]
    fn test_terminal_failure_and_requeue() {
        let mut edit = LocalEdit::update(entity("a")).unwrap();
        edit.mark_failed("invalid status value");
        assert_eq!(edit.state, EditState::Failed);
        assert!(!edit.is_unsynced());
        assert!(!edit.is_due(Utc::now()));

        edit.requeue();
        assert_eq!(edit.state, EditState::Pending);
        assert_eq!(edit.attempts, 0);
        assert_eq!(edit.last_error.as_deref(), Some("invalid status value"));
    }

    #[test]
    fn test_retarget_updates_payload() {
        let mut edit = LocalEdit::update(entity("local-1")).unwrap();
        let server = EntityId::new("srv-9").unwrap();
        edit.retarget(&server);
        assert_eq!(edit.target, server);
        assert_eq!(edit.payload.unwrap().id, Some(server));
    }
}
