//! In-memory remote service for testing.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::debug;

use fieldsync_common::{EditId, EditKind, Entity, EntityId, Error, LocalEdit, Result};

use crate::gateway::{DatasetSnapshot, EditOutcome, RemoteGateway, TransferProgress, UploadOutcome};

/// A failure the memory gateway can be told to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    /// The request never reaches the server.
    Network,
    /// The server answers with an error.
    Remote { retriable: bool },
}

impl ScriptedFailure {
    fn into_error(self, operation: &str) -> Error {
        match self {
            ScriptedFailure::Network => Error::Network(format!("{}: connection refused", operation)),
            ScriptedFailure::Remote { retriable } => Error::RemoteService {
                message: format!("{}: internal server error", operation),
                retriable,
            },
        }
    }
}

#[derive(Default)]
struct State {
    entities: BTreeMap<EntityId, Entity>,
    /// Outcomes to return for the next edits targeting an entity.
    scripted: HashMap<EntityId, VecDeque<EditOutcome>>,
    upload_failures: VecDeque<ScriptedFailure>,
    download_failures: VecDeque<ScriptedFailure>,
    progress_script: Option<Vec<f64>>,
    assign_server_ids: bool,
    next_server_id: u64,
    upload_calls: usize,
    batch_sizes: Vec<usize>,
    /// Number of server-side applications per edit.
    applied: HashMap<EditId, usize>,
}

/// In-memory remote geodatabase.
///
/// Accepts every edit unless told otherwise, applies accepted edits to
/// its own entity map and serves that map as the snapshot.
pub struct MemoryGateway {
    state: Mutex<State>,
    gate: watch::Sender<bool>,
}

impl MemoryGateway {
    /// Create an empty remote dataset.
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            state: Mutex::new(State::default()),
            gate,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed an entity on the remote side.
    pub fn put_remote(&self, entity: Entity) -> Result<()> {
        let id = entity.require_id()?.clone();
        self.lock().entities.insert(id, entity);
        Ok(())
    }

    /// Remote copy of an entity.
    pub fn remote(&self, id: &EntityId) -> Option<Entity> {
        self.lock().entities.get(id).cloned()
    }

    /// Number of entities held remotely.
    pub fn remote_count(&self) -> usize {
        self.lock().entities.len()
    }

    /// Queue an outcome for the next edit targeting `target`.
    pub fn script_outcome(&self, target: &EntityId, outcome: EditOutcome) {
        self.lock()
            .scripted
            .entry(target.clone())
            .or_default()
            .push_back(outcome);
    }

    /// Make the next upload call fail as a whole.
    pub fn fail_next_upload(&self, failure: ScriptedFailure) {
        self.lock().upload_failures.push_back(failure);
    }

    /// Make the next download call fail.
    pub fn fail_next_download(&self, failure: ScriptedFailure) {
        self.lock().download_failures.push_back(failure);
    }

    /// Report exactly these fractions during the next downloads.
    pub fn set_progress_script(&self, fractions: Vec<f64>) {
        self.lock().progress_script = Some(fractions);
    }

    /// Assign `srv-N` identifiers to entities created with a local identifier.
    pub fn set_assign_server_ids(&self, assign: bool) {
        self.lock().assign_server_ids = assign;
    }

    /// Block uploads until [`MemoryGateway::open_uploads`] is called.
    pub fn hold_uploads(&self) {
        self.gate.send_replace(false);
    }

    /// Let held uploads proceed.
    pub fn open_uploads(&self) {
        self.gate.send_replace(true);
    }

    /// Number of `upload_batch` calls made.
    pub fn upload_calls(&self) -> usize {
        self.lock().upload_calls
    }

    /// Sizes of the batches received, in call order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.lock().batch_sizes.clone()
    }

    /// How many times the server applied an edit.
    pub fn times_applied(&self, edit_id: &EditId) -> usize {
        self.lock().applied.get(edit_id).copied().unwrap_or(0)
    }

    /// Total number of server-side edit applications.
    pub fn total_applied(&self) -> usize {
        self.lock().applied.values().sum()
    }

    fn apply(state: &mut State, edit: &LocalEdit) -> EditOutcome {
        let server_id = if state.assign_server_ids
            && edit.kind == EditKind::Create
            && edit.target.is_local()
        {
            state.next_server_id += 1;
            EntityId::new(format!("srv-{}", state.next_server_id)).ok()
        } else {
            None
        };

        match edit.kind {
            EditKind::Create | EditKind::Update => {
                if let Some(payload) = &edit.payload {
                    let mut entity = payload.clone();
                    let id = server_id.clone().unwrap_or_else(|| edit.target.clone());
                    entity.id = Some(id.clone());
                    entity.updated_at = Utc::now();
                    state.entities.insert(id, entity);
                }
            }
            EditKind::Delete => {
                state.entities.remove(&edit.target);
            }
        }

        *state.applied.entry(edit.id.clone()).or_insert(0) += 1;
        EditOutcome::Accepted { server_id }
    }
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteGateway for MemoryGateway {
    fn name(&self) -> &str {
        "memory"
    }

    async fn upload_batch(&self, edits: &[LocalEdit]) -> Result<UploadOutcome> {
        let mut gate = self.gate.subscribe();
        loop {
            let open = *gate.borrow_and_update();
            if open || gate.changed().await.is_err() {
                break;
            }
        }

        let mut state = self.lock();
        state.upload_calls += 1;
        state.batch_sizes.push(edits.len());

        if let Some(failure) = state.upload_failures.pop_front() {
            debug!("Memory gateway failing upload of {} edits", edits.len());
            return match failure {
                ScriptedFailure::Network => Err(failure.into_error("upload")),
                ScriptedFailure::Remote { retriable } => {
                    let mut outcome = UploadOutcome::new();
                    for edit in edits {
                        outcome.insert(
                            edit.id.clone(),
                            EditOutcome::ServerError {
                                message: "upload: internal server error".to_string(),
                                retriable,
                            },
                        );
                    }
                    Ok(outcome)
                }
            };
        }

        let mut outcome = UploadOutcome::new();
        for edit in edits {
            let scripted = state
                .scripted
                .get_mut(&edit.target)
                .and_then(|queue| queue.pop_front());

            let result = match scripted {
                Some(EditOutcome::Accepted { .. }) | None => Self::apply(&mut state, edit),
                Some(other) => other,
            };
            outcome.insert(edit.id.clone(), result);
        }

        Ok(outcome)
    }

    async fn download_snapshot(
        &self,
        on_progress: &(dyn Fn(TransferProgress) + Send + Sync),
    ) -> Result<DatasetSnapshot> {
        let (failure, script, entities) = {
            let mut state = self.lock();
            (
                state.download_failures.pop_front(),
                state.progress_script.clone(),
                state.entities.values().cloned().collect::<Vec<_>>(),
            )
        };

        on_progress(TransferProgress::new(Some(0.0), "Connected"));

        if let Some(failure) = failure {
            return Err(failure.into_error("download"));
        }

        let fractions = script.unwrap_or_else(|| vec![0.5, 1.0]);
        for fraction in fractions {
            on_progress(TransferProgress::new(
                Some(fraction),
                format!("Received {:.0}%", fraction * 100.0),
            ));
            tokio::task::yield_now().await;
        }

        Ok(DatasetSnapshot::new(entities))
    }
}
