//! End-to-end sync sessions against the in-memory gateway.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fieldsync_common::{EditState, Entity, EntityId, Error, Geometry, GeometryType, LocalEdit};
use fieldsync_gateway::{EditOutcome, MemoryGateway, ScriptedFailure};
use fieldsync_storage::{KvEntry, KvStore, LocalKv, MemoryKv};
use fieldsync_sync::{
    DownloadProgress, RetryConfig, SequentialIdGenerator, SyncConfig, SyncEngine, SyncPhase,
};
use tempfile::TempDir;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;

fn id(s: &str) -> EntityId {
    EntityId::new(s).unwrap()
}

fn fast_config() -> SyncConfig {
    SyncConfig::default().with_retry(
        RetryConfig::new(2)
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(10))
            .with_jitter(false),
    )
}

async fn open(kv: Arc<dyn KvStore>, gateway: Arc<MemoryGateway>, config: SyncConfig) -> SyncEngine {
    SyncEngine::open_with_generator(kv, gateway, config, Arc::new(SequentialIdGenerator::new()))
        .await
        .unwrap()
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn drain(rx: &mut broadcast::Receiver<DownloadProgress>) -> Vec<DownloadProgress> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn sessions(events: &[DownloadProgress]) -> BTreeMap<u64, Vec<DownloadProgress>> {
    let mut sessions: BTreeMap<u64, Vec<DownloadProgress>> = BTreeMap::new();
    for event in events {
        sessions.entry(event.session).or_default().push(event.clone());
    }
    sessions
}

/// Memory store whose deletes of edit records stall after taking effect.
struct SlowEditDeletes {
    inner: MemoryKv,
    deleted: Notify,
}

impl SlowEditDeletes {
    fn new() -> Self {
        Self {
            inner: MemoryKv::new(),
            deleted: Notify::new(),
        }
    }
}

#[async_trait]
impl KvStore for SlowEditDeletes {
    fn name(&self) -> &str {
        "slow-edit-deletes"
    }

    async fn get(&self, key: &str) -> fieldsync_common::Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> fieldsync_common::Result<()> {
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> fieldsync_common::Result<()> {
        self.inner.delete(key).await?;
        if key.starts_with("edit/") {
            self.deleted.notify_one();
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str) -> fieldsync_common::Result<Vec<KvEntry>> {
        self.inner.list_prefix(prefix).await
    }
}

#[tokio::test]
async fn new_entity_gets_local_id_and_is_confirmed() {
    let gateway = Arc::new(MemoryGateway::new());
    let engine = open(Arc::new(MemoryKv::new()), gateway.clone(), fast_config()).await;

    let saved = engine
        .save_entity(
            Entity::new()
                .with_field("jobCard", "JC-7")
                .with_geometry(Geometry::point(18.42, -33.92)),
        )
        .await
        .unwrap();
    assert_eq!(saved.id, Some(id("local-1")));

    let pending = engine.edit_log().pending_edits().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].state, EditState::Pending);
    assert_eq!(pending[0].target, id("local-1"));

    let summary = engine.request_sync().await.unwrap();
    assert!(summary.is_success());
    assert_eq!(summary.upload.confirmed, 1);
    assert_eq!(engine.edit_log().counts().await.total(), 0);

    let stored = engine.get_entity(&id("local-1")).await.unwrap();
    assert_eq!(stored.geometry_type(), GeometryType::Point);
    assert!(gateway.remote(&id("local-1")).is_some());
}

#[tokio::test]
async fn second_in_flight_edit_for_same_entity_conflicts() {
    let engine = open(
        Arc::new(MemoryKv::new()),
        Arc::new(MemoryGateway::new()),
        fast_config(),
    )
    .await;
    let log = engine.edit_log();

    let first = log
        .append(LocalEdit::update(Entity::with_id(id("X")).with_field("v", 1)).unwrap())
        .await
        .unwrap();
    let second = log
        .append(LocalEdit::update(Entity::with_id(id("X")).with_field("v", 2)).unwrap())
        .await
        .unwrap();

    log.mark_in_flight(&first.id).await.unwrap();
    assert!(matches!(
        log.mark_in_flight(&second.id).await,
        Err(Error::Conflict(_))
    ));
    assert_eq!(log.get(&second.id).await.unwrap().state, EditState::Pending);
}

#[tokio::test]
async fn merge_skips_entities_with_unsynced_edits() {
    let gateway = Arc::new(MemoryGateway::new());
    gateway
        .put_remote(Entity::with_id(id("Y")).with_field("status", "remote"))
        .unwrap();
    gateway
        .put_remote(Entity::with_id(id("Z")).with_field("status", "remote"))
        .unwrap();
    let engine = open(
        Arc::new(MemoryKv::new()),
        gateway.clone(),
        fast_config().with_wait_for_retries(false),
    )
    .await;

    engine
        .save_entity(Entity::with_id(id("Y")).with_field("status", "local"))
        .await
        .unwrap();
    // The upload of Y fails retriably, so its edit is still PENDING at merge time.
    gateway.script_outcome(
        &id("Y"),
        EditOutcome::ServerError {
            message: "busy".into(),
            retriable: true,
        },
    );

    let summary = engine.request_sync().await.unwrap();
    let download = summary.download.unwrap();
    assert_eq!(download.kept_local, 1);
    assert_eq!(download.inserted, 1);

    assert_eq!(
        engine.get_entity(&id("Y")).await.unwrap().field("status"),
        Some(&serde_json::json!("local"))
    );
    assert_eq!(
        engine.get_entity(&id("Z")).await.unwrap().field("status"),
        Some(&serde_json::json!("remote"))
    );
    assert_eq!(engine.edit_log().counts().await.pending, 1);
}

#[tokio::test]
async fn sync_while_uploading_is_busy() {
    let gateway = Arc::new(MemoryGateway::new());
    let engine = Arc::new(open(Arc::new(MemoryKv::new()), gateway.clone(), fast_config()).await);
    engine.save_entity(Entity::new()).await.unwrap();

    gateway.hold_uploads();
    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.request_sync().await })
    };
    {
        let engine = engine.clone();
        wait_until(move || engine.phase() == SyncPhase::Uploading).await;
    }

    assert!(matches!(engine.request_sync().await, Err(Error::Busy)));
    assert_eq!(engine.phase(), SyncPhase::Uploading);

    gateway.open_uploads();
    let summary = first.await.unwrap().unwrap();
    assert_eq!(summary.upload.confirmed, 1);
    assert_eq!(engine.phase(), SyncPhase::Idle);
    assert_eq!(gateway.upload_calls(), 1);
}

#[tokio::test]
async fn transport_failure_returns_batch_to_pending() {
    let gateway = Arc::new(MemoryGateway::new());
    let engine = open(Arc::new(MemoryKv::new()), gateway.clone(), fast_config()).await;
    for n in 0..3 {
        engine
            .save_entity(Entity::new().with_field("n", n))
            .await
            .unwrap();
    }
    gateway.fail_next_upload(ScriptedFailure::Network);

    let summary = engine.request_sync().await.unwrap();
    assert!(!summary.is_success());
    assert_eq!(summary.upload.released, 3);
    assert!(summary.download.is_some());

    let counts = engine.edit_log().counts().await;
    assert_eq!(counts.pending, 3);
    assert_eq!(counts.in_flight, 0);
    assert_eq!(counts.failed, 0);
    assert_eq!(gateway.total_applied(), 0);

    let retry = engine.request_sync().await.unwrap();
    assert!(retry.is_success());
    assert_eq!(retry.upload.confirmed, 3);
    assert_eq!(gateway.total_applied(), 3);
}

#[tokio::test]
async fn edits_are_applied_once_across_sessions() {
    let gateway = Arc::new(MemoryGateway::new());
    let engine = open(Arc::new(MemoryKv::new()), gateway.clone(), fast_config()).await;
    let saved = engine.save_entity(Entity::new()).await.unwrap();
    engine
        .save_entity(saved.with_field("done", true))
        .await
        .unwrap();
    let edits = engine.edit_log().pending_edits().await;

    engine.request_sync().await.unwrap();
    engine.request_sync().await.unwrap();

    for edit in &edits {
        assert_eq!(gateway.times_applied(&edit.id), 1);
    }
    assert_eq!(gateway.total_applied(), 2);
}

#[tokio::test]
async fn rejected_edit_is_reported_and_download_still_runs() {
    let gateway = Arc::new(MemoryGateway::new());
    gateway.put_remote(Entity::with_id(id("srv-9"))).unwrap();
    let engine = open(Arc::new(MemoryKv::new()), gateway.clone(), fast_config()).await;
    engine
        .save_entity(Entity::with_id(id("bad")))
        .await
        .unwrap();
    gateway.script_outcome(
        &id("bad"),
        EditOutcome::Rejected {
            reason: "job card number missing".into(),
        },
    );

    let summary = engine.request_sync().await.unwrap();
    assert_eq!(summary.upload.failures.len(), 1);
    assert!(summary.upload.failures[0].rejected);
    assert_eq!(summary.download.unwrap().inserted, 1);

    let failed = engine.failed_edits().await;
    assert_eq!(failed.len(), 1);
    assert_eq!(
        failed[0].last_error.as_deref(),
        Some("job card number missing")
    );

    engine.requeue_failed(&failed[0].id).await.unwrap();
    let summary = engine.request_sync().await.unwrap();
    assert_eq!(summary.upload.confirmed, 1);
    assert!(engine.failed_edits().await.is_empty());
}

#[tokio::test]
async fn progress_sessions_are_monotonic_with_one_terminal_event() {
    let gateway = Arc::new(MemoryGateway::new());
    gateway.set_progress_script(vec![0.4, 0.2, 0.8, 1.0]);
    gateway.fail_next_download(ScriptedFailure::Remote { retriable: true });
    gateway.fail_next_download(ScriptedFailure::Network);
    let engine = open(
        Arc::new(MemoryKv::new()),
        gateway.clone(),
        fast_config().with_download_attempts(3),
    )
    .await;
    let mut rx = engine.subscribe_progress();

    let summary = engine.request_sync().await.unwrap();
    assert!(summary.download.is_some());

    let events = drain(&mut rx);
    let sessions = sessions(&events);
    assert_eq!(sessions.len(), 3);

    for events in sessions.values() {
        assert!(events.windows(2).all(|w| w[0].fraction <= w[1].fraction));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        let last = events.last().unwrap();
        assert!(last.is_terminal());
        assert!(!(last.is_complete && last.error.is_some()));
    }

    let outcomes: Vec<bool> = sessions
        .values()
        .map(|events| events.last().unwrap().is_complete)
        .collect();
    assert_eq!(outcomes, vec![false, false, true]);
}

#[tokio::test]
async fn non_retriable_download_failure_is_reported() {
    let gateway = Arc::new(MemoryGateway::new());
    gateway.fail_next_download(ScriptedFailure::Remote { retriable: false });
    let engine = open(Arc::new(MemoryKv::new()), gateway.clone(), fast_config()).await;
    let mut rx = engine.subscribe_progress();

    let summary = engine.request_sync().await.unwrap();
    assert!(!summary.is_success());
    assert!(summary.download_error.is_some());
    assert_eq!(sessions(&drain(&mut rx)).len(), 1);
    assert_eq!(engine.phase(), SyncPhase::Idle);
}

#[tokio::test]
async fn cancelled_upload_is_reconciled_on_restart() {
    let kv = MemoryKv::new();
    let gateway = Arc::new(MemoryGateway::new());
    let engine = Arc::new(open(Arc::new(kv.clone()), gateway.clone(), fast_config()).await);
    engine.save_entity(Entity::new()).await.unwrap();

    gateway.hold_uploads();
    let session = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.request_sync().await })
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.edit_log().counts().await.in_flight == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap();

    assert!(engine.cancel());
    assert!(matches!(session.await.unwrap(), Err(Error::Cancelled)));
    assert_eq!(engine.phase(), SyncPhase::Idle);
    assert_eq!(engine.edit_log().counts().await.in_flight, 1);
    gateway.open_uploads();
    drop(engine);

    let engine = open(Arc::new(kv), gateway.clone(), fast_config()).await;
    let counts = engine.edit_log().counts().await;
    assert_eq!(counts.in_flight, 0);
    assert_eq!(counts.pending, 1);

    let summary = engine.request_sync().await.unwrap();
    assert_eq!(summary.upload.confirmed, 1);
    assert_eq!(gateway.total_applied(), 1);
}

#[tokio::test]
async fn server_assigned_id_replaces_local_id() {
    let gateway = Arc::new(MemoryGateway::new());
    gateway.set_assign_server_ids(true);
    let engine = open(Arc::new(MemoryKv::new()), gateway.clone(), fast_config()).await;

    engine
        .save_entity(Entity::new().with_field("crew", "North"))
        .await
        .unwrap();
    let summary = engine.request_sync().await.unwrap();
    assert_eq!(summary.upload.confirmed, 1);

    let entities = engine.list_entities().await;
    assert_eq!(entities.len(), 1);
    assert_eq!(entities[0].id, Some(id("srv-1")));
    assert_eq!(summary.download.unwrap().unchanged, 1);
}

#[tokio::test]
async fn save_under_replaced_local_id_updates_server_entity() {
    let kv = MemoryKv::new();
    let gateway = Arc::new(MemoryGateway::new());
    gateway.set_assign_server_ids(true);
    {
        let engine = open(Arc::new(kv.clone()), gateway.clone(), fast_config()).await;
        engine
            .save_entity(Entity::new().with_field("crew", "North"))
            .await
            .unwrap();
        engine.request_sync().await.unwrap();
    }

    let engine = open(Arc::new(kv), gateway.clone(), fast_config()).await;
    let saved = engine
        .save_entity(Entity::with_id(id("local-1")).with_field("crew", "South"))
        .await
        .unwrap();
    assert_eq!(saved.id, Some(id("srv-1")));
    assert_eq!(
        engine.get_entity(&id("local-1")).await.unwrap().id,
        Some(id("srv-1"))
    );

    let fresh = engine.save_entity(Entity::new()).await.unwrap();
    assert_ne!(fresh.id, Some(id("local-1")));

    engine.request_sync().await.unwrap();
    assert_eq!(engine.list_entities().await.len(), 2);
    assert_eq!(gateway.remote_count(), 2);
    assert_eq!(
        gateway.remote(&id("srv-1")).unwrap().field("crew"),
        Some(&serde_json::json!("South"))
    );
}

#[tokio::test]
async fn edits_survive_restart_on_disk() {
    let dir = TempDir::new().unwrap();
    let gateway = Arc::new(MemoryGateway::new());

    {
        let kv: Arc<dyn KvStore> = Arc::new(LocalKv::new(dir.path()).unwrap());
        let engine = open(kv, gateway.clone(), fast_config()).await;
        engine
            .save_entity(Entity::new().with_field("n", 1))
            .await
            .unwrap();
        engine.delete_entity(&id("local-1")).await.unwrap();
        engine
            .save_entity(Entity::new().with_field("n", 2))
            .await
            .unwrap();
    }

    let kv: Arc<dyn KvStore> = Arc::new(LocalKv::new(dir.path()).unwrap());
    let engine = open(kv, gateway.clone(), fast_config()).await;
    assert_eq!(engine.edit_log().counts().await.pending, 3);
    assert!(!engine.store().contains(&id("local-1")).await);
    assert!(engine.store().contains(&id("local-2")).await);

    let summary = engine.request_sync().await.unwrap();
    assert_eq!(summary.upload.confirmed, 3);
    assert_eq!(gateway.remote_count(), 1);
    assert!(gateway.remote(&id("local-2")).is_some());
}

#[tokio::test]
async fn failed_storage_write_records_nothing() {
    let kv = MemoryKv::new();
    let engine = open(
        Arc::new(kv.clone()),
        Arc::new(MemoryGateway::new()),
        fast_config(),
    )
    .await;
    kv.set_fail_writes(true);

    assert!(matches!(
        engine.save_entity(Entity::new()).await,
        Err(Error::Storage(_))
    ));
    assert_eq!(engine.edit_log().counts().await.total(), 0);
    assert!(engine.store().is_empty().await);
}

#[tokio::test]
async fn cancel_while_confirming_does_not_resubmit() {
    let kv = Arc::new(SlowEditDeletes::new());
    let gateway = Arc::new(MemoryGateway::new());
    let engine = Arc::new(open(kv.clone(), gateway.clone(), fast_config()).await);
    engine
        .save_entity(Entity::new().with_field("status", "open"))
        .await
        .unwrap();
    let edit_id = engine.edit_log().pending_edits().await[0].id.clone();

    let cancel = CancellationToken::new();
    let first = {
        let engine = engine.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { engine.request_sync_with(cancel).await })
    };
    kv.deleted.notified().await;
    cancel.cancel();

    assert!(matches!(first.await.unwrap(), Err(Error::Cancelled)));
    assert!(matches!(
        engine.edit_log().get(&edit_id).await,
        Err(Error::NotFound(_))
    ));
    assert_eq!(engine.edit_log().counts().await.total(), 0);

    engine.request_sync().await.unwrap();
    assert_eq!(gateway.times_applied(&edit_id), 1);
    assert_eq!(gateway.total_applied(), 1);
}

#[tokio::test]
async fn parallel_batches_keep_one_in_flight_edit_per_target() {
    let gateway = Arc::new(MemoryGateway::new());
    let config = fast_config().with_batch_size(1).with_parallelism(3);
    let engine = Arc::new(open(Arc::new(MemoryKv::new()), gateway.clone(), config).await);

    let hydrant = engine
        .save_entity(Entity::new().with_field("v", 1))
        .await
        .unwrap();
    for v in 2..=3 {
        engine
            .save_entity(hydrant.clone().with_field("v", v))
            .await
            .unwrap();
    }
    engine
        .save_entity(Entity::new().with_field("v", 10))
        .await
        .unwrap();

    gateway.hold_uploads();
    let session = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.request_sync().await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while engine.edit_log().counts().await.in_flight < 2 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("round was not dispatched");

    assert_eq!(engine.edit_log().counts().await.in_flight, 2);
    assert_eq!(engine.edit_log().in_flight_targets().await.len(), 2);

    gateway.open_uploads();
    let summary = session.await.unwrap().unwrap();
    assert!(summary.is_success());
    assert_eq!(summary.upload.confirmed, 4);
    assert!(gateway.batch_sizes().iter().all(|size| *size == 1));

    let hydrant_id = hydrant.id.unwrap();
    let remote = gateway.remote(&hydrant_id).unwrap();
    assert_eq!(remote.field("v"), Some(&serde_json::json!(3)));
}

#[tokio::test]
async fn parallel_transport_failure_releases_every_unresolved_edit() {
    let gateway = Arc::new(MemoryGateway::new());
    let config = fast_config().with_batch_size(1).with_parallelism(3);
    let engine = open(Arc::new(MemoryKv::new()), gateway.clone(), config).await;
    for n in 0..5 {
        engine
            .save_entity(Entity::new().with_field("n", n))
            .await
            .unwrap();
    }
    let edit_ids: Vec<_> = engine
        .edit_log()
        .pending_edits()
        .await
        .into_iter()
        .map(|edit| edit.id)
        .collect();
    gateway.fail_next_upload(ScriptedFailure::Network);

    let summary = engine.request_sync().await.unwrap();
    assert!(summary.upload.transport_error.is_some());
    assert_eq!(summary.upload.confirmed + summary.upload.released, 3);
    assert_eq!(gateway.total_applied(), summary.upload.confirmed);

    let counts = engine.edit_log().counts().await;
    assert_eq!(counts.in_flight, 0);
    assert_eq!(counts.pending, 5 - summary.upload.confirmed);

    let summary = engine.request_sync().await.unwrap();
    assert!(summary.is_success());
    assert_eq!(engine.edit_log().counts().await.total(), 0);
    for edit_id in &edit_ids {
        assert_eq!(gateway.times_applied(edit_id), 1);
    }
}
