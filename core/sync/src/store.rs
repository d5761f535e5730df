//! Entity store: the on-device system of record for domain objects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use fieldsync_common::{Entity, EntityId, Error, Result};
use fieldsync_storage::KvStore;

use crate::locks::KeyedLocks;

/// Key prefix under which entities are persisted.
pub const ENTITY_PREFIX: &str = "entity/";

/// Key prefix recording which identifier a re-keyed entity moved to.
pub const ALIAS_PREFIX: &str = "alias/";

/// Longest alias chain followed by [`EntityStore::resolve`].
const MAX_ALIAS_HOPS: usize = 8;

fn entity_key(id: &EntityId) -> String {
    format!("{}{}", ENTITY_PREFIX, id)
}

fn alias_key(id: &EntityId) -> String {
    format!("{}{}", ALIAS_PREFIX, id)
}

/// Source of identifiers for entities saved without one.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> EntityId;
}

/// `local-<uuid>` identifiers.
#[derive(Debug, Default)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn next_id(&self) -> EntityId {
        EntityId::generate_local()
    }
}

/// `local-1`, `local-2`, ... identifiers.
///
/// Readable ids for demos and tests. The store skips values that are
/// already taken, so reopening a store never hands out a duplicate.
#[derive(Debug, Default)]
pub struct SequentialIdGenerator {
    next: AtomicU64,
}

impl SequentialIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for SequentialIdGenerator {
    fn next_id(&self) -> EntityId {
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        EntityId::generate_sequential(n)
    }
}

/// Mapping from entity identifier to entity, persisted through a [`KvStore`].
///
/// Every mutation is written to the backing store before the in-memory view
/// changes, and mutations of the same identifier are serialized.
pub struct EntityStore {
    kv: Arc<dyn KvStore>,
    entities: RwLock<HashMap<EntityId, Entity>>,
    aliases: RwLock<HashMap<EntityId, EntityId>>,
    locks: KeyedLocks,
    ids: Arc<dyn IdGenerator>,
}

impl EntityStore {
    /// Load every persisted entity from `kv`.
    pub async fn open(kv: Arc<dyn KvStore>) -> Result<Self> {
        Self::open_with_generator(kv, Arc::new(UuidIdGenerator)).await
    }

    /// Like [`EntityStore::open`] with a custom identifier source.
    pub async fn open_with_generator(
        kv: Arc<dyn KvStore>,
        ids: Arc<dyn IdGenerator>,
    ) -> Result<Self> {
        let mut entities = HashMap::new();
        for (key, value) in kv.list_prefix(ENTITY_PREFIX).await? {
            let entity: Entity = serde_json::from_slice(&value).map_err(|e| {
                Error::Serialization(format!("Corrupt entity record {}: {}", key, e))
            })?;
            let id = entity.require_id()?.clone();
            entities.insert(id, entity);
        }

        let mut aliases = HashMap::new();
        for (key, value) in kv.list_prefix(ALIAS_PREFIX).await? {
            let from = EntityId::new(&key[ALIAS_PREFIX.len()..])?;
            let to: EntityId = serde_json::from_slice(&value).map_err(|e| {
                Error::Serialization(format!("Corrupt alias record {}: {}", key, e))
            })?;
            aliases.insert(from, to);
        }

        info!(
            "Entity store opened on {} with {} entities, {} aliases",
            kv.name(),
            entities.len(),
            aliases.len()
        );

        Ok(Self {
            kv,
            entities: RwLock::new(entities),
            aliases: RwLock::new(aliases),
            locks: KeyedLocks::new(),
            ids,
        })
    }

    /// Give `entity` a fresh identifier if it has none.
    ///
    /// An identifier that was re-keyed is replaced by the one it moved to.
    pub async fn assign_id(&self, entity: &mut Entity) -> EntityId {
        if let Some(id) = &entity.id {
            let id = self.resolve(id).await;
            entity.id = Some(id.clone());
            return id;
        }

        let entities = self.entities.read().await;
        let aliases = self.aliases.read().await;
        let id = loop {
            let candidate = self.ids.next_id();
            if !entities.contains_key(&candidate) && !aliases.contains_key(&candidate) {
                break candidate;
            }
        };
        entity.id = Some(id.clone());
        id
    }

    /// The current identifier of an entity that may have been re-keyed.
    pub async fn resolve(&self, id: &EntityId) -> EntityId {
        let aliases = self.aliases.read().await;
        let mut current = id;
        for _ in 0..MAX_ALIAS_HOPS {
            match aliases.get(current) {
                Some(next) => current = next,
                None => break,
            }
        }
        current.clone()
    }

    /// Upsert an entity, assigning an identifier if absent.
    ///
    /// # Errors
    /// - Returns error if the entity cannot be persisted
    pub async fn save(&self, mut entity: Entity) -> Result<Entity> {
        let id = self.assign_id(&mut entity).await;
        let _guard = self.locks.lock(id.as_str()).await;
        self.write(&id, &entity).await?;
        debug!("Saved entity {}", id);
        Ok(entity)
    }

    /// Fetch an entity.
    ///
    /// # Errors
    /// - `NotFound` if no entity has this identifier
    pub async fn get(&self, id: &EntityId) -> Result<Entity> {
        self.entities
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Entity {}", id)))
    }

    /// Whether an entity with this identifier exists.
    pub async fn contains(&self, id: &EntityId) -> bool {
        self.entities.read().await.contains_key(id)
    }

    /// Snapshot of all entities ordered by identifier.
    pub async fn list(&self) -> Vec<Entity> {
        let entities = self.entities.read().await;
        let mut list: Vec<Entity> = entities.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Number of stored entities.
    pub async fn len(&self) -> usize {
        self.entities.read().await.len()
    }

    /// Whether the store holds no entity.
    pub async fn is_empty(&self) -> bool {
        self.entities.read().await.is_empty()
    }

    /// Remove an entity. Removing an absent identifier succeeds.
    pub async fn delete(&self, id: &EntityId) -> Result<()> {
        let _guard = self.locks.lock(id.as_str()).await;
        self.kv.delete(&entity_key(id)).await?;
        self.entities.write().await.remove(id);
        debug!("Deleted entity {}", id);
        Ok(())
    }

    /// Move an entity to a new identifier, typically the one the server assigned.
    ///
    /// `from` is remembered as an alias of `to`, so later saves under the old
    /// identifier update the moved entity. Only the alias is recorded if
    /// `from` is absent (deleted locally in the meantime).
    pub async fn rekey(&self, from: &EntityId, to: &EntityId) -> Result<()> {
        if from == to {
            return Ok(());
        }

        let _from_guard = self.locks.lock(from.as_str()).await;
        let _to_guard = self.locks.lock(to.as_str()).await;

        self.kv.put(&alias_key(from), serde_json::to_vec(to)?).await?;
        self.aliases.write().await.insert(from.clone(), to.clone());

        let Some(mut entity) = self.entities.read().await.get(from).cloned() else {
            return Ok(());
        };
        entity.id = Some(to.clone());

        // Write the new key first so a crash leaves a duplicate rather than nothing.
        self.write(to, &entity).await?;
        self.kv.delete(&entity_key(from)).await?;
        self.entities.write().await.remove(from);

        info!("Entity {} is now {}", from, to);
        Ok(())
    }

    async fn write(&self, id: &EntityId, entity: &Entity) -> Result<()> {
        let bytes = serde_json::to_vec(entity)?;
        self.kv.put(&entity_key(id), bytes).await?;
        self.entities.write().await.insert(id.clone(), entity.clone());
        Ok(())
    }
}
