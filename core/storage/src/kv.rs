//! Key-value store trait definition.

use async_trait::async_trait;

use fieldsync_common::Result;

/// A key with its stored value.
pub type KvEntry = (String, Vec<u8>);

/// Opaque durable key-value capability.
///
/// Keys are UTF-8 strings, conventionally namespaced with a prefix such as
/// `entity/` or `edit/`. Values are opaque bytes.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "local", "sqlite").
    fn name(&self) -> &str;

    /// Read a value.
    ///
    /// Returns `None` when the key is absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Insert or replace a value.
    ///
    /// # Postconditions
    /// - The value survives a process crash once this returns `Ok`
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove a key. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List all entries whose key starts with `prefix`, ordered by key.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<KvEntry>>;
}
