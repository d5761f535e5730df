//! Local filesystem key-value store.

use async_trait::async_trait;
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::kv::{KvEntry, KvStore};
use fieldsync_common::{Error, Result};

/// Local filesystem key-value store.
///
/// Stores one file per key inside a root directory. File names are the
/// percent-encoded keys, so they never contain `.`; temporary files used
/// for atomic replacement always do.
pub struct LocalKv {
    root: PathBuf,
}

impl LocalKv {
    /// Create a new local store with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        // Create root if it doesn't exist (sync for constructor)
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    /// Root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root
            .join(utf8_percent_encode(key, NON_ALPHANUMERIC).to_string())
    }

    fn decode_name(name: &str) -> Option<String> {
        if name.contains('.') {
            return None;
        }
        percent_decode_str(name)
            .decode_utf8()
            .ok()
            .map(|key| key.into_owned())
    }

    /// Flush the directory entry so a completed rename survives a crash.
    async fn sync_root(&self) {
        let root = self.root.clone();
        let result = tokio::task::spawn_blocking(move || std::fs::File::open(&root)?.sync_all()).await;
        if let Ok(Err(e)) = result {
            debug!("Directory sync skipped for {}: {}", self.root.display(), e);
        }
    }
}

#[async_trait]
impl KvStore for LocalKv {
    fn name(&self) -> &str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.key_path(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("Failed to read {}: {}", key, e))),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.key_path(key);
        let tmp_path = self.root.join(format!(".tmp-{}", Uuid::new_v4()));

        let write = async {
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(&value).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp_path, &path).await?;
            Ok::<(), std::io::Error>(())
        };

        if let Err(e) = write.await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(Error::Storage(format!("Failed to write {}: {}", key, e)));
        }

        self.sync_root().await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.key_path(key)).await {
            Ok(()) => {
                self.sync_root().await;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("Failed to delete {}: {}", key, e))),
        }
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<KvEntry>> {
        let mut dir = fs::read_dir(&self.root)
            .await
            .map_err(|e| Error::Storage(format!("Failed to list {}: {}", self.root.display(), e)))?;

        let mut results = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| Error::Storage(e.to_string()))?
        {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(key) = Self::decode_name(name) else {
                continue;
            };
            if !key.starts_with(prefix) {
                continue;
            }

            match fs::read(entry.path()).await {
                Ok(data) => results.push((key, data)),
                // Deleted between listing and reading.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Failed to read {}: {}", entry.path().display(), e);
                    return Err(Error::Storage(e.to_string()));
                }
            }
        }

        results.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_and_get() {
        let temp = TempDir::new().unwrap();
        let kv = LocalKv::new(temp.path()).unwrap();

        kv.put("entity/job 1", b"hello".to_vec()).await.unwrap();
        assert_eq!(
            kv.get("entity/job 1").await.unwrap(),
            Some(b"hello".to_vec())
        );
        assert_eq!(kv.get("entity/other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overwrite_and_delete() {
        let temp = TempDir::new().unwrap();
        let kv = LocalKv::new(temp.path()).unwrap();

        kv.put("k", b"1".to_vec()).await.unwrap();
        kv.put("k", b"2".to_vec()).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some(b"2".to_vec()));

        kv.delete("k").await.unwrap();
        kv.delete("k").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_prefix_ignores_temp_files() {
        let temp = TempDir::new().unwrap();
        let kv = LocalKv::new(temp.path()).unwrap();

        kv.put("edit/b", b"2".to_vec()).await.unwrap();
        kv.put("edit/a", b"1".to_vec()).await.unwrap();
        kv.put("entity/a", b"x".to_vec()).await.unwrap();
        std::fs::write(temp.path().join(".tmp-stray"), b"junk").unwrap();

        let listed = kv.list_prefix("edit/").await.unwrap();
        assert_eq!(
            listed,
            vec![
                ("edit/a".to_string(), b"1".to_vec()),
                ("edit/b".to_string(), b"2".to_vec())
            ]
        );
    }

    #[tokio::test]
    async fn test_persistence_across_instances() {
        let temp = TempDir::new().unwrap();
        {
            let kv = LocalKv::new(temp.path()).unwrap();
            kv.put("edit/1", b"pending".to_vec()).await.unwrap();
        }
        let kv = LocalKv::new(temp.path()).unwrap();
        assert_eq!(kv.list_prefix("").await.unwrap().len(), 1);
    }
}
