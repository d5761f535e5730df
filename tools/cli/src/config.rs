//! CLI configuration file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fieldsync_gateway::{HttpConfig, HttpGateway, MemoryGateway, RemoteGateway};
use fieldsync_storage::{create_default_registry, KvStore};
use fieldsync_sync::{SyncConfig, SyncEngine};

/// File name of the configuration inside the data directory.
pub const CONFIG_FILE: &str = "fieldsync.json";

/// Contents of `fieldsync.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Storage backend name: `local`, `sqlite` or `memory`.
    pub backend: String,
    /// Backend-specific settings, e.g. `{"root": "..."}` or `{"path": "..."}`.
    pub backend_config: serde_json::Value,
    /// Base URL of the remote geodatabase service. `memory:` uses an
    /// in-process service that forgets everything on exit.
    pub remote_url: String,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub sync: SyncConfig,
}

fn default_timeout_secs() -> u64 {
    30
}

impl CliConfig {
    /// Default configuration storing data under `data_dir`.
    pub fn new(backend: &str, data_dir: &Path, remote_url: &str) -> Result<Self> {
        let backend_config = match backend {
            "local" => serde_json::json!({ "root": data_dir.join("store") }),
            "sqlite" => serde_json::json!({ "path": data_dir.join("fieldsync.db") }),
            "memory" => serde_json::json!({}),
            other => anyhow::bail!("Unknown backend '{}'. Use: local, sqlite, or memory", other),
        };

        Ok(Self {
            backend: backend.to_string(),
            backend_config,
            remote_url: remote_url.to_string(),
            request_timeout_secs: default_timeout_secs(),
            sync: SyncConfig::default(),
        })
    }

    /// Read a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| {
            format!(
                "Failed to read config {} (run `fieldsync init` first)",
                path.display()
            )
        })?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Write the configuration file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config {}", path.display()))
    }

    /// Build the key-value backend.
    pub fn open_store(&self) -> Result<Arc<dyn KvStore>> {
        let registry = create_default_registry();
        registry
            .resolve(&self.backend, &self.backend_config)
            .with_context(|| format!("Failed to open {} storage", self.backend))
    }

    /// Build the remote gateway.
    pub fn open_gateway(&self) -> Result<Arc<dyn RemoteGateway>> {
        if self.remote_url == "memory:" {
            return Ok(Arc::new(MemoryGateway::new()));
        }
        let http = HttpConfig::new(self.remote_url.clone())
            .with_timeout(Duration::from_secs(self.request_timeout_secs));
        let gateway = HttpGateway::new(http)
            .with_context(|| format!("Invalid remote URL {}", self.remote_url))?;
        Ok(Arc::new(gateway))
    }

    /// Open the sync engine described by this configuration.
    pub async fn open_engine(&self) -> Result<SyncEngine> {
        let kv = self.open_store()?;
        let gateway = self.open_gateway()?;
        SyncEngine::open(kv, gateway, self.sync.clone())
            .await
            .context("Failed to open sync engine")
    }
}

/// Default data directory, `<platform data dir>/fieldsync`.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fieldsync")
}

/// Default configuration path.
pub fn default_config_path() -> PathBuf {
    default_data_dir().join(CONFIG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_round_trip_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        let config = CliConfig::new("sqlite", dir.path(), "https://gis.example.com/api").unwrap();

        config.save(&path).unwrap();
        let loaded = CliConfig::load(&path).unwrap();
        assert_eq!(loaded.backend, "sqlite");
        assert_eq!(loaded.remote_url, "https://gis.example.com/api");
        assert_eq!(loaded.sync, SyncConfig::default());
    }

    #[test]
    fn test_unknown_backend() {
        let dir = TempDir::new().unwrap();
        assert!(CliConfig::new("gdrive", dir.path(), "memory:").is_err());
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config: CliConfig = serde_json::from_str(
            r#"{"backend": "memory", "backend_config": {}, "remote_url": "memory:"}"#,
        )
        .unwrap();
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.sync.batch_size, 25);
    }

    #[tokio::test]
    async fn test_open_engine_on_local_backend() {
        let dir = TempDir::new().unwrap();
        let config = CliConfig::new("local", dir.path(), "memory:").unwrap();
        let engine = config.open_engine().await.unwrap();
        assert_eq!(engine.status().await.entities, 0);
    }
}
