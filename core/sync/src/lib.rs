//! fieldsync sync engine
//!
//! Offline-first synchronization between an on-device entity store and a
//! remote geodatabase service:
//! - Entity store and durable local edit log over a key-value backend
//! - Upload coordinator with per-entity ordering and exponential backoff
//! - Download coordinator with local-edit-wins merge and a progress stream
//! - Orchestrator running upload-then-download, one session at a time
//! - Manual, periodic and on-demand scheduling

pub mod config;
pub mod download;
pub mod edit_log;
pub mod engine;
pub mod locks;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod upload;

pub use config::SyncConfig;
pub use download::{DownloadCoordinator, DownloadSummary};
pub use edit_log::{EditCounts, EditLog};
pub use engine::{SyncEngine, SyncPhase, SyncStatus, SyncSummary};
pub use locks::KeyedLocks;
pub use progress::{DownloadProgress, ProgressBroadcaster, ProgressSession};
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::{SyncMode, SyncScheduler, SyncSchedulerHandle};
pub use store::{EntityStore, IdGenerator, SequentialIdGenerator, UuidIdGenerator};
pub use upload::{EditFailure, UploadCoordinator, UploadSummary};
