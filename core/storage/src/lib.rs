//! Durable key-value persistence for fieldsync.
//!
//! The sync engine only needs get/put/delete and list-by-key-prefix, so
//! every backend implements the small [`KvStore`] trait. Backends are
//! resolved by name through a [`BackendRegistry`].
//!
//! # Design Principles
//! - Writes are durable before the call returns
//! - Deleting a missing key is not an error
//! - Backend errors are translated into `fieldsync_common::Error`

pub mod kv;
pub mod local;
pub mod memory;
pub mod registry;
pub mod sqlite;

pub use kv::{KvEntry, KvStore};
pub use local::LocalKv;
pub use memory::MemoryKv;
pub use registry::{create_default_registry, BackendFactory, BackendRegistry};
pub use sqlite::SqliteKv;
