//! Remote Sync Gateway for fieldsync.
//!
//! This crate abstracts the remote geodatabase service behind the
//! [`RemoteGateway`] trait:
//! - Upload a batch of local edits and get a per-edit outcome
//! - Download a dataset snapshot while reporting transfer progress
//!
//! [`HttpGateway`] talks JSON over HTTP; [`MemoryGateway`] is a
//! scriptable in-process service for tests and demos.

pub mod gateway;
pub mod http;
pub mod memory;

pub use gateway::{DatasetSnapshot, EditOutcome, RemoteGateway, TransferProgress, UploadOutcome};
pub use http::{HttpConfig, HttpGateway};
pub use memory::{MemoryGateway, ScriptedFailure};
