//! Common types shared across the fieldsync crates.
//!
//! This crate holds the error taxonomy and the data model (entities and
//! local edits) so that storage, gateway and sync code agree on one
//! vocabulary.

pub mod edit;
pub mod entity;
pub mod error;
pub mod types;

pub use edit::{EditKind, EditState, LocalEdit};
pub use entity::{Coordinate, Entity, Geometry, GeometryType};
pub use error::{Error, Result};
pub use types::{EditId, EntityId};
