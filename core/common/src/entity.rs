//! Domain entities stored on the device and mirrored to the remote service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::EntityId;

/// Kind of spatial feature an entity represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum GeometryType {
    Point,
    Polyline,
    Polygon,
    Unknown,
}

impl GeometryType {
    /// Parse a geometry type name as sent by the remote geodatabase.
    ///
    /// Accepts both the canonical names and the `esriGeometry*` spelling,
    /// case-insensitively. Anything unrecognised maps to `Unknown`.
    pub fn parse(name: &str) -> Self {
        let lowered = name.trim().to_ascii_lowercase();
        let short = lowered.strip_prefix("esrigeometry").unwrap_or(&lowered);
        match short {
            "point" | "multipoint" => GeometryType::Point,
            "polyline" | "line" => GeometryType::Polyline,
            "polygon" => GeometryType::Polygon,
            _ => GeometryType::Unknown,
        }
    }

    /// Canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            GeometryType::Point => "POINT",
            GeometryType::Polyline => "POLYLINE",
            GeometryType::Polygon => "POLYGON",
            GeometryType::Unknown => "UNKNOWN",
        }
    }
}

impl From<String> for GeometryType {
    fn from(name: String) -> Self {
        GeometryType::parse(&name)
    }
}

impl From<GeometryType> for String {
    fn from(kind: GeometryType) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for GeometryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single x/y (longitude/latitude) position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub x: f64,
    pub y: f64,
}

/// Geometry descriptor of a spatial feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    #[serde(rename = "type")]
    pub kind: GeometryType,
    #[serde(default)]
    pub coordinates: Vec<Coordinate>,
}

impl Geometry {
    /// A point geometry.
    pub fn point(x: f64, y: f64) -> Self {
        Self {
            kind: GeometryType::Point,
            coordinates: vec![Coordinate { x, y }],
        }
    }
}

/// A domain object such as a job-card entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Identifier; `None` until the entity is first saved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<EntityId>,
    /// Domain fields.
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
    /// Geometry when the entity is a spatial feature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Geometry>,
    /// Last modification time.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Create an entity without an identifier.
    pub fn new() -> Self {
        Self {
            id: None,
            fields: BTreeMap::new(),
            geometry: None,
            updated_at: Utc::now(),
        }
    }

    /// Create an entity with a known identifier.
    pub fn with_id(id: EntityId) -> Self {
        Self {
            id: Some(id),
            ..Self::new()
        }
    }

    /// Set a field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Set the geometry.
    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = Some(geometry);
        self
    }

    /// Read a field.
    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.fields.get(key)
    }

    /// Geometry type, `Unknown` for non-spatial entities.
    pub fn geometry_type(&self) -> GeometryType {
        self.geometry
            .as_ref()
            .map(|g| g.kind)
            .unwrap_or(GeometryType::Unknown)
    }

    /// Identifier of a persisted entity.
    ///
    /// # Errors
    /// - Returns error if the entity has not been assigned an identifier
    pub fn require_id(&self) -> crate::Result<&EntityId> {
        self.id
            .as_ref()
            .ok_or_else(|| crate::Error::InvalidInput("Entity has no identifier".to_string()))
    }
}

impl Default for Entity {
    fn default() -> Self {
        Self::new()
    }
}
