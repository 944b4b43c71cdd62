//! Entity references as the dispatch engine sees them.
//!
//! The engine does not interpret entity schemas. It only needs an identity to
//! group on and an opaque bag of properties to hand to collaborators.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Set of entity ids a stage produced. Ordered, so payloads are deterministic.
pub type EntitySet = BTreeSet<EntityId>;

/// One entity, or one partial record of it.
///
/// The entity store may hold several partial records per id; analysis feeds
/// all of them into a single accumulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub schema: String,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl Entity {
    pub fn new(id: impl Into<EntityId>, schema: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            schema: schema.into(),
            properties: serde_json::Map::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn property(&self, key: &str) -> Option<&serde_json::Value> {
        self.properties.get(key)
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}
