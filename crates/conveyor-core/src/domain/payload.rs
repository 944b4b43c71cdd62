//! Stage payloads.
//!
//! On the wire a payload is an open JSON object. Handlers decode it into the
//! typed shape they expect; a payload that does not decode is a permanent
//! failure for that task.

use serde::{Deserialize, Serialize};

use super::entity::{Entity, EntityId, EntitySet};

/// Raw payload object as carried by the envelope.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Ingest input: the root entity itself is the payload object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IngestPayload {
    pub entity: Entity,
}

/// Input of every stage after ingest, and the output of every handler.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityIdsPayload {
    #[serde(default)]
    pub entity_ids: Vec<EntityId>,
}

impl EntityIdsPayload {
    pub fn into_payload(self) -> Payload {
        let mut payload = Payload::new();
        payload.insert(
            "entity_ids".to_string(),
            serde_json::Value::Array(
                self.entity_ids
                    .into_iter()
                    .map(|id| serde_json::Value::String(id.as_str().to_string()))
                    .collect(),
            ),
        );
        payload
    }
}

impl From<EntitySet> for EntityIdsPayload {
    fn from(ids: EntitySet) -> Self {
        Self {
            entity_ids: ids.into_iter().collect(),
        }
    }
}

impl IngestPayload {
    /// Encodes the root entity as an ingest payload object.
    pub fn into_payload(self) -> Result<Payload, serde_json::Error> {
        match serde_json::to_value(self.entity)? {
            serde_json::Value::Object(map) => Ok(map),
            _ => Ok(Payload::new()),
        }
    }
}
