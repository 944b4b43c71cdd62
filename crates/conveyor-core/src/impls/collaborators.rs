//! Reference stage collaborators.
//!
//! `StoringExtractor` treats an entity's `children` property as already
//! extracted sub-entities and stores the whole tree. `MentionAnalyzer` collects
//! the ids listed under `mentions` across all fragments of an entity and
//! writes one `Mention` entity per id on flush.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::{Entity, EntityId, EntitySet, HandlerError, TaskContext};
use crate::ports::{Analysis, AnalyzerFactory, EntityStore, Extractor};

pub const CHILDREN_PROPERTY: &str = "children";
pub const MENTIONS_PROPERTY: &str = "mentions";
pub const MENTION_SCHEMA: &str = "Mention";

#[derive(Debug, Clone, Copy, Default)]
pub struct StoringExtractor;

impl StoringExtractor {
    fn flatten(root: Entity) -> Result<Vec<Entity>, HandlerError> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(mut entity) = stack.pop() {
            if let Some(children) = entity.properties.remove(CHILDREN_PROPERTY) {
                let children: Vec<Entity> =
                    serde_json::from_value(children).map_err(|e| HandlerError::Extraction {
                        entity_id: entity.id.clone(),
                        reason: format!("invalid children: {e}"),
                    })?;
                // Reversed so children come out in document order.
                stack.extend(children.into_iter().rev());
            }
            out.push(entity);
        }
        Ok(out)
    }
}

#[async_trait]
impl Extractor for StoringExtractor {
    async fn ingest_entity(
        &self,
        store: Arc<dyn EntityStore>,
        entity: Entity,
        _context: &TaskContext,
    ) -> Result<EntitySet, HandlerError> {
        let mut touched = EntitySet::new();
        for entity in Self::flatten(entity)? {
            touched.insert(entity.id.clone());
            store.put(entity).await?;
        }
        Ok(touched)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MentionAnalyzer;

impl AnalyzerFactory for MentionAnalyzer {
    fn open(
        &self,
        store: Arc<dyn EntityStore>,
        first: &Entity,
        _context: &TaskContext,
    ) -> Box<dyn Analysis> {
        Box::new(MentionAnalysis {
            entity_id: first.id.clone(),
            store,
            mentions: EntitySet::new(),
        })
    }
}

struct MentionAnalysis {
    entity_id: EntityId,
    store: Arc<dyn EntityStore>,
    mentions: EntitySet,
}

#[async_trait]
impl Analysis for MentionAnalysis {
    fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    fn feed(&mut self, fragment: &Entity) {
        let Some(Value::Array(values)) = fragment.property(MENTIONS_PROPERTY) else {
            return;
        };
        self.mentions.extend(
            values
                .iter()
                .filter_map(Value::as_str)
                .filter(|id| *id != self.entity_id.as_str())
                .map(EntityId::from),
        );
    }

    async fn flush(self: Box<Self>) -> Result<EntitySet, HandlerError> {
        for mention in &self.mentions {
            let entity = Entity::new(mention.clone(), MENTION_SCHEMA).with_property(
                "mentionedIn",
                Value::String(self.entity_id.as_str().to_string()),
            );
            self.store.put(entity).await?;
        }
        Ok(self.mentions)
    }
}
