use std::sync::Arc;

use crate::domain::{EntitySet, HandlerError, IngestPayload, Stage, TaskEnvelope};
use crate::ports::{EntityStore, Extractor};

/// Extracts the payload entity into the dataset store.
pub struct IngestHandler {
    extractor: Arc<dyn Extractor>,
}

impl IngestHandler {
    pub fn new(extractor: Arc<dyn Extractor>) -> Self {
        Self { extractor }
    }

    pub async fn handle(
        &self,
        store: Arc<dyn EntityStore>,
        task: &TaskEnvelope,
    ) -> Result<EntitySet, HandlerError> {
        let IngestPayload { entity } =
            task.decode_payload().map_err(|source| HandlerError::Payload {
                stage: Stage::Ingest,
                source,
            })?;
        tracing::debug!(entity_id = %entity.id, schema = %entity.schema, "ingesting entity");
        self.extractor
            .ingest_entity(store, entity, task.context())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        CollectionId, Entity, EntityId, Operation, Payload, Priority, TaskContext, TaskId,
    };
    use crate::impls::{InMemoryEntityStore, StoringExtractor};
    use serde_json::json;
    use ulid::Ulid;

    fn task(payload: Payload) -> TaskEnvelope {
        TaskEnvelope::new(
            TaskId::from_ulid(Ulid::new()),
            CollectionId::new("c1"),
            Operation::from(Stage::Ingest),
            Priority::new(1, 10).unwrap(),
        )
        .with_context(TaskContext::new([Stage::Analyze]))
        .with_payload(payload)
    }

    #[tokio::test]
    async fn returns_every_entity_the_extractor_touched() {
        let store = Arc::new(InMemoryEntityStore::new("c1"));
        let root = Entity::new("root", "Document")
            .with_property("children", json!([{ "id": "page-1", "schema": "Page" }]));
        let payload = IngestPayload { entity: root }.into_payload().unwrap();

        let handler = IngestHandler::new(Arc::new(StoringExtractor));
        let ids = handler.handle(store.clone(), &task(payload)).await.unwrap();

        let expected: EntitySet = ["page-1", "root"].into_iter().map(EntityId::from).collect();
        assert_eq!(ids, expected);
        assert_eq!(store.entity_ids(), expected);
    }

    #[tokio::test]
    async fn payload_without_entity_is_rejected() {
        let store = Arc::new(InMemoryEntityStore::new("c1"));
        let mut payload = Payload::new();
        payload.insert("entity_ids".to_string(), json!(["x"]));

        let handler = IngestHandler::new(Arc::new(StoringExtractor));
        let err = handler.handle(store, &task(payload)).await.unwrap_err();
        assert!(matches!(err, HandlerError::Payload { stage: Stage::Ingest, .. }));
    }
}
