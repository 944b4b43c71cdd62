//! Stage collaborator ports: extraction and analysis.
//!
//! The engine only schedules these; what they do with an entity is their
//! business.

use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::{Entity, EntityId, EntitySet, HandlerError, TaskContext};
use crate::ports::EntityStore;

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Extracts `entity`, writing everything it finds to `store`.
    ///
    /// Returns the ids of every entity touched, root included.
    async fn ingest_entity(
        &self,
        store: Arc<dyn EntityStore>,
        entity: Entity,
        context: &TaskContext,
    ) -> Result<EntitySet, HandlerError>;
}

pub trait AnalyzerFactory: Send + Sync {
    /// Opens an accumulator for the identity of `first`.
    ///
    /// `first` is not fed; the caller feeds every fragment, this one included.
    fn open(
        &self,
        store: Arc<dyn EntityStore>,
        first: &Entity,
        context: &TaskContext,
    ) -> Box<dyn Analysis>;
}

/// Accumulator over all fragments of one entity.
#[async_trait]
pub trait Analysis: Send {
    fn entity_id(&self) -> &EntityId;

    fn feed(&mut self, fragment: &Entity);

    /// Finishes the analysis and returns any newly discovered entity ids.
    async fn flush(self: Box<Self>) -> Result<EntitySet, HandlerError>;
}
