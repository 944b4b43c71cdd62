//! Entity store ports.
//!
//! A dataset is a logical store of entity fragments. Handlers reach it through
//! a `StoreResolver`, which may open stores lazily and cache them.

use async_trait::async_trait;
use std::sync::Arc;

use crate::domain::{Entity, EntitySet, Stage, StoreError};

#[async_trait]
pub trait EntityStore: Send + Sync {
    fn name(&self) -> &str;

    /// Adds a fragment. Fragments for the same id accumulate.
    async fn put(&self, entity: Entity) -> Result<(), StoreError>;

    /// Returns every stored fragment for `ids`.
    ///
    /// Fragments sharing an id are returned next to each other, in insertion
    /// order. Ids with no fragments are skipped.
    async fn partials(&self, ids: &EntitySet) -> Result<Vec<Entity>, StoreError>;
}

#[async_trait]
pub trait StoreResolver: Send + Sync {
    /// Opens (or returns the cached) store for `dataset`. `mode` names the
    /// stage on whose behalf it is opened.
    async fn get_dataset(
        &self,
        dataset: &str,
        mode: Stage,
    ) -> Result<Arc<dyn EntityStore>, StoreError>;
}
