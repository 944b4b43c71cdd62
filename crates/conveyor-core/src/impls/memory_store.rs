//! In-memory entity store and a lazily populated store resolver.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::{Entity, EntityId, EntitySet, Stage, StoreError};
use crate::ports::{EntityStore, StoreResolver};

/// Fragments grouped by entity id, kept in insertion order per id.
pub struct InMemoryEntityStore {
    name: String,
    fragments: Mutex<BTreeMap<EntityId, Vec<Entity>>>,
}

impl InMemoryEntityStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fragments: Mutex::new(BTreeMap::new()),
        }
    }

    /// Ids with at least one fragment.
    pub fn entity_ids(&self) -> EntitySet {
        self.fragments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, entity: Entity) -> Result<(), StoreError> {
        self.fragments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(entity.id.clone())
            .or_default()
            .push(entity);
        Ok(())
    }

    async fn partials(&self, ids: &EntitySet) -> Result<Vec<Entity>, StoreError> {
        let fragments = self.fragments.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(ids
            .iter()
            .filter_map(|id| fragments.get(id))
            .flatten()
            .cloned()
            .collect())
    }
}

/// Opens one `InMemoryEntityStore` per dataset on first use and caches it.
#[derive(Default)]
pub struct InMemoryStoreResolver {
    stores: DashMap<String, Arc<InMemoryEntityStore>>,
}

impl InMemoryStoreResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The concrete store for `dataset`, if it has been opened.
    pub fn store(&self, dataset: &str) -> Option<Arc<InMemoryEntityStore>> {
        self.stores.get(dataset).map(|store| Arc::clone(store.value()))
    }

    pub fn datasets(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[async_trait]
impl StoreResolver for InMemoryStoreResolver {
    async fn get_dataset(
        &self,
        dataset: &str,
        mode: Stage,
    ) -> Result<Arc<dyn EntityStore>, StoreError> {
        let store: Arc<dyn EntityStore> = self
            .stores
            .entry(dataset.to_string())
            .or_insert_with(|| {
                tracing::debug!(dataset, %mode, "opening entity store");
                Arc::new(InMemoryEntityStore::new(dataset))
            })
            .clone();
        Ok(store)
    }
}
