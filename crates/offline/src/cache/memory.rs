//! In-memory cache store for tests and sessions without durable storage.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use stockpro_core::{EntityKind, MutationId};

use super::{CacheStore, StoreError, StoreResult};
use crate::types::{CachedEntity, PendingMutation, SyncMeta};

#[derive(Debug, Default)]
struct State {
    /// Per kind, entries in insertion order.
    entities: HashMap<EntityKind, Vec<CachedEntity>>,
    mutations: Vec<PendingMutation>,
    meta: HashMap<EntityKind, SyncMeta>,
}

#[derive(Debug)]
pub struct InMemoryCacheStore {
    state: RwLock<State>,
    available: AtomicBool,
}

impl Default for InMemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the storage engine going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("storage engine unavailable".to_string()))
        }
    }

    fn read<R>(&self, f: impl FnOnce(&State) -> R) -> StoreResult<R> {
        self.check()?;
        let guard = self
            .state
            .read()
            .map_err(|_| StoreError::Unavailable("cache lock poisoned".to_string()))?;
        Ok(f(&guard))
    }

    fn write<R>(&self, f: impl FnOnce(&mut State) -> R) -> StoreResult<R> {
        self.check()?;
        let mut guard = self
            .state
            .write()
            .map_err(|_| StoreError::Unavailable("cache lock poisoned".to_string()))?;
        Ok(f(&mut guard))
    }
}

#[async_trait::async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn health_check(&self) -> StoreResult<()> {
        self.check()
    }

    async fn put(&self, entry: &CachedEntity) -> StoreResult<()> {
        self.write(|state| {
            let entries = state.entities.entry(entry.kind).or_default();
            match entries.iter_mut().find(|e| e.key() == entry.key()) {
                Some(existing) => *existing = entry.clone(),
                None => entries.push(entry.clone()),
            }
        })
    }

    async fn get_all(&self, kind: EntityKind) -> StoreResult<Vec<CachedEntity>> {
        self.read(|state| state.entities.get(&kind).cloned().unwrap_or_default())
    }

    async fn get(&self, kind: EntityKind, id: &str) -> StoreResult<Option<CachedEntity>> {
        self.read(|state| {
            let entries = state.entities.get(&kind)?;
            entries
                .iter()
                .find(|e| e.key().as_str() == id)
                .or_else(|| entries.iter().find(|e| e.local_id.as_str() == id))
                .cloned()
        })
    }

    async fn delete(&self, kind: EntityKind, key: &str) -> StoreResult<bool> {
        self.write(|state| {
            let Some(entries) = state.entities.get_mut(&kind) else {
                return false;
            };
            let before = entries.len();
            entries.retain(|e| e.key().as_str() != key);
            entries.len() != before
        })
    }

    async fn clear(&self, kind: EntityKind) -> StoreResult<()> {
        self.write(|state| {
            state.entities.remove(&kind);
        })
    }

    async fn push_mutation(&self, mutation: &PendingMutation) -> StoreResult<()> {
        self.write(|state| state.mutations.push(mutation.clone()))
    }

    async fn mutations(&self) -> StoreResult<Vec<PendingMutation>> {
        self.read(|state| state.mutations.clone())
    }

    async fn mutation(&self, id: MutationId) -> StoreResult<Option<PendingMutation>> {
        self.read(|state| state.mutations.iter().find(|m| m.id == id).cloned())
    }

    async fn save_mutation(&self, mutation: &PendingMutation) -> StoreResult<()> {
        self.write(|state| {
            if let Some(existing) = state.mutations.iter_mut().find(|m| m.id == mutation.id) {
                *existing = mutation.clone();
            }
        })
    }

    async fn remove_mutation(&self, id: MutationId) -> StoreResult<bool> {
        self.write(|state| {
            let before = state.mutations.len();
            state.mutations.retain(|m| m.id != id);
            state.mutations.len() != before
        })
    }

    async fn count_mutations(&self) -> StoreResult<usize> {
        self.read(|state| state.mutations.len())
    }

    async fn save_sync_meta(&self, meta: &SyncMeta) -> StoreResult<()> {
        self.write(|state| {
            state.meta.insert(meta.entity_kind, meta.clone());
        })
    }

    async fn sync_meta(&self, kind: EntityKind) -> StoreResult<Option<SyncMeta>> {
        self.read(|state| state.meta.get(&kind).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn unavailable_store_rejects_every_operation() {
        let store = InMemoryCacheStore::new();
        store.set_available(false);

        assert!(matches!(store.health_check().await, Err(StoreError::Unavailable(_))));
        assert!(store.get_all(EntityKind::Product).await.is_err());
        assert!(store.count_mutations().await.is_err());

        store.set_available(true);
        assert!(store.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn delete_by_key() {
        let store = InMemoryCacheStore::new();
        let entry =
            CachedEntity::from_remote(EntityKind::Menu, json!({ "id": "m-1", "name": "Midi" }))
                .unwrap();
        store.put(&entry).await.unwrap();

        assert!(store.delete(EntityKind::Menu, "m-1").await.unwrap());
        assert!(!store.delete(EntityKind::Menu, "m-1").await.unwrap());
    }
}
