//! Local Cache Store: mirrored collections, the pending-mutation queue and
//! per-collection sync metadata.
//!
//! [`CacheStore`] is the storage seam (SQLite on devices, in-memory for tests
//! and for sessions where persistent storage cannot be opened). [`LocalCache`]
//! layers the typed API and the queue bookkeeping on top of it. The cache
//! itself performs no retries; every storage failure is returned to the caller.

use std::sync::Arc;

use thiserror::Error;

use stockpro_core::{Entity, EntityKind, MutationId, RecordId, id::is_local_id};

use crate::references;
use crate::types::{CachedEntity, MutationStatus, PendingMutation, SyncMeta};

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryCacheStore;
pub use sqlite::SqliteCacheStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The storage engine cannot be opened (or went away mid-session).
    #[error("local cache unavailable: {0}")]
    Unavailable(String),
    #[error("storage backend error: {0}")]
    Backend(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt cache row: {0}")]
    Corrupt(String),
}

/// Raw storage operations. Implementations keep the mutation queue in
/// insertion order; `save_mutation` updates in place without moving a
/// mutation to the back of the queue.
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    /// Open (if needed) and check the storage engine.
    async fn health_check(&self) -> StoreResult<()>;

    /// Insert or replace the entry stored under `entry.key()`.
    async fn put(&self, entry: &CachedEntity) -> StoreResult<()>;

    async fn get_all(&self, kind: EntityKind) -> StoreResult<Vec<CachedEntity>>;

    /// Look up by current key or by the original local id.
    async fn get(&self, kind: EntityKind, id: &str) -> StoreResult<Option<CachedEntity>>;

    /// Delete the entry stored under `key`.
    async fn delete(&self, kind: EntityKind, key: &str) -> StoreResult<bool>;

    async fn clear(&self, kind: EntityKind) -> StoreResult<()>;

    async fn push_mutation(&self, mutation: &PendingMutation) -> StoreResult<()>;

    /// All queued mutations in FIFO order.
    async fn mutations(&self) -> StoreResult<Vec<PendingMutation>>;

    async fn mutation(&self, id: MutationId) -> StoreResult<Option<PendingMutation>>;

    async fn save_mutation(&self, mutation: &PendingMutation) -> StoreResult<()>;

    async fn remove_mutation(&self, id: MutationId) -> StoreResult<bool>;

    async fn count_mutations(&self) -> StoreResult<usize>;

    async fn save_sync_meta(&self, meta: &SyncMeta) -> StoreResult<()>;

    async fn sync_meta(&self, kind: EntityKind) -> StoreResult<Option<SyncMeta>>;
}

/// Typed handle over a [`CacheStore`]. Cheap to clone.
#[derive(Clone)]
pub struct LocalCache {
    store: Arc<dyn CacheStore>,
}

impl core::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LocalCache").finish_non_exhaustive()
    }
}

impl LocalCache {
    pub fn new(store: impl CacheStore + 'static) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    pub fn from_store(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// Non-persistent cache (tests, or sessions without durable storage).
    pub fn in_memory() -> Self {
        Self::new(InMemoryCacheStore::new())
    }

    /// Check the storage engine.
    ///
    /// `false` means offline mode is disabled for the whole session; it is not
    /// a transient condition to retry.
    pub async fn is_available(&self) -> bool {
        match self.store.health_check().await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!("local cache unavailable, offline mode disabled: {err}");
                false
            }
        }
    }

    pub async fn put<T: Entity>(&self, entry: &CachedEntity<T>) -> StoreResult<()> {
        self.store.put(&entry.to_untyped()?).await
    }

    pub async fn put_raw(&self, entry: &CachedEntity) -> StoreResult<()> {
        self.store.put(entry).await
    }

    pub async fn get_all<T: Entity>(&self) -> StoreResult<Vec<CachedEntity<T>>> {
        self.store
            .get_all(T::KIND)
            .await?
            .into_iter()
            .map(|e| e.into_typed::<T>().map_err(StoreError::from))
            .collect()
    }

    pub async fn get_all_raw(&self, kind: EntityKind) -> StoreResult<Vec<CachedEntity>> {
        self.store.get_all(kind).await
    }

    pub async fn get_by_id<T: Entity>(&self, id: &RecordId) -> StoreResult<Option<CachedEntity<T>>> {
        match self.store.get(T::KIND, id.as_str()).await? {
            Some(entry) => Ok(Some(entry.into_typed::<T>()?)),
            None => Ok(None),
        }
    }

    pub async fn get_raw(&self, kind: EntityKind, id: &RecordId) -> StoreResult<Option<CachedEntity>> {
        self.store.get(kind, id.as_str()).await
    }

    pub async fn delete(&self, kind: EntityKind, key: &RecordId) -> StoreResult<bool> {
        self.store.delete(kind, key.as_str()).await
    }

    /// Drop a whole collection (full refresh or logout).
    pub async fn clear(&self, kind: EntityKind) -> StoreResult<()> {
        self.store.clear(kind).await
    }

    pub fn generate_local_id(&self) -> RecordId {
        RecordId::new_local()
    }

    pub fn is_local_id(&self, id: &str) -> bool {
        is_local_id(id)
    }

    /// Append a mutation to the tail of the queue.
    pub async fn queue_mutation(&self, mutation: PendingMutation) -> StoreResult<PendingMutation> {
        self.store.push_mutation(&mutation).await?;
        tracing::debug!(
            mutation_id = %mutation.id,
            kind = %mutation.entity_kind,
            operation = %mutation.operation,
            target = %mutation.target_id,
            "mutation queued"
        );
        Ok(mutation)
    }

    /// All queued mutations (pending and failed), oldest first.
    pub async fn pending_mutations(&self) -> StoreResult<Vec<PendingMutation>> {
        self.store.mutations().await
    }

    pub async fn mutation(&self, id: MutationId) -> StoreResult<Option<PendingMutation>> {
        self.store.mutation(id).await
    }

    pub async fn save_mutation(&self, mutation: &PendingMutation) -> StoreResult<()> {
        self.store.save_mutation(mutation).await
    }

    /// Record a failed attempt: bump `retry_count` and keep the error.
    pub async fn update_mutation_retry(
        &self,
        id: MutationId,
        error: &str,
    ) -> StoreResult<Option<PendingMutation>> {
        let Some(mut mutation) = self.store.mutation(id).await? else {
            return Ok(None);
        };
        mutation.retry_count += 1;
        mutation.last_error = Some(error.to_string());
        self.store.save_mutation(&mutation).await?;
        Ok(Some(mutation))
    }

    /// Park a mutation as "needs attention"; drains skip it from now on.
    pub async fn mark_mutation_failed(&self, id: MutationId) -> StoreResult<bool> {
        self.set_mutation_status(id, MutationStatus::Failed, false).await
    }

    /// Make a failed mutation eligible again (same queue position, fresh retry budget).
    pub async fn reset_mutation(&self, id: MutationId) -> StoreResult<bool> {
        self.set_mutation_status(id, MutationStatus::Pending, true).await
    }

    async fn set_mutation_status(
        &self,
        id: MutationId,
        status: MutationStatus,
        reset_retries: bool,
    ) -> StoreResult<bool> {
        let Some(mut mutation) = self.store.mutation(id).await? else {
            return Ok(false);
        };
        mutation.status = status;
        if reset_retries {
            mutation.retry_count = 0;
            mutation.last_error = None;
        }
        self.store.save_mutation(&mutation).await?;
        Ok(true)
    }

    pub async fn remove_mutation(&self, id: MutationId) -> StoreResult<bool> {
        self.store.remove_mutation(id).await
    }

    /// Number of queued mutations, for badges.
    pub async fn pending_mutations_count(&self) -> StoreResult<usize> {
        self.store.count_mutations().await
    }

    pub async fn failed_mutations(&self) -> StoreResult<Vec<PendingMutation>> {
        Ok(self
            .store
            .mutations()
            .await?
            .into_iter()
            .filter(PendingMutation::needs_attention)
            .collect())
    }

    /// The queued mutation targeting `id`, if any.
    pub async fn mutation_for_target(
        &self,
        kind: EntityKind,
        id: &RecordId,
    ) -> StoreResult<Option<PendingMutation>> {
        Ok(self
            .store
            .mutations()
            .await?
            .into_iter()
            .find(|m| m.entity_kind == kind && &m.target_id == id))
    }

    /// `true` when a queued mutation targets or mentions `id`.
    pub async fn is_referenced_by_mutation(&self, id: &RecordId) -> StoreResult<bool> {
        Ok(self
            .store
            .mutations()
            .await?
            .iter()
            .any(|m| &m.target_id == id || references::references(&m.payload, id.as_str())))
    }

    pub async fn update_sync_meta(
        &self,
        kind: EntityKind,
        synced_count: usize,
        failed_count: usize,
    ) -> StoreResult<SyncMeta> {
        let meta = SyncMeta::new(kind, synced_count, failed_count);
        self.store.save_sync_meta(&meta).await?;
        Ok(meta)
    }

    pub async fn sync_meta(&self, kind: EntityKind) -> StoreResult<Option<SyncMeta>> {
        self.store.sync_meta(kind).await
    }

    /// Replace every reference to the local id `old` with the server id `new`,
    /// in queued mutations and in cached records. The entry whose key was
    /// `old` is re-keyed under `new`. Returns the number of rows rewritten.
    pub async fn rewrite_local_id(&self, old: &RecordId, new: &RecordId) -> StoreResult<usize> {
        let mut rewritten = 0;

        for mut mutation in self.store.mutations().await? {
            let mut changed = false;
            if &mutation.target_id == old {
                mutation.target_id = new.clone();
                changed = true;
            }
            changed |= references::rewrite_id(&mut mutation.payload, old.as_str(), new.as_str());
            if changed {
                self.store.save_mutation(&mutation).await?;
                rewritten += 1;
            }
        }

        for kind in EntityKind::ALL {
            for mut entry in self.store.get_all(kind).await? {
                let rekey = entry.key() == old;
                let changed = references::rewrite_id(&mut entry.record, old.as_str(), new.as_str());
                if !rekey && !changed {
                    continue;
                }
                if rekey {
                    self.store.delete(kind, old.as_str()).await?;
                    entry.remote_id = Some(new.clone());
                }
                self.store.put(&entry).await?;
                rewritten += 1;
            }
        }

        Ok(rewritten)
    }
}
