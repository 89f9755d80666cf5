//! Offline-aware facade over the remote service.
//!
//! Same read/write surface as the remote client; callers never branch on
//! connectivity. Reads go to the server when online and fall back to the
//! cache when offline or when the call fails. Writes go to the server when
//! online and through the engine's optimistic helpers otherwise.
//!
//! A write is also routed through the queue when it touches a record that
//! is still local-only or has queued mutations, so it cannot overtake them.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use serde_json::Value;
use thiserror::Error;

use stockpro_core::{DomainError, Entity, EntityKind, RecordId};
use stockpro_inventory::{
    Menu, NewOutput, NewTemperatureReading, Output, Product, ProductPatch, Recipe,
    TemperatureEquipment, TemperatureReading,
};

use crate::cache::StoreError;
use crate::remote::{RemoteError, RemoteQuery};
use crate::sync_engine::{SyncEngine, SyncError};
use crate::types::{CachedEntity, SyncStatus};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("offline and local storage is unavailable")]
    OfflineUnavailable,
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error("invalid record: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Clone)]
pub struct OfflineApi {
    engine: Arc<SyncEngine>,
    /// `false` when the cache could not be opened; offline mode is then
    /// disabled for the session.
    offline_enabled: bool,
}

impl OfflineApi {
    /// Check the cache once; an unusable cache disables offline mode.
    pub async fn new(engine: Arc<SyncEngine>) -> Self {
        let offline_enabled = engine.cache().is_available().await;
        if !offline_enabled {
            tracing::warn!("local cache unavailable, offline mode disabled for this session");
        }
        Self {
            engine,
            offline_enabled,
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn is_offline_enabled(&self) -> bool {
        self.offline_enabled
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    pub async fn products(&self) -> ApiResult<Vec<Product>> {
        self.read(RemoteQuery::All).await
    }

    pub async fn outputs_for_date(&self, date: NaiveDate) -> ApiResult<Vec<Output>> {
        self.read(RemoteQuery::on_date("date", date)).await
    }

    pub async fn recipes(&self) -> ApiResult<Vec<Recipe>> {
        self.read(RemoteQuery::All).await
    }

    pub async fn menus(&self) -> ApiResult<Vec<Menu>> {
        self.read(RemoteQuery::All).await
    }

    pub async fn temperature_equipment(&self) -> ApiResult<Vec<TemperatureEquipment>> {
        self.read(RemoteQuery::All).await
    }

    /// Readings within the configured window (`reading_window_days`).
    pub async fn temperature_readings(&self) -> ApiResult<Vec<TemperatureReading>> {
        let days = i64::from(self.engine.config().reading_window_days);
        self.read(RemoteQuery::since("recorded_at", Utc::now() - ChronoDuration::days(days)))
            .await
    }

    async fn read<T: Entity>(&self, query: RemoteQuery) -> ApiResult<Vec<T>> {
        let kind = T::KIND;
        if self.engine.connectivity().is_online() {
            let fetched = self
                .engine
                .call_remote(self.engine.remote().fetch_all(kind, &query))
                .await;
            match fetched {
                Ok(rows) => return self.with_local_changes(kind, &query, rows).await,
                Err(err) if self.offline_enabled => {
                    tracing::warn!(%kind, "remote read failed, serving cached data: {err}");
                }
                Err(err) => return Err(err.into()),
            }
        }
        self.cached(kind, &query).await
    }

    async fn cached<T: Entity>(&self, kind: EntityKind, query: &RemoteQuery) -> ApiResult<Vec<T>> {
        if !self.offline_enabled {
            return Err(ApiError::OfflineUnavailable);
        }
        self.engine
            .cache()
            .get_all_raw(kind)
            .await?
            .into_iter()
            .filter(|e| e.sync_status != SyncStatus::PendingDelete && query.matches(&e.record))
            .map(|e| Ok(serde_json::from_value(e.record)?))
            .collect()
    }

    /// Server rows with this device's unsent changes laid over them.
    async fn with_local_changes<T: Entity>(
        &self,
        kind: EntityKind,
        query: &RemoteQuery,
        rows: Vec<Value>,
    ) -> ApiResult<Vec<T>> {
        let pending: Vec<CachedEntity> = if self.offline_enabled {
            self.engine
                .cache()
                .get_all_raw(kind)
                .await?
                .into_iter()
                .filter(|e| e.sync_status.is_pending())
                .collect()
        } else {
            Vec::new()
        };
        let overridden: HashSet<&str> = pending.iter().map(|e| e.key().as_str()).collect();

        let mut records: Vec<Value> = rows
            .into_iter()
            .filter(|row| {
                row.get("id")
                    .and_then(Value::as_str)
                    .is_none_or(|id| !overridden.contains(id))
            })
            .collect();
        records.extend(
            pending
                .iter()
                .filter(|e| e.sync_status != SyncStatus::PendingDelete && query.matches(&e.record))
                .map(|e| e.record.clone()),
        );

        records
            .into_iter()
            .map(|r| Ok(serde_json::from_value(r)?))
            .collect()
    }

    // ---------------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------------

    /// Record a stock output. The server deducts stock; offline, the cached
    /// product is deducted immediately.
    pub async fn create_output(&self, new: NewOutput) -> ApiResult<Output> {
        new.validate()?;
        if self.must_queue(&[&new.product_id]).await? {
            return self.create_output_offline(new).await;
        }

        let mut body = serde_json::to_value(&new)?;
        if let Value::Object(map) = &mut body {
            map.insert("created_at".to_string(), serde_json::to_value(Utc::now())?);
        }
        match self.remote_create(EntityKind::Output, &body).await {
            Ok(created) => {
                let output: Output = serde_json::from_value(created)?;
                self.write_through(&output).await;
                self.reload::<Product>(&output.product_id).await;
                Ok(output)
            }
            Err(err) if err.is_transient() && self.offline_enabled => {
                tracing::warn!("output create failed, saving offline: {err}");
                self.create_output_offline(new).await
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn create_output_offline(&self, new: NewOutput) -> ApiResult<Output> {
        Ok(self.engine.create_output_offline(new).await?.record)
    }

    /// Log a temperature; compliance is computed against the equipment range.
    pub async fn create_temperature_reading(
        &self,
        new: NewTemperatureReading,
    ) -> ApiResult<TemperatureReading> {
        if self.must_queue(&[&new.equipment_id]).await? {
            return self.create_reading_offline(new).await;
        }

        let equipment = self.equipment(&new.equipment_id).await?;
        let reading = new.clone().into_reading(RecordId::new_local(), &equipment)?;
        let mut body = serde_json::to_value(&reading)?;
        if let Value::Object(map) = &mut body {
            map.remove("id");
        }
        match self.remote_create(EntityKind::TemperatureReading, &body).await {
            Ok(created) => {
                let reading: TemperatureReading = serde_json::from_value(created)?;
                self.write_through(&reading).await;
                Ok(reading)
            }
            Err(err) if err.is_transient() && self.offline_enabled => {
                tracing::warn!("temperature reading create failed, saving offline: {err}");
                self.create_reading_offline(new).await
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn create_reading_offline(&self, new: NewTemperatureReading) -> ApiResult<TemperatureReading> {
        Ok(self.engine.create_temperature_reading_offline(new).await?.record)
    }

    pub async fn update_product(&self, id: &RecordId, patch: ProductPatch) -> ApiResult<Product> {
        patch.validate()?;
        if self.must_queue(&[id]).await? {
            return Ok(self.engine.update_product_offline(id, patch).await?.record);
        }

        let body = serde_json::to_value(&patch)?;
        let updated = self
            .engine
            .call_remote(self.engine.remote().update(EntityKind::Product, id, &body))
            .await;
        match updated {
            Ok(record) => {
                let product: Product = serde_json::from_value(record)?;
                self.write_through(&product).await;
                Ok(product)
            }
            Err(err) if err.is_transient() && self.offline_enabled => {
                tracing::warn!(product = %id, "product update failed, saving offline: {err}");
                Ok(self.engine.update_product_offline(id, patch).await?.record)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn delete_output(&self, id: &RecordId) -> ApiResult<()> {
        if self.must_queue(&[id]).await? {
            self.engine.delete_offline(EntityKind::Output, id).await?;
            return Ok(());
        }

        let product_id = self.cached_output_product(id).await;
        let deleted = self
            .engine
            .call_remote(self.engine.remote().delete(EntityKind::Output, id))
            .await;
        match deleted {
            Ok(()) => {
                if self.offline_enabled {
                    self.engine.cache().delete(EntityKind::Output, id).await?;
                }
                if let Some(product_id) = product_id {
                    self.reload::<Product>(&product_id).await;
                }
                Ok(())
            }
            Err(err) if err.is_transient() && self.offline_enabled => {
                tracing::warn!(output = %id, "output delete failed, saving offline: {err}");
                self.engine.delete_offline(EntityKind::Output, id).await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    // ---------------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------------

    /// Route through the queue when offline, or when any of `ids` is
    /// local-only or still has queued mutations.
    async fn must_queue(&self, ids: &[&RecordId]) -> ApiResult<bool> {
        let queue = if !self.engine.connectivity().is_online() {
            true
        } else if !self.offline_enabled {
            false
        } else {
            let mut queue = false;
            for id in ids {
                if id.is_local() || self.engine.cache().is_referenced_by_mutation(id).await? {
                    queue = true;
                    break;
                }
            }
            queue
        };

        if queue && !self.offline_enabled {
            return Err(ApiError::OfflineUnavailable);
        }
        Ok(queue)
    }

    async fn remote_create(&self, kind: EntityKind, body: &Value) -> Result<Value, RemoteError> {
        self.engine
            .call_remote(self.engine.remote().create(kind, body))
            .await
    }

    async fn equipment(&self, id: &RecordId) -> ApiResult<TemperatureEquipment> {
        if self.offline_enabled {
            if let Some(entry) = self.engine.cache().get_by_id::<TemperatureEquipment>(id).await? {
                return Ok(entry.record);
            }
        }
        let record = self
            .engine
            .call_remote(
                self.engine
                    .remote()
                    .fetch_by_id(EntityKind::TemperatureEquipment, id),
            )
            .await?
            .ok_or_else(|| DomainError::not_found(format!("equipment {id}")))?;
        Ok(serde_json::from_value(record)?)
    }

    async fn cached_output_product(&self, id: &RecordId) -> Option<RecordId> {
        if !self.offline_enabled {
            return None;
        }
        match self.engine.cache().get_by_id::<Output>(id).await {
            Ok(entry) => entry.map(|e| e.record.product_id),
            Err(err) => {
                tracing::debug!(output = %id, "could not read cached output: {err}");
                None
            }
        }
    }

    /// Mirror a server-confirmed record into the cache. Best effort.
    async fn write_through<T: Entity>(&self, record: &T) {
        if !self.offline_enabled {
            return;
        }
        if let Err(err) = self.engine.cache().put(&CachedEntity::synced(record.clone())).await {
            tracing::warn!(kind = %T::KIND, id = %record.id(), "failed to cache server record: {err}");
        }
    }

    /// Re-read one record from the server into the cache. Best effort.
    async fn reload<T: Entity>(&self, id: &RecordId) {
        if !self.offline_enabled {
            return;
        }
        let fetched = self
            .engine
            .call_remote(self.engine.remote().fetch_by_id(T::KIND, id))
            .await;
        match fetched {
            Ok(Some(record)) => match serde_json::from_value::<T>(record) {
                Ok(record) => self.write_through(&record).await,
                Err(err) => tracing::warn!(kind = %T::KIND, %id, "server returned invalid record: {err}"),
            },
            Ok(None) => {}
            Err(err) => tracing::debug!(kind = %T::KIND, %id, "reload failed: {err}"),
        }
    }
}
