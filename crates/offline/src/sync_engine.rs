//! Sync engine: moves the client from "diverged" to "converged".
//!
//! Three jobs:
//! - drain the pending-mutation queue against the remote service, resolving
//!   local ids to server ids as creates are acknowledged
//! - refresh the cached collections from the server
//! - stage optimistic offline writes (cache entry + queued mutation)
//!
//! ## Drain policy
//!
//! Mutations are sent in FIFO order. When one fails, every later mutation
//! that depends on it (same target, or a payload mentioning a blocked id) is
//! deferred to the next drain; blocking is transitive within a drain.
//! Independent mutations keep going. A failed mutation keeps its queue
//! position.
//!
//! Transient failures are retried on later drains until `max_retries` is
//! reached; permanent failures are parked immediately. Parked mutations are
//! skipped (and block their dependents) until retried or discarded.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use stockpro_core::{DomainError, EntityKind, MutationId, RecordId};
use stockpro_inventory::{
    NewOutput, NewTemperatureReading, Output, Product, ProductPatch, TemperatureEquipment,
    TemperatureReading,
};

use crate::cache::{LocalCache, StoreError};
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::notify::{Notification, Notifier, TracingNotifier};
use crate::references;
use crate::remote::{RemoteError, RemoteQuery, RemoteResult, RemoteService};
use crate::types::{
    CacheRefreshReport, CachedEntity, MutationFailure, MutationOperation, PendingMutation,
    SyncStatus, SyncSummary,
};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("client is offline; operation requires network connection")]
    Offline,
    #[error("a queue drain is already in progress")]
    DrainInProgress,
    #[error("a cache refresh is already in progress")]
    RefreshInProgress,
    #[error("mutation {0} not found")]
    MutationNotFound(MutationId),
    #[error(transparent)]
    Storage(#[from] StoreError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Storage(StoreError::Serialization(err))
    }
}

/// Named stages of a full sync, run in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    /// Push local writes first so the refresh cannot hide them.
    DrainQueue,
    RefreshCache,
    /// Publish pending / needs-attention counts.
    Notify,
}

impl SyncStage {
    pub const PIPELINE: [SyncStage; 3] = [
        SyncStage::DrainQueue,
        SyncStage::RefreshCache,
        SyncStage::Notify,
    ];
}

/// Outcome of [`SyncEngine::full_sync`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FullSyncReport {
    pub drain: SyncSummary,
    pub refresh: CacheRefreshReport,
    pub completed: Vec<SyncStage>,
}

/// Failure while applying a single mutation.
#[derive(Debug)]
enum ApplyError {
    /// The server rejected the write or could not be reached.
    Remote(RemoteError),
    /// The server accepted the write; local bookkeeping did not finish.
    Unfinished(StoreError),
}

impl From<RemoteError> for ApplyError {
    fn from(err: RemoteError) -> Self {
        ApplyError::Remote(err)
    }
}

/// Clears an in-progress flag when dropped.
struct InProgress<'a>(&'a AtomicBool);

impl<'a> InProgress<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| InProgress(flag))
    }
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncEngine {
    cache: LocalCache,
    remote: Arc<dyn RemoteService>,
    connectivity: ConnectivityMonitor,
    notifier: Arc<dyn Notifier>,
    config: SyncConfig,
    draining: AtomicBool,
    refreshing: AtomicBool,
    /// Mutation currently on the wire; never coalesced into.
    in_flight: Mutex<Option<MutationId>>,
    /// Server responses for mutations whose local bookkeeping is unfinished.
    acknowledged: Mutex<HashMap<MutationId, Value>>,
}

impl core::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("draining", &self.is_draining())
            .field("refreshing", &self.is_refreshing())
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    pub fn new(
        cache: LocalCache,
        remote: Arc<dyn RemoteService>,
        connectivity: ConnectivityMonitor,
        config: SyncConfig,
    ) -> Self {
        Self {
            cache,
            remote,
            connectivity,
            notifier: Arc::new(TracingNotifier),
            config,
            draining: AtomicBool::new(false),
            refreshing: AtomicBool::new(false),
            in_flight: Mutex::new(None),
            acknowledged: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    pub fn remote(&self) -> &Arc<dyn RemoteService> {
        &self.remote
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn notify(&self, notification: Notification) {
        self.notifier.notify(notification);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::SeqCst)
    }

    /// Run a remote call under the configured timeout; expiry is transient.
    pub async fn call_remote<T>(&self, fut: impl Future<Output = RemoteResult<T>>) -> RemoteResult<T> {
        match tokio::time::timeout(self.config.remote_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::timeout(self.config.remote_timeout)),
        }
    }

    fn set_in_flight(&self, id: Option<MutationId>) {
        *self.in_flight.lock().unwrap_or_else(|p| p.into_inner()) = id;
    }

    fn is_in_flight(&self, id: MutationId) -> bool {
        *self.in_flight.lock().unwrap_or_else(|p| p.into_inner()) == Some(id)
    }

    /// On the wire or already taken by the server; no longer editable.
    fn is_sent(&self, mutation: &PendingMutation) -> bool {
        self.is_in_flight(mutation.id) || self.acknowledgment(mutation).is_some()
    }

    // ---------------------------------------------------------------------
    // Full cache refresh
    // ---------------------------------------------------------------------

    /// Overwrite every cached collection with the server's view.
    ///
    /// Entries still referenced by a queued mutation (or carrying a pending
    /// status) are kept as-is. Collections are fetched concurrently; one
    /// failing collection does not prevent the others from refreshing.
    pub async fn cache_all_data(&self) -> Result<CacheRefreshReport, SyncError> {
        if !self.connectivity.is_online() {
            return Err(SyncError::Offline);
        }
        let _guard = InProgress::acquire(&self.refreshing).ok_or(SyncError::RefreshInProgress)?;

        let now = Utc::now();
        let today = RemoteQuery::on_date("date", now.date_naive());
        let readings_since = RemoteQuery::since(
            "recorded_at",
            now - ChronoDuration::days(i64::from(self.config.reading_window_days)),
        );
        let all = RemoteQuery::All;

        tracing::info!("refreshing offline cache");
        let (products, outputs, equipment, readings, recipes, menus) = tokio::join!(
            self.call_remote(self.remote.fetch_all(EntityKind::Product, &all)),
            self.call_remote(self.remote.fetch_all(EntityKind::Output, &today)),
            self.call_remote(self.remote.fetch_all(EntityKind::TemperatureEquipment, &all)),
            self.call_remote(self.remote.fetch_all(EntityKind::TemperatureReading, &readings_since)),
            self.call_remote(self.remote.fetch_all(EntityKind::Recipe, &all)),
            self.call_remote(self.remote.fetch_all(EntityKind::Menu, &all)),
        );

        let mut report = CacheRefreshReport::default();
        for (kind, fetched) in [
            (EntityKind::Product, products),
            (EntityKind::Output, outputs),
            (EntityKind::TemperatureEquipment, equipment),
            (EntityKind::TemperatureReading, readings),
            (EntityKind::Recipe, recipes),
            (EntityKind::Menu, menus),
        ] {
            match fetched {
                Ok(rows) => {
                    let (written, kept) = self.replace_collection(kind, rows).await?;
                    self.cache.update_sync_meta(kind, written, 0).await?;
                    tracing::debug!(%kind, written, kept, "collection refreshed");
                    report.counts.insert(kind, written);
                    report.kept_pending += kept;
                }
                Err(err) => {
                    tracing::warn!(%kind, "failed to refresh collection: {err}");
                    self.cache.update_sync_meta(kind, 0, 1).await?;
                    report.errors.insert(kind, err.message);
                }
            }
        }

        tracing::info!(
            records = report.total(),
            kept_pending = report.kept_pending,
            failed_collections = report.errors.len(),
            "offline cache refreshed"
        );
        Ok(report)
    }

    /// Replace one collection; returns (records written, entries kept).
    async fn replace_collection(&self, kind: EntityKind, rows: Vec<Value>) -> Result<(usize, usize), StoreError> {
        let mutations = self.cache.pending_mutations().await?;
        let is_referenced = |id: &RecordId| {
            mutations
                .iter()
                .any(|m| &m.target_id == id || references::references(&m.payload, id.as_str()))
        };

        let (kept, replaced): (Vec<CachedEntity>, Vec<CachedEntity>) = self
            .cache
            .get_all_raw(kind)
            .await?
            .into_iter()
            .partition(|e| e.sync_status.is_pending() || is_referenced(e.key()) || is_referenced(&e.local_id));
        let kept_keys: HashSet<RecordId> = kept.iter().map(|e| e.key().clone()).collect();
        let first_seen: HashMap<RecordId, RecordId> = replaced
            .into_iter()
            .filter(|e| &e.local_id != e.key())
            .map(|e| (e.key().clone(), e.local_id))
            .collect();

        self.cache.clear(kind).await?;
        for entry in &kept {
            self.cache.put_raw(entry).await?;
        }

        let mut written = 0;
        for row in rows {
            let Some(mut entry) = CachedEntity::from_remote(kind, row) else {
                tracing::warn!(%kind, "skipping server record without id");
                continue;
            };
            if kept_keys.contains(entry.key()) {
                continue;
            }
            // Keep the id the UI first saw for records created on this device.
            if let Some(local_id) = first_seen.get(entry.key()) {
                entry.local_id = local_id.clone();
            }
            self.cache.put_raw(&entry).await?;
            written += 1;
        }
        Ok((written, kept.len()))
    }

    /// `true` when any collection has never refreshed, last failed, or is
    /// older than `refresh_max_age`.
    pub async fn is_refresh_due(&self) -> Result<bool, SyncError> {
        let max_age = ChronoDuration::from_std(self.config.refresh_max_age)
            .unwrap_or_else(|_| ChronoDuration::minutes(5));
        let now = Utc::now();
        for kind in EntityKind::ALL {
            match self.cache.sync_meta(kind).await? {
                Some(meta) if !meta.is_refresh_due(max_age, now) => {}
                _ => return Ok(true),
            }
        }
        Ok(false)
    }

    // ---------------------------------------------------------------------
    // Queue draining
    // ---------------------------------------------------------------------

    /// Send queued mutations to the server (see the module docs for the policy).
    ///
    /// Only mutations queued before the drain started are processed; later
    /// ones wait for the next trigger. Per-mutation failures are reported in
    /// the summary, not as an error.
    pub async fn sync_pending_mutations(&self) -> Result<SyncSummary, SyncError> {
        if !self.connectivity.is_online() {
            return Err(SyncError::Offline);
        }
        let _guard = InProgress::acquire(&self.draining).ok_or(SyncError::DrainInProgress)?;

        let snapshot: Vec<MutationId> = self
            .cache
            .pending_mutations()
            .await?
            .into_iter()
            .map(|m| m.id)
            .collect();
        if snapshot.is_empty() {
            return Ok(SyncSummary::default());
        }
        tracing::info!(pending = snapshot.len(), "draining mutation queue");

        let mut summary = SyncSummary::default();
        let mut blocked: HashSet<String> = HashSet::new();

        for id in snapshot {
            // Re-read: earlier creates may have rewritten ids in this mutation,
            // or it may have been discarded meanwhile.
            let Some(mutation) = self.cache.mutation(id).await? else {
                continue;
            };

            if mutation.needs_attention() {
                blocked.insert(mutation.target_id.to_string());
                continue;
            }

            if blocked.contains(mutation.target_id.as_str())
                || references::references_any(&mutation.payload, &blocked)
            {
                tracing::debug!(
                    mutation_id = %mutation.id,
                    target = %mutation.target_id,
                    "deferring mutation that depends on a failed one"
                );
                blocked.insert(mutation.target_id.to_string());
                summary.deferred_mutations += 1;
                continue;
            }

            self.set_in_flight(Some(mutation.id));
            let outcome = self.apply_mutation(&mutation).await;
            self.set_in_flight(None);

            match outcome {
                Ok(()) => {
                    tracing::info!(
                        mutation_id = %mutation.id,
                        kind = %mutation.entity_kind,
                        operation = %mutation.operation,
                        "mutation synced"
                    );
                    summary.synced_mutations += 1;
                }
                Err(err) => {
                    blocked.insert(mutation.target_id.to_string());
                    let failure = self.record_failure(&mutation, err).await;
                    summary.failed_mutations += 1;
                    summary.errors.push(failure);
                }
            }
        }

        tracing::info!(
            synced = summary.synced_mutations,
            failed = summary.failed_mutations,
            deferred = summary.deferred_mutations,
            "mutation queue drained"
        );
        self.notify(Notification::from_summary(&summary));
        let parked = summary.errors.iter().filter(|f| f.needs_attention).count();
        if parked > 0 {
            self.notify(Notification::NeedsAttention { count: parked });
        }
        Ok(summary)
    }

    /// Send a mutation (unless the server already acknowledged it), then
    /// finish it locally. The mutation leaves the queue last, so a failure
    /// at any step is picked up by the next drain without resending.
    async fn apply_mutation(&self, mutation: &PendingMutation) -> Result<(), ApplyError> {
        let response = match self.acknowledgment(mutation) {
            Some(response) => {
                tracing::debug!(mutation_id = %mutation.id, "finishing acknowledged mutation");
                response
            }
            None => {
                let response = self.send_mutation(mutation).await?;
                self.record_acknowledgment(mutation, &response).await;
                response
            }
        };

        self.finish_mutation(mutation, &response)
            .await
            .map_err(ApplyError::Unfinished)?;
        self.forget_acknowledgment(mutation.id);

        if mutation.entity_kind == EntityKind::Output && mutation.operation == MutationOperation::Create {
            self.refresh_referenced_product(&response).await;
        }
        Ok(())
    }

    async fn send_mutation(&self, mutation: &PendingMutation) -> RemoteResult<Value> {
        let kind = mutation.entity_kind;
        match mutation.operation {
            MutationOperation::Create => {
                let mut body = mutation.payload.clone();
                if let Value::Object(map) = &mut body {
                    map.remove("id");
                }
                reject_local_references(&body)?;

                let created = self.call_remote(self.remote.create(kind, &body)).await?;
                if server_id(&created).is_none() {
                    return Err(RemoteError::permanent("create response carries no id").with_code("no_id"));
                }
                Ok(created)
            }
            MutationOperation::Update => {
                reject_local_target(&mutation.target_id)?;
                reject_local_references(&mutation.payload)?;
                self.call_remote(self.remote.update(kind, &mutation.target_id, &mutation.payload))
                    .await
            }
            MutationOperation::Delete => {
                reject_local_target(&mutation.target_id)?;
                self.call_remote(self.remote.delete(kind, &mutation.target_id))
                    .await?;
                Ok(Value::Null)
            }
        }
    }

    /// Server response already recorded for `mutation`, durably or in memory.
    fn acknowledgment(&self, mutation: &PendingMutation) -> Option<Value> {
        if let Some(response) = &mutation.acknowledged {
            return Some(response.clone());
        }
        self.acknowledged
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&mutation.id)
            .cloned()
    }

    /// Remember that the server took `mutation`. Kept in memory first so a
    /// failing store still cannot cause a resend in this process.
    async fn record_acknowledgment(&self, mutation: &PendingMutation, response: &Value) {
        self.acknowledged
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(mutation.id, response.clone());

        let mut acked = mutation.clone();
        acked.acknowledged = Some(response.clone());
        if let Err(err) = self.cache.save_mutation(&acked).await {
            tracing::warn!(mutation_id = %mutation.id, "failed to persist acknowledgment: {err}");
        }
    }

    fn forget_acknowledgment(&self, id: MutationId) {
        self.acknowledged
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id);
    }

    /// Local side of an acknowledged mutation. Every step is safe to repeat.
    async fn finish_mutation(&self, mutation: &PendingMutation, response: &Value) -> Result<(), StoreError> {
        let kind = mutation.entity_kind;
        match mutation.operation {
            MutationOperation::Create => {
                let server_id = server_id(response)
                    .ok_or_else(|| StoreError::Corrupt("acknowledged create carries no id".to_string()))?;

                if mutation.target_id.is_local() {
                    // Must complete before the next queued mutation is sent.
                    let rewritten = self.cache.rewrite_local_id(&mutation.target_id, &server_id).await?;
                    tracing::info!(
                        kind = %kind,
                        rewritten,
                        "resolved local id {} -> {}",
                        mutation.target_id,
                        server_id
                    );
                }
                let local_id = self
                    .cache
                    .get_raw(kind, &server_id)
                    .await?
                    .map(|e| e.local_id)
                    .unwrap_or_else(|| mutation.target_id.clone());
                self.store_server_record(kind, local_id, server_id, response.clone(), Some(mutation.id))
                    .await?;
            }
            MutationOperation::Update => {
                let local_id = self
                    .cache
                    .get_raw(kind, &mutation.target_id)
                    .await?
                    .map(|e| e.local_id)
                    .unwrap_or_else(|| mutation.target_id.clone());
                self.store_server_record(
                    kind,
                    local_id,
                    mutation.target_id.clone(),
                    response.clone(),
                    Some(mutation.id),
                )
                .await?;
            }
            MutationOperation::Delete => {
                self.cache.delete(kind, &mutation.target_id).await?;
            }
        }
        self.cache.remove_mutation(mutation.id).await?;
        Ok(())
    }

    /// Write the server's version of a record. If a newer local edit was
    /// queued while the call was in flight, it is layered on top and the
    /// entry stays pending. `applied` is the mutation being finished, which
    /// may still sit in the queue.
    async fn store_server_record(
        &self,
        kind: EntityKind,
        local_id: RecordId,
        remote_id: RecordId,
        mut record: Value,
        applied: Option<MutationId>,
    ) -> Result<(), StoreError> {
        let mut sync_status = SyncStatus::Synced;
        let newer = self
            .cache
            .pending_mutations()
            .await?
            .into_iter()
            .find(|m| m.entity_kind == kind && m.target_id == remote_id && Some(m.id) != applied);
        if let Some(newer) = newer {
            match newer.operation {
                MutationOperation::Update => {
                    references::merge_patch(&mut record, &newer.payload);
                    sync_status = SyncStatus::PendingUpdate;
                }
                MutationOperation::Delete => sync_status = SyncStatus::PendingDelete,
                MutationOperation::Create => {}
            }
        }

        self.cache
            .put_raw(&CachedEntity {
                kind,
                local_id,
                remote_id: Some(remote_id),
                sync_status,
                last_modified_at: Utc::now(),
                record,
            })
            .await
    }

    /// After an output is acknowledged, take the server's stock figure for its
    /// product, unless another queued mutation still relies on the local one.
    async fn refresh_referenced_product(&self, output: &Value) {
        let Some(product_id) = output.get("product_id").and_then(Value::as_str).map(RecordId::remote) else {
            return;
        };

        match self.cache.is_referenced_by_mutation(&product_id).await {
            Ok(false) => {}
            Ok(true) => {
                tracing::debug!(product = %product_id, "keeping local stock, product still referenced");
                return;
            }
            Err(err) => {
                tracing::warn!(product = %product_id, "failed to inspect queue: {err}");
                return;
            }
        }

        match self
            .call_remote(self.remote.fetch_by_id(EntityKind::Product, &product_id))
            .await
        {
            Ok(Some(record)) => {
                let local_id = match self.cache.get_raw(EntityKind::Product, &product_id).await {
                    Ok(Some(entry)) => entry.local_id,
                    _ => product_id.clone(),
                };
                if let Err(err) = self
                    .store_server_record(EntityKind::Product, local_id, product_id.clone(), record, None)
                    .await
                {
                    tracing::warn!(product = %product_id, "failed to cache server stock: {err}");
                }
            }
            Ok(None) => tracing::warn!(product = %product_id, "product vanished from server"),
            Err(err) => tracing::warn!(product = %product_id, "failed to refetch product: {err}"),
        }
    }

    async fn record_failure(&self, mutation: &PendingMutation, err: ApplyError) -> MutationFailure {
        let (message, transient) = match &err {
            ApplyError::Remote(err) => (err.to_string(), err.is_transient()),
            ApplyError::Unfinished(err) => (format!("saved on server, local update pending: {err}"), true),
        };
        let mut needs_attention = false;

        match self.cache.update_mutation_retry(mutation.id, &message).await {
            Ok(Some(updated)) => {
                if !transient || updated.retry_count >= self.config.max_retries {
                    needs_attention = self
                        .cache
                        .mark_mutation_failed(mutation.id)
                        .await
                        .unwrap_or_else(|e| {
                            tracing::error!(mutation_id = %mutation.id, "failed to park mutation: {e}");
                            false
                        });
                }
                tracing::warn!(
                    mutation_id = %mutation.id,
                    kind = %mutation.entity_kind,
                    operation = %mutation.operation,
                    retry_count = updated.retry_count,
                    transient,
                    needs_attention,
                    "mutation failed: {message}"
                );
            }
            Ok(None) => {}
            Err(store_err) => {
                tracing::error!(mutation_id = %mutation.id, "failed to record retry: {store_err}");
            }
        }

        MutationFailure {
            mutation_id: mutation.id,
            entity_kind: mutation.entity_kind,
            operation: mutation.operation,
            message,
            needs_attention,
        }
    }

    // ---------------------------------------------------------------------
    // Full sync pipeline
    // ---------------------------------------------------------------------

    /// Drain, then refresh, then notify.
    pub async fn full_sync(&self) -> Result<FullSyncReport, SyncError> {
        let mut report = FullSyncReport::default();
        for stage in SyncStage::PIPELINE {
            self.run_stage(stage, &mut report).await?;
        }
        Ok(report)
    }

    /// Run a single pipeline stage, recording its result in `report`.
    pub async fn run_stage(&self, stage: SyncStage, report: &mut FullSyncReport) -> Result<(), SyncError> {
        tracing::debug!(?stage, "sync stage started");
        match stage {
            SyncStage::DrainQueue => report.drain = self.sync_pending_mutations().await?,
            SyncStage::RefreshCache => {
                report.refresh = self.cache_all_data().await?;
                self.notify(Notification::from_refresh(&report.refresh));
            }
            SyncStage::Notify => self.publish_status().await?,
        }
        report.completed.push(stage);
        Ok(())
    }

    /// Publish the pending badge and any parked mutations.
    pub async fn publish_status(&self) -> Result<(), SyncError> {
        let pending = self.cache.pending_mutations_count().await?;
        self.notify(Notification::PendingCount { pending });
        let parked = self.cache.failed_mutations().await?.len();
        if parked > 0 {
            self.notify(Notification::NeedsAttention { count: parked });
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Failed-mutation management
    // ---------------------------------------------------------------------

    pub async fn pending_mutations_count(&self) -> Result<usize, SyncError> {
        Ok(self.cache.pending_mutations_count().await?)
    }

    pub async fn failed_mutations(&self) -> Result<Vec<PendingMutation>, SyncError> {
        Ok(self.cache.failed_mutations().await?)
    }

    /// Make a parked mutation eligible again; it keeps its queue position.
    pub async fn retry_mutation(&self, id: MutationId) -> Result<(), SyncError> {
        if !self.cache.reset_mutation(id).await? {
            return Err(SyncError::MutationNotFound(id));
        }
        tracing::info!(mutation_id = %id, "mutation re-queued by user");
        Ok(())
    }

    /// Drop a mutation and roll back its optimistic cache state.
    pub async fn discard_mutation(&self, id: MutationId) -> Result<PendingMutation, SyncError> {
        let mutation = self
            .cache
            .mutation(id)
            .await?
            .ok_or(SyncError::MutationNotFound(id))?;
        self.cache.remove_mutation(id).await?;
        self.forget_acknowledgment(id);
        let kind = mutation.entity_kind;

        match mutation.operation {
            MutationOperation::Create => {
                if let Some(entry) = self.cache.get_raw(kind, &mutation.target_id).await? {
                    self.cache.delete(kind, entry.key()).await?;
                }
                if kind == EntityKind::Output {
                    self.restore_stock(&mutation.payload).await?;
                }
            }
            MutationOperation::Update | MutationOperation::Delete => {
                self.reload_entry(kind, &mutation.target_id).await?;
            }
        }

        tracing::warn!(
            mutation_id = %id,
            kind = %kind,
            operation = %mutation.operation,
            "mutation discarded by user"
        );
        Ok(mutation)
    }

    /// Give back the stock a discarded offline output had deducted.
    async fn restore_stock(&self, output: &Value) -> Result<(), SyncError> {
        let Ok(output) = serde_json::from_value::<Output>(output.clone()) else {
            return Ok(());
        };
        if let Some(mut product) = self.cache.get_by_id::<Product>(&output.product_id).await? {
            product.record.quantity += output.quantity;
            product.last_modified_at = Utc::now();
            self.cache.put(&product).await?;
        }
        Ok(())
    }

    /// Replace a cache entry with the server's copy when reachable; otherwise
    /// mark it synced so the next refresh overwrites it.
    async fn reload_entry(&self, kind: EntityKind, id: &RecordId) -> Result<(), SyncError> {
        let Some(mut entry) = self.cache.get_raw(kind, id).await? else {
            return Ok(());
        };

        if self.connectivity.is_online() {
            match self.call_remote(self.remote.fetch_by_id(kind, entry.key())).await {
                Ok(Some(record)) => {
                    entry.record = record;
                }
                Ok(None) => {
                    self.cache.delete(kind, &entry.key().clone()).await?;
                    return Ok(());
                }
                Err(err) => tracing::debug!(%kind, %id, "could not reload entry: {err}"),
            }
        }
        entry.sync_status = SyncStatus::Synced;
        entry.last_modified_at = Utc::now();
        self.cache.put_raw(&entry).await?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Optimistic offline writes
    // ---------------------------------------------------------------------

    /// Record an output locally: cached immediately, stock deducted from the
    /// cached product, create queued.
    pub async fn create_output_offline(&self, new: NewOutput) -> Result<CachedEntity<Output>, SyncError> {
        new.validate()?;
        let mut product = self
            .cache
            .get_by_id::<Product>(&new.product_id)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("product {}", new.product_id)))?;
        product.record.deduct(new.quantity)?;

        let id = self.cache.generate_local_id();
        let output = new.into_output(id.clone(), Utc::now());
        let payload = serde_json::to_value(&output)?;
        let entry = CachedEntity::pending(output, SyncStatus::PendingCreate);

        self.cache.put(&entry).await?;
        product.last_modified_at = Utc::now();
        self.cache.put(&product).await?;
        self.cache
            .queue_mutation(PendingMutation::new(
                EntityKind::Output,
                MutationOperation::Create,
                id,
                payload,
            ))
            .await?;

        self.notify_saved_offline().await;
        Ok(entry)
    }

    /// Record a temperature reading locally; compliance is computed against
    /// the cached equipment range.
    pub async fn create_temperature_reading_offline(
        &self,
        new: NewTemperatureReading,
    ) -> Result<CachedEntity<TemperatureReading>, SyncError> {
        let equipment = self
            .cache
            .get_by_id::<TemperatureEquipment>(&new.equipment_id)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("equipment {}", new.equipment_id)))?;

        let id = self.cache.generate_local_id();
        let reading = new.into_reading(id.clone(), &equipment.record)?;
        if !reading.is_compliant {
            tracing::warn!(
                equipment = %equipment.record.name,
                temperature = reading.temperature,
                "non-compliant temperature recorded offline"
            );
        }
        let payload = serde_json::to_value(&reading)?;
        let entry = CachedEntity::pending(reading, SyncStatus::PendingCreate);

        self.cache.put(&entry).await?;
        self.cache
            .queue_mutation(PendingMutation::new(
                EntityKind::TemperatureReading,
                MutationOperation::Create,
                id,
                payload,
            ))
            .await?;

        self.notify_saved_offline().await;
        Ok(entry)
    }

    /// Apply a product patch locally and queue it (merged into an already
    /// queued create/update of the same product when possible).
    pub async fn update_product_offline(
        &self,
        id: &RecordId,
        patch: ProductPatch,
    ) -> Result<CachedEntity<Product>, SyncError> {
        let mut entry = self
            .cache
            .get_by_id::<Product>(id)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("product {id}")))?;
        entry.record.apply_patch(&patch)?;

        let patch_value = serde_json::to_value(&patch)?;
        let full_record = serde_json::to_value(&entry.record)?;
        entry.sync_status = self
            .stage_update(EntityKind::Product, entry.key().clone(), patch_value, full_record)
            .await?;
        entry.last_modified_at = Utc::now();
        self.cache.put(&entry).await?;

        self.notify_saved_offline().await;
        Ok(entry)
    }

    /// Queue an update, coalescing with an outstanding mutation for the same
    /// record. Returns the sync status the cache entry should carry.
    async fn stage_update(
        &self,
        kind: EntityKind,
        target: RecordId,
        patch: Value,
        full_record: Value,
    ) -> Result<SyncStatus, SyncError> {
        if let Some(mut existing) = self.cache.mutation_for_target(kind, &target).await? {
            if !self.is_sent(&existing) {
                match existing.operation {
                    MutationOperation::Create => {
                        existing.payload = full_record;
                        self.cache.save_mutation(&existing).await?;
                        return Ok(SyncStatus::PendingCreate);
                    }
                    MutationOperation::Update => {
                        references::merge_patch(&mut existing.payload, &patch);
                        self.cache.save_mutation(&existing).await?;
                        return Ok(SyncStatus::PendingUpdate);
                    }
                    MutationOperation::Delete => {
                        return Err(DomainError::invariant(format!("{kind} {target} is pending deletion")).into());
                    }
                }
            }
        }

        self.cache
            .queue_mutation(PendingMutation::new(kind, MutationOperation::Update, target, patch))
            .await?;
        Ok(SyncStatus::PendingUpdate)
    }

    /// Delete a record locally. A record whose create was never acknowledged
    /// simply disappears, with nothing sent to the server.
    pub async fn delete_offline(&self, kind: EntityKind, id: &RecordId) -> Result<(), SyncError> {
        let entry = self
            .cache
            .get_raw(kind, id)
            .await?
            .ok_or_else(|| DomainError::not_found(format!("{kind} {id}")))?;
        let target = entry.key().clone();

        if let Some(existing) = self.cache.mutation_for_target(kind, &target).await? {
            if !self.is_sent(&existing) {
                match existing.operation {
                    MutationOperation::Create => {
                        self.cache.remove_mutation(existing.id).await?;
                        self.cache.delete(kind, &target).await?;
                        if kind == EntityKind::Output {
                            self.restore_stock(&existing.payload).await?;
                        }
                        tracing::debug!(%kind, %target, "unsent create cancelled");
                        return Ok(());
                    }
                    MutationOperation::Update => {
                        self.cache.remove_mutation(existing.id).await?;
                    }
                    MutationOperation::Delete => return Ok(()),
                }
            }
        }

        self.cache
            .queue_mutation(PendingMutation::new(kind, MutationOperation::Delete, target, Value::Null))
            .await?;
        let mut entry = entry;
        entry.sync_status = SyncStatus::PendingDelete;
        entry.last_modified_at = Utc::now();
        self.cache.put_raw(&entry).await?;

        self.notify_saved_offline().await;
        Ok(())
    }

    async fn notify_saved_offline(&self) {
        match self.cache.pending_mutations_count().await {
            Ok(pending) => self.notify(Notification::SavedOffline { pending }),
            Err(err) => tracing::warn!("failed to count pending mutations: {err}"),
        }
    }
}

fn server_id(record: &Value) -> Option<RecordId> {
    record.get("id").and_then(Value::as_str).map(RecordId::remote)
}

fn reject_local_target(id: &RecordId) -> Result<(), RemoteError> {
    if id.is_local() {
        return Err(RemoteError::permanent(format!("unresolved local reference {id}")).with_code("local_ref"));
    }
    Ok(())
}

fn reject_local_references(payload: &Value) -> Result<(), RemoteError> {
    match references::find_local_id(payload) {
        Some(id) => Err(RemoteError::permanent(format!("unresolved local reference {id}")).with_code("local_ref")),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheStore;
    use crate::remote::{InMemoryRemote, RemoteCall};
    use crate::types::MutationStatus;
    use chrono::NaiveDate;
    use serde_json::json;
    use stockpro_inventory::OutputReason;

    struct Fixture {
        engine: SyncEngine,
        remote: Arc<InMemoryRemote>,
    }

    fn fixture() -> Fixture {
        let remote = Arc::new(InMemoryRemote::new());
        remote.insert(
            EntityKind::Product,
            json!({ "id": "p-1", "name": "Farine T55", "unit": "kg", "quantity": 50.0 }),
        );
        let engine = SyncEngine::new(
            LocalCache::in_memory(),
            remote.clone(),
            ConnectivityMonitor::new(true),
            SyncConfig::default().with_max_retries(3),
        );
        Fixture { engine, remote }
    }

    fn output(quantity: f64) -> NewOutput {
        NewOutput {
            product_id: RecordId::remote("p-1"),
            quantity,
            reason: OutputReason::Service,
            date: NaiveDate::from_ymd_opt(2026, 3, 14).unwrap(),
            notes: None,
        }
    }

    #[tokio::test]
    async fn offline_operations_require_connectivity() {
        let f = fixture();
        f.engine.connectivity().set_online(false);
        assert!(matches!(f.engine.sync_pending_mutations().await, Err(SyncError::Offline)));
        assert!(matches!(f.engine.cache_all_data().await, Err(SyncError::Offline)));
    }

    #[tokio::test]
    async fn concurrent_drain_is_rejected() {
        let f = fixture();
        f.engine.draining.store(true, Ordering::SeqCst);
        assert!(matches!(
            f.engine.sync_pending_mutations().await,
            Err(SyncError::DrainInProgress)
        ));
        f.engine.draining.store(false, Ordering::SeqCst);
        assert!(f.engine.sync_pending_mutations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn output_offline_deducts_cached_stock() {
        let f = fixture();
        f.engine.cache_all_data().await.unwrap();

        let entry = f.engine.create_output_offline(output(10.0)).await.unwrap();
        assert!(entry.record.id.is_local());
        assert_eq!(entry.sync_status, SyncStatus::PendingCreate);

        let product = f
            .engine
            .cache()
            .get_by_id::<Product>(&RecordId::remote("p-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(product.record.quantity, 40.0);
        assert_eq!(f.engine.pending_mutations_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn output_offline_rejects_overdraw() {
        let f = fixture();
        f.engine.cache_all_data().await.unwrap();
        let err = f.engine.create_output_offline(output(60.0)).await.unwrap_err();
        assert!(matches!(err, SyncError::Domain(DomainError::InsufficientStock { .. })));
        assert_eq!(f.engine.pending_mutations_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn refresh_keeps_entries_referenced_by_pending_mutations() {
        let f = fixture();
        f.engine.cache_all_data().await.unwrap();
        f.engine.create_output_offline(output(10.0)).await.unwrap();

        let report = f.engine.cache_all_data().await.unwrap();
        assert!(report.kept_pending >= 1);

        let product = f
            .engine
            .cache()
            .get_by_id::<Product>(&RecordId::remote("p-1"))
            .await
            .unwrap()
            .unwrap();
        // Local deduction survives until the output is acknowledged.
        assert_eq!(product.record.quantity, 40.0);
    }

    #[tokio::test]
    async fn updates_are_coalesced() {
        let f = fixture();
        f.engine.cache_all_data().await.unwrap();
        let id = RecordId::remote("p-1");

        f.engine
            .update_product_offline(&id, ProductPatch { quantity: Some(45.0), ..Default::default() })
            .await
            .unwrap();
        let entry = f
            .engine
            .update_product_offline(&id, ProductPatch { min_stock: Some(5.0), ..Default::default() })
            .await
            .unwrap();

        assert_eq!(entry.sync_status, SyncStatus::PendingUpdate);
        let queue = f.engine.cache().pending_mutations().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].payload, json!({ "quantity": 45.0, "min_stock": 5.0 }));
    }

    #[tokio::test]
    async fn deleting_unsent_create_sends_nothing() {
        let f = fixture();
        f.engine.cache_all_data().await.unwrap();
        let entry = f.engine.create_output_offline(output(5.0)).await.unwrap();

        f.engine
            .delete_offline(EntityKind::Output, &entry.record.id)
            .await
            .unwrap();
        assert_eq!(f.engine.pending_mutations_count().await.unwrap(), 0);

        let product = f
            .engine
            .cache()
            .get_by_id::<Product>(&RecordId::remote("p-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(product.record.quantity, 50.0);

        f.engine.sync_pending_mutations().await.unwrap();
        assert!(f.remote.write_calls().is_empty());
    }

    #[tokio::test]
    async fn transient_failures_park_after_ceiling() {
        let f = fixture();
        f.engine.cache_all_data().await.unwrap();
        f.engine.create_output_offline(output(1.0)).await.unwrap();
        f.remote.fail_when(|call| call.is_write().then(|| RemoteError::transient("503")));

        for attempt in 1..=3 {
            let summary = f.engine.sync_pending_mutations().await.unwrap();
            assert_eq!(summary.failed_mutations, 1);
            assert_eq!(summary.errors[0].needs_attention, attempt == 3);
        }

        let parked = f.engine.failed_mutations().await.unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].retry_count, 3);

        // Parked mutations are skipped until retried.
        let summary = f.engine.sync_pending_mutations().await.unwrap();
        assert!(summary.is_empty());

        f.remote.clear_failures();
        f.engine.retry_mutation(parked[0].id).await.unwrap();
        let summary = f.engine.sync_pending_mutations().await.unwrap();
        assert_eq!(summary.synced_mutations, 1);
        assert_eq!(f.engine.pending_mutations_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn permanent_failure_needs_attention_immediately() {
        let f = fixture();
        f.engine.cache_all_data().await.unwrap();
        f.engine.create_output_offline(output(10.0)).await.unwrap();
        // Someone else consumed the stock meanwhile.
        f.remote.insert(
            EntityKind::Product,
            json!({ "id": "p-1", "name": "Farine T55", "unit": "kg", "quantity": 2.0 }),
        );

        let summary = f.engine.sync_pending_mutations().await.unwrap();
        assert_eq!(summary.failed_mutations, 1);
        assert!(summary.errors[0].needs_attention);
        assert_eq!(summary.errors[0].message, "insufficient stock");

        let queue = f.engine.cache().pending_mutations().await.unwrap();
        assert_eq!(queue[0].status, MutationStatus::Failed);
    }

    #[tokio::test]
    async fn discard_rolls_back_optimistic_state() {
        let f = fixture();
        f.engine.cache_all_data().await.unwrap();
        let entry = f.engine.create_output_offline(output(10.0)).await.unwrap();
        let mutation = f.engine.cache().pending_mutations().await.unwrap().remove(0);

        f.engine.discard_mutation(mutation.id).await.unwrap();

        assert!(f
            .engine
            .cache()
            .get_by_id::<Output>(&entry.record.id)
            .await
            .unwrap()
            .is_none());
        let product = f
            .engine
            .cache()
            .get_by_id::<Product>(&RecordId::remote("p-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(product.record.quantity, 50.0);
        assert!(matches!(
            f.engine.discard_mutation(mutation.id).await,
            Err(SyncError::MutationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn slow_remote_times_out_as_transient() {
        let remote = Arc::new(InMemoryRemote::new());
        remote.set_latency(std::time::Duration::from_millis(200));
        let engine = SyncEngine::new(
            LocalCache::in_memory(),
            remote,
            ConnectivityMonitor::new(true),
            SyncConfig::default().with_remote_timeout(std::time::Duration::from_millis(20)),
        );

        let report = engine.cache_all_data().await.unwrap();
        assert_eq!(report.errors.len(), EntityKind::ALL.len());
        assert!(engine.is_refresh_due().await.unwrap());
    }

    #[tokio::test]
    async fn full_sync_runs_stages_in_order() {
        let f = fixture();
        let report = f.engine.full_sync().await.unwrap();
        assert_eq!(report.completed, SyncStage::PIPELINE.to_vec());
        assert_eq!(report.refresh.counts[&EntityKind::Product], 1);
        assert!(!f.engine.is_refresh_due().await.unwrap());
    }

    #[tokio::test]
    async fn storage_failure_after_create_does_not_resend() {
        let store = Arc::new(InMemoryCacheStore::new());
        let remote = Arc::new(InMemoryRemote::new());
        remote.insert(
            EntityKind::Product,
            json!({ "id": "p-1", "name": "Farine T55", "unit": "kg", "quantity": 50.0 }),
        );
        let engine = SyncEngine::new(
            LocalCache::from_store(store.clone()),
            remote.clone(),
            ConnectivityMonitor::new(true),
            SyncConfig::default().with_max_retries(3),
        );
        engine.cache_all_data().await.unwrap();
        let entry = engine.create_output_offline(output(10.0)).await.unwrap();

        // Storage drops out while the create is on the wire.
        let failing = store.clone();
        remote.fail_when(move |call| {
            if matches!(call, RemoteCall::Create { .. }) {
                failing.set_available(false);
            }
            None
        });
        let first = engine.sync_pending_mutations().await.unwrap();
        assert_eq!(first.failed_mutations, 1);
        assert!(first.errors[0].message.starts_with("saved on server"));
        assert!(!first.errors[0].needs_attention);
        assert_eq!(remote.records(EntityKind::Output).len(), 1);

        store.set_available(true);
        let second = engine.sync_pending_mutations().await.unwrap();
        assert_eq!(second.synced_mutations, 1);
        assert_eq!(remote.records(EntityKind::Output).len(), 1);
        assert_eq!(remote.write_calls().len(), 1);
        assert_eq!(engine.pending_mutations_count().await.unwrap(), 0);

        let cached = engine
            .cache()
            .get_raw(EntityKind::Output, &entry.record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.sync_status, SyncStatus::Synced);
        assert!(!cached.key().is_local());
    }

    #[tokio::test]
    async fn recorded_acknowledgment_is_finished_without_resending() {
        let f = fixture();
        f.engine.cache_all_data().await.unwrap();
        let entry = f.engine.create_output_offline(output(10.0)).await.unwrap();

        let mut mutation = f.engine.cache().pending_mutations().await.unwrap().remove(0);
        mutation.acknowledged = Some(json!({
            "id": "out-9",
            "product_id": "p-1",
            "quantity": 10.0,
            "reason": "service",
            "date": "2026-03-14",
        }));
        f.engine.cache().save_mutation(&mutation).await.unwrap();
        f.remote.clear_calls();

        let summary = f.engine.sync_pending_mutations().await.unwrap();
        assert_eq!(summary.synced_mutations, 1);
        assert!(f.remote.write_calls().is_empty());
        assert!(f.remote.records(EntityKind::Output).is_empty());

        let cached = f
            .engine
            .cache()
            .get_raw(EntityKind::Output, &entry.record.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.remote_id, Some(RecordId::remote("out-9")));
        assert_eq!(cached.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn mutations_queued_during_a_drain_wait_for_the_next_one() {
        let f = fixture();
        f.engine.cache_all_data().await.unwrap();
        f.engine.create_output_offline(output(10.0)).await.unwrap();
        f.remote.set_latency(std::time::Duration::from_millis(100));

        let late = async {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            f.engine.create_output_offline(output(5.0)).await.unwrap()
        };
        let (summary, late_entry) = tokio::join!(f.engine.sync_pending_mutations(), late);

        let summary = summary.unwrap();
        assert_eq!(summary.synced_mutations, 1);
        assert_eq!(summary.failed_mutations, 0);
        let queue = f.engine.cache().pending_mutations().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].target_id, late_entry.record.id);
        assert_eq!(f.remote.records(EntityKind::Output).len(), 1);

        f.remote.set_latency(std::time::Duration::ZERO);
        let next = f.engine.sync_pending_mutations().await.unwrap();
        assert_eq!(next.synced_mutations, 1);
    }
}
