//! SQLite-backed cache store.
//!
//! One table per entity kind, keyed by the record's current id, plus
//! `pending_mutations` (FIFO by an autoincrement sequence) and `sync_meta`.
//! Record bodies are stored as JSON text, timestamps as RFC 3339 text.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use stockpro_core::{EntityKind, MutationId, RecordId};

use super::{CacheStore, StoreError, StoreResult};
use crate::types::{
    CachedEntity, MutationOperation, MutationStatus, PendingMutation, SyncMeta, SyncResultKind,
    SyncStatus,
};

/// SQLite cache store with lazy initialization.
///
/// Cheap to clone; clones share the same pool.
#[derive(Debug, Clone)]
pub struct SqliteCacheStore {
    db_url: String,
    max_connections: u32,
    pool: Arc<tokio::sync::Mutex<Option<SqlitePool>>>,
}

impl SqliteCacheStore {
    /// Store backed by `db_url` (e.g. `sqlite:///var/lib/stockpro/cache.db`).
    /// The database is opened on first use.
    pub fn new(db_url: impl Into<String>) -> Self {
        Self {
            db_url: db_url.into(),
            max_connections: 4,
            pool: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// Private in-memory database. A single connection that is never recycled,
    /// since every connection to `:memory:` gets its own database.
    pub fn in_memory() -> Self {
        Self {
            db_url: "sqlite::memory:".to_string(),
            max_connections: 1,
            pool: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    pub fn db_url(&self) -> &str {
        &self.db_url
    }

    async fn ensure_initialized(&self) -> StoreResult<()> {
        let mut pool_guard = self.pool.lock().await;
        if pool_guard.is_some() {
            return Ok(());
        }

        let options = SqliteConnectOptions::from_str(&self.db_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        migrate(&pool).await?;
        tracing::debug!(db_url = %self.db_url, "local cache initialized");

        *pool_guard = Some(pool);
        Ok(())
    }

    async fn get_pool(&self) -> StoreResult<SqlitePool> {
        self.ensure_initialized().await?;
        let pool_guard = self.pool.lock().await;
        pool_guard
            .clone()
            .ok_or_else(|| StoreError::Unavailable("cache pool not initialized".to_string()))
    }
}

async fn migrate(pool: &SqlitePool) -> StoreResult<()> {
    for kind in EntityKind::ALL {
        let table = kind.table_name();
        let create = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id               TEXT PRIMARY KEY NOT NULL,
                local_id         TEXT NOT NULL,
                remote_id        TEXT NULL,
                sync_status      TEXT NOT NULL,
                last_modified_at TEXT NOT NULL,
                data             TEXT NOT NULL
            )
            "#
        );
        sqlx::query(&create).execute(pool).await?;

        let index = format!("CREATE INDEX IF NOT EXISTS idx_{table}_local_id ON {table} (local_id)");
        sqlx::query(&index).execute(pool).await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pending_mutations (
            seq         INTEGER PRIMARY KEY AUTOINCREMENT,
            id          TEXT NOT NULL UNIQUE,
            entity_kind TEXT NOT NULL,
            operation   TEXT NOT NULL,
            target_id   TEXT NOT NULL,
            payload     TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error  TEXT NULL,
            status      TEXT NOT NULL,
            acknowledged TEXT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_meta (
            entity_kind    TEXT PRIMARY KEY NOT NULL,
            last_synced_at TEXT NULL,
            last_result    TEXT NOT NULL,
            synced_count   INTEGER NOT NULL,
            failed_count   INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

const ENTITY_COLUMNS: &str = "local_id, remote_id, sync_status, last_modified_at, data";
const MUTATION_COLUMNS: &str =
    "id, entity_kind, operation, target_id, payload, created_at, retry_count, last_error, status, acknowledged";

#[async_trait::async_trait]
impl CacheStore for SqliteCacheStore {
    async fn health_check(&self) -> StoreResult<()> {
        let pool = self.get_pool().await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(())
    }

    async fn put(&self, entry: &CachedEntity) -> StoreResult<()> {
        let pool = self.get_pool().await?;
        let sql = format!(
            r#"
            INSERT INTO {} (id, local_id, remote_id, sync_status, last_modified_at, data)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                local_id = excluded.local_id,
                remote_id = excluded.remote_id,
                sync_status = excluded.sync_status,
                last_modified_at = excluded.last_modified_at,
                data = excluded.data
            "#,
            entry.kind.table_name()
        );
        let data = serde_json::to_string(&entry.record)?;

        sqlx::query(&sql)
            .bind(entry.key().as_str())
            .bind(entry.local_id.as_str())
            .bind(entry.remote_id.as_ref().map(RecordId::as_str))
            .bind(entry.sync_status)
            .bind(entry.last_modified_at.to_rfc3339())
            .bind(data)
            .execute(&pool)
            .await?;
        Ok(())
    }

    async fn get_all(&self, kind: EntityKind) -> StoreResult<Vec<CachedEntity>> {
        let pool = self.get_pool().await?;
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM {} ORDER BY rowid ASC",
            kind.table_name()
        );
        let rows = sqlx::query(&sql).fetch_all(&pool).await?;
        rows.into_iter().map(|row| row_to_entity(kind, row)).collect()
    }

    async fn get(&self, kind: EntityKind, id: &str) -> StoreResult<Option<CachedEntity>> {
        let pool = self.get_pool().await?;
        let table = kind.table_name();

        let by_key = format!("SELECT {ENTITY_COLUMNS} FROM {table} WHERE id = ?1");
        if let Some(row) = sqlx::query(&by_key).bind(id).fetch_optional(&pool).await? {
            return row_to_entity(kind, row).map(Some);
        }

        let by_local = format!("SELECT {ENTITY_COLUMNS} FROM {table} WHERE local_id = ?1 LIMIT 1");
        match sqlx::query(&by_local).bind(id).fetch_optional(&pool).await? {
            Some(row) => row_to_entity(kind, row).map(Some),
            None => Ok(None),
        }
    }

    async fn delete(&self, kind: EntityKind, key: &str) -> StoreResult<bool> {
        let pool = self.get_pool().await?;
        let sql = format!("DELETE FROM {} WHERE id = ?1", kind.table_name());
        let result = sqlx::query(&sql).bind(key).execute(&pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear(&self, kind: EntityKind) -> StoreResult<()> {
        let pool = self.get_pool().await?;
        let sql = format!("DELETE FROM {}", kind.table_name());
        sqlx::query(&sql).execute(&pool).await?;
        Ok(())
    }

    async fn push_mutation(&self, mutation: &PendingMutation) -> StoreResult<()> {
        let pool = self.get_pool().await?;
        let payload = serde_json::to_string(&mutation.payload)?;
        let acknowledged = mutation.acknowledged.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO pending_mutations
                (id, entity_kind, operation, target_id, payload, created_at, retry_count, last_error, status, acknowledged)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(mutation.id.to_string())
        .bind(mutation.entity_kind.as_str())
        .bind(mutation.operation)
        .bind(mutation.target_id.as_str())
        .bind(payload)
        .bind(mutation.created_at.to_rfc3339())
        .bind(i64::from(mutation.retry_count))
        .bind(mutation.last_error.as_deref())
        .bind(mutation.status)
        .bind(acknowledged)
        .execute(&pool)
        .await?;
        Ok(())
    }

    async fn mutations(&self) -> StoreResult<Vec<PendingMutation>> {
        let pool = self.get_pool().await?;
        let sql = format!("SELECT {MUTATION_COLUMNS} FROM pending_mutations ORDER BY seq ASC");
        let rows = sqlx::query(&sql).fetch_all(&pool).await?;
        rows.into_iter().map(row_to_mutation).collect()
    }

    async fn mutation(&self, id: MutationId) -> StoreResult<Option<PendingMutation>> {
        let pool = self.get_pool().await?;
        let sql = format!("SELECT {MUTATION_COLUMNS} FROM pending_mutations WHERE id = ?1");
        match sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&pool)
            .await?
        {
            Some(row) => row_to_mutation(row).map(Some),
            None => Ok(None),
        }
    }

    async fn save_mutation(&self, mutation: &PendingMutation) -> StoreResult<()> {
        let pool = self.get_pool().await?;
        let payload = serde_json::to_string(&mutation.payload)?;
        let acknowledged = mutation.acknowledged.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"
            UPDATE pending_mutations
            SET target_id = ?2,
                payload = ?3,
                retry_count = ?4,
                last_error = ?5,
                status = ?6,
                acknowledged = ?7
            WHERE id = ?1
            "#,
        )
        .bind(mutation.id.to_string())
        .bind(mutation.target_id.as_str())
        .bind(payload)
        .bind(i64::from(mutation.retry_count))
        .bind(mutation.last_error.as_deref())
        .bind(mutation.status)
        .bind(acknowledged)
        .execute(&pool)
        .await?;
        Ok(())
    }

    async fn remove_mutation(&self, id: MutationId) -> StoreResult<bool> {
        let pool = self.get_pool().await?;
        let result = sqlx::query("DELETE FROM pending_mutations WHERE id = ?1")
            .bind(id.to_string())
            .execute(&pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_mutations(&self) -> StoreResult<usize> {
        let pool = self.get_pool().await?;
        let row = sqlx::query("SELECT COUNT(*) AS count FROM pending_mutations")
            .fetch_one(&pool)
            .await?;
        let count: i64 = row.try_get("count")?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn save_sync_meta(&self, meta: &SyncMeta) -> StoreResult<()> {
        let pool = self.get_pool().await?;
        sqlx::query(
            r#"
            INSERT INTO sync_meta (entity_kind, last_synced_at, last_result, synced_count, failed_count)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(entity_kind) DO UPDATE SET
                last_synced_at = excluded.last_synced_at,
                last_result = excluded.last_result,
                synced_count = excluded.synced_count,
                failed_count = excluded.failed_count
            "#,
        )
        .bind(meta.entity_kind.as_str())
        .bind(meta.last_synced_at.map(|at| at.to_rfc3339()))
        .bind(meta.last_result)
        .bind(meta.synced_count as i64)
        .bind(meta.failed_count as i64)
        .execute(&pool)
        .await?;
        Ok(())
    }

    async fn sync_meta(&self, kind: EntityKind) -> StoreResult<Option<SyncMeta>> {
        let pool = self.get_pool().await?;
        let row = sqlx::query(
            r#"
            SELECT last_synced_at, last_result, synced_count, failed_count
            FROM sync_meta
            WHERE entity_kind = ?1
            "#,
        )
        .bind(kind.as_str())
        .fetch_optional(&pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let last_synced_at: Option<String> = row.try_get("last_synced_at")?;
        let last_synced_at = last_synced_at
            .map(|s| parse_timestamp(&s, "sync_meta.last_synced_at"))
            .transpose()?;
        let last_result: SyncResultKind = row.try_get("last_result")?;
        let synced_count: i64 = row.try_get("synced_count")?;
        let failed_count: i64 = row.try_get("failed_count")?;

        Ok(Some(SyncMeta {
            entity_kind: kind,
            last_synced_at,
            last_result,
            synced_count: usize::try_from(synced_count).unwrap_or(0),
            failed_count: usize::try_from(failed_count).unwrap_or(0),
        }))
    }
}

fn row_to_entity(kind: EntityKind, row: SqliteRow) -> StoreResult<CachedEntity> {
    let local_id: String = row.try_get("local_id")?;
    let remote_id: Option<String> = row.try_get("remote_id")?;
    let sync_status: SyncStatus = row.try_get("sync_status")?;
    let modified: String = row.try_get("last_modified_at")?;
    let data: String = row.try_get("data")?;
    let record: Value = serde_json::from_str(&data)?;

    Ok(CachedEntity {
        kind,
        local_id: RecordId::from(local_id),
        remote_id: remote_id.map(RecordId::from),
        sync_status,
        last_modified_at: parse_timestamp(&modified, "last_modified_at")?,
        record,
    })
}

fn row_to_mutation(row: SqliteRow) -> StoreResult<PendingMutation> {
    let id_str: String = row.try_get("id")?;
    let id = id_str
        .parse::<MutationId>()
        .map_err(|e| StoreError::Corrupt(format!("invalid pending_mutations.id: {e}")))?;

    let kind_str: String = row.try_get("entity_kind")?;
    let entity_kind = kind_str
        .parse::<EntityKind>()
        .map_err(|e| StoreError::Corrupt(format!("invalid pending_mutations.entity_kind: {e}")))?;

    let operation: MutationOperation = row.try_get("operation")?;
    let target_id: String = row.try_get("target_id")?;
    let payload_str: String = row.try_get("payload")?;
    let payload: Value = serde_json::from_str(&payload_str)?;
    let created_at: String = row.try_get("created_at")?;
    let retry_count: i64 = row.try_get("retry_count")?;
    let last_error: Option<String> = row.try_get("last_error")?;
    let status: MutationStatus = row.try_get("status")?;
    let acknowledged: Option<String> = row.try_get("acknowledged")?;
    let acknowledged: Option<Value> = acknowledged.as_deref().map(serde_json::from_str).transpose()?;

    Ok(PendingMutation {
        id,
        entity_kind,
        operation,
        target_id: RecordId::from(target_id),
        payload,
        created_at: parse_timestamp(&created_at, "pending_mutations.created_at")?,
        retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
        last_error,
        status,
        acknowledged,
    })
}

fn parse_timestamp(raw: &str, column: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("invalid {column}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn product_entry(id: &str, quantity: f64) -> CachedEntity {
        CachedEntity::from_remote(
            EntityKind::Product,
            json!({ "id": id, "name": "Crème 35%", "unit": "l", "quantity": quantity }),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn put_replaces_by_key() {
        let store = SqliteCacheStore::in_memory();
        store.put(&product_entry("p-1", 3.0)).await.unwrap();
        store.put(&product_entry("p-1", 5.0)).await.unwrap();

        let all = store.get_all(EntityKind::Product).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].record["quantity"], json!(5.0));
    }

    #[tokio::test]
    async fn get_falls_back_to_local_id() {
        let store = SqliteCacheStore::in_memory();
        let mut entry = product_entry("p-2", 1.0);
        entry.local_id = RecordId::from("local_0190f5c1-7a4e-7c3b-9a2d-3b7e5f1a2c4d");
        store.put(&entry).await.unwrap();

        let found = store
            .get(EntityKind::Product, "local_0190f5c1-7a4e-7c3b-9a2d-3b7e5f1a2c4d")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.key().as_str(), "p-2");
        assert!(store.get(EntityKind::Product, "p-404").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mutations_keep_fifo_order_across_updates() {
        let store = SqliteCacheStore::in_memory();
        let first = PendingMutation::new(
            EntityKind::Output,
            MutationOperation::Create,
            RecordId::new_local(),
            json!({ "quantity": 1.0 }),
        );
        let second = PendingMutation::new(
            EntityKind::Product,
            MutationOperation::Update,
            RecordId::remote("p-1"),
            json!({ "quantity": 9.0 }),
        );
        store.push_mutation(&first).await.unwrap();
        store.push_mutation(&second).await.unwrap();

        let mut failed = first.clone();
        failed.retry_count = 2;
        failed.last_error = Some("timeout".to_string());
        failed.status = MutationStatus::Failed;
        failed.acknowledged = Some(json!({ "id": "out-1", "quantity": 1.0 }));
        store.save_mutation(&failed).await.unwrap();

        let queue = store.mutations().await.unwrap();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0], failed);
        assert_eq!(queue[1].id, second.id);
        assert_eq!(store.count_mutations().await.unwrap(), 2);

        assert!(store.remove_mutation(first.id).await.unwrap());
        assert_eq!(store.count_mutations().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sync_meta_upserts() {
        let store = SqliteCacheStore::in_memory();
        store
            .save_sync_meta(&SyncMeta::new(EntityKind::Recipe, 4, 0))
            .await
            .unwrap();
        store
            .save_sync_meta(&SyncMeta::new(EntityKind::Recipe, 0, 1))
            .await
            .unwrap();

        let meta = store.sync_meta(EntityKind::Recipe).await.unwrap().unwrap();
        assert_eq!(meta.last_result, SyncResultKind::Failure);
        assert_eq!(meta.failed_count, 1);
        assert!(store.sync_meta(EntityKind::Menu).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_only_touches_one_collection() {
        let store = SqliteCacheStore::in_memory();
        store.put(&product_entry("p-1", 1.0)).await.unwrap();
        store
            .put(&CachedEntity::from_remote(EntityKind::Menu, json!({ "id": "m-1" })).unwrap())
            .await
            .unwrap();

        store.clear(EntityKind::Product).await.unwrap();
        assert!(store.get_all(EntityKind::Product).await.unwrap().is_empty());
        assert_eq!(store.get_all(EntityKind::Menu).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_database_fails_health_check() {
        let store = SqliteCacheStore::new("sqlite:///nonexistent-dir/definitely/missing/cache.db");
        assert!(store.health_check().await.is_err());
    }
}
