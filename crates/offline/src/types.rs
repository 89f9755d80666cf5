//! Shared types of the offline layer: cache bookkeeping, queued mutations,
//! sync metadata and sync reports.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use stockpro_core::{DomainError, Entity, EntityKind, MutationId, RecordId};

/// Implements `as_str`/`FromStr` and SQLite text encoding for a fieldless enum.
macro_rules! text_enum {
    ($t:ident, $name:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $t {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($t::$variant => $text,)+
                }
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($t::$variant),)+
                    other => Err(DomainError::validation(format!("invalid {}: {}", $name, other))),
                }
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl sqlx::Type<sqlx::Sqlite> for $t {
            fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                <&str as sqlx::Type<sqlx::Sqlite>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $t {
            fn decode(
                value: sqlx::sqlite::SqliteValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let s = <&str as sqlx::Decode<'r, sqlx::Sqlite>>::decode(value)?;
                Ok(s.parse::<$t>()?)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $t {
            fn encode_by_ref(
                &self,
                buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
            ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                let s = self.as_str();
                <&str as sqlx::Encode<'q, sqlx::Sqlite>>::encode_by_ref(&s, buf)
            }
        }
    };
}

/// Sync state of a cached record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    PendingCreate,
    PendingUpdate,
    PendingDelete,
}

text_enum!(SyncStatus, "sync status", {
    Synced => "synced",
    PendingCreate => "pending_create",
    PendingUpdate => "pending_update",
    PendingDelete => "pending_delete",
});

impl SyncStatus {
    pub fn is_pending(&self) -> bool {
        !matches!(self, SyncStatus::Synced)
    }
}

/// Kind of deferred write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOperation {
    Create,
    Update,
    Delete,
}

text_enum!(MutationOperation, "mutation operation", {
    Create => "create",
    Update => "update",
    Delete => "delete",
});

/// Queue state of a mutation.
///
/// `Failed` means "needs attention": the mutation stays in its queue position
/// but is skipped by drains until it is retried or discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Pending,
    Failed,
}

text_enum!(MutationStatus, "mutation status", {
    Pending => "pending",
    Failed => "failed",
});

/// A mirrored copy of a remote record plus its sync bookkeeping.
///
/// The untyped form (`CachedEntity<Value>`) is what the stores persist; typed
/// views are produced with [`CachedEntity::into_typed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntity<T = Value> {
    pub kind: EntityKind,
    /// Identifier the record was first known by on this device. For records
    /// pulled from the server it equals `remote_id`.
    pub local_id: RecordId,
    /// Server-issued identifier; `None` until the create is acknowledged.
    pub remote_id: Option<RecordId>,
    pub sync_status: SyncStatus,
    pub last_modified_at: DateTime<Utc>,
    pub record: T,
}

impl<T> CachedEntity<T> {
    /// Current lookup key: the remote id once known, the local id before.
    pub fn key(&self) -> &RecordId {
        self.remote_id.as_ref().unwrap_or(&self.local_id)
    }
}

impl<T: Entity> CachedEntity<T> {
    /// Entry mirroring the server's current state.
    pub fn synced(record: T) -> Self {
        let id = record.id().clone();
        Self {
            kind: T::KIND,
            local_id: id.clone(),
            remote_id: Some(id),
            sync_status: SyncStatus::Synced,
            last_modified_at: Utc::now(),
            record,
        }
    }

    /// Entry carrying an optimistic, not yet acknowledged write.
    pub fn pending(record: T, sync_status: SyncStatus) -> Self {
        let id = record.id().clone();
        let remote_id = (!id.is_local()).then(|| id.clone());
        Self {
            kind: T::KIND,
            local_id: id,
            remote_id,
            sync_status,
            last_modified_at: Utc::now(),
            record,
        }
    }

    pub fn to_untyped(&self) -> Result<CachedEntity<Value>, serde_json::Error> {
        Ok(CachedEntity {
            kind: self.kind,
            local_id: self.local_id.clone(),
            remote_id: self.remote_id.clone(),
            sync_status: self.sync_status,
            last_modified_at: self.last_modified_at,
            record: serde_json::to_value(&self.record)?,
        })
    }
}

impl CachedEntity<Value> {
    pub fn into_typed<T: Entity>(self) -> Result<CachedEntity<T>, serde_json::Error> {
        Ok(CachedEntity {
            kind: self.kind,
            local_id: self.local_id,
            remote_id: self.remote_id,
            sync_status: self.sync_status,
            last_modified_at: self.last_modified_at,
            record: serde_json::from_value(self.record)?,
        })
    }

    /// Entry for a raw server record; `None` when the record has no string `id`.
    pub fn from_remote(kind: EntityKind, record: Value) -> Option<Self> {
        let id = RecordId::remote(record.get("id")?.as_str()?);
        Some(Self {
            kind,
            local_id: id.clone(),
            remote_id: Some(id),
            sync_status: SyncStatus::Synced,
            last_modified_at: Utc::now(),
            record,
        })
    }
}

/// One deferred write waiting for server acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub id: MutationId,
    pub entity_kind: EntityKind,
    pub operation: MutationOperation,
    /// Record the mutation applies to; a local id for offline creations.
    pub target_id: RecordId,
    /// Full record body for creates, partial patch for updates, `null` for deletes.
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub status: MutationStatus,
    /// Server response, recorded once the remote write went through. A
    /// mutation carrying one is finished locally without being resent.
    #[serde(default)]
    pub acknowledged: Option<Value>,
}

impl PendingMutation {
    pub fn new(
        entity_kind: EntityKind,
        operation: MutationOperation,
        target_id: RecordId,
        payload: Value,
    ) -> Self {
        Self {
            id: MutationId::new(),
            entity_kind,
            operation,
            target_id,
            payload,
            created_at: Utc::now(),
            retry_count: 0,
            last_error: None,
            status: MutationStatus::Pending,
            acknowledged: None,
        }
    }

    pub fn needs_attention(&self) -> bool {
        self.status == MutationStatus::Failed
    }
}

/// Overall outcome of a sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncResultKind {
    Success,
    Partial,
    Failure,
}

text_enum!(SyncResultKind, "sync result", {
    Success => "success",
    Partial => "partial",
    Failure => "failure",
});

impl SyncResultKind {
    pub fn from_counts(succeeded: usize, failed: usize) -> Self {
        match (succeeded, failed) {
            (_, 0) => SyncResultKind::Success,
            (0, _) => SyncResultKind::Failure,
            _ => SyncResultKind::Partial,
        }
    }
}

/// Per-collection record of the last refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMeta {
    pub entity_kind: EntityKind,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_result: SyncResultKind,
    pub synced_count: usize,
    pub failed_count: usize,
}

impl SyncMeta {
    pub fn new(entity_kind: EntityKind, synced_count: usize, failed_count: usize) -> Self {
        Self {
            entity_kind,
            last_synced_at: Some(Utc::now()),
            last_result: SyncResultKind::from_counts(synced_count, failed_count),
            synced_count,
            failed_count,
        }
    }

    /// A refresh is due when the collection never synced successfully or the
    /// last sync is older than `max_age`.
    pub fn is_refresh_due(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        if self.last_result == SyncResultKind::Failure {
            return true;
        }
        match self.last_synced_at {
            Some(at) => now.signed_duration_since(at) > max_age,
            None => true,
        }
    }
}

/// A mutation that could not be applied during a drain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationFailure {
    pub mutation_id: MutationId,
    pub entity_kind: EntityKind,
    pub operation: MutationOperation,
    pub message: String,
    /// `true` when the mutation will no longer be retried automatically.
    pub needs_attention: bool,
}

/// Result of draining the pending-mutation queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub synced_mutations: usize,
    pub failed_mutations: usize,
    /// Left queued because they depend on a failed or blocked mutation.
    pub deferred_mutations: usize,
    pub errors: Vec<MutationFailure>,
}

impl SyncSummary {
    pub fn result_kind(&self) -> SyncResultKind {
        SyncResultKind::from_counts(
            self.synced_mutations,
            self.failed_mutations + self.deferred_mutations,
        )
    }

    pub fn is_empty(&self) -> bool {
        self.synced_mutations == 0 && self.failed_mutations == 0 && self.deferred_mutations == 0
    }
}

/// Result of a full cache refresh.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheRefreshReport {
    /// Records written per collection.
    pub counts: BTreeMap<EntityKind, usize>,
    /// Cached entries left untouched because a mutation still references them.
    pub kept_pending: usize,
    /// Collections whose fetch failed, with the error message.
    pub errors: BTreeMap<EntityKind, String>,
}

impl CacheRefreshReport {
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }
}

/// Connectivity state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    /// Online and the backend is reachable.
    Online,
    /// Offline (network unreachable or backend unavailable).
    Offline,
}

impl ConnectivityState {
    pub fn from_online(online: bool) -> Self {
        if online {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        }
    }

    pub fn is_online(&self) -> bool {
        *self == ConnectivityState::Online
    }
}
