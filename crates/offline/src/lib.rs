//! `stockpro-offline`
//!
//! **Responsibility:** Offline support for the kitchen client.
//!
//! This crate provides:
//! - A local cache of the backend collections plus a durable queue of
//!   pending mutations (SQLite, or in-memory)
//! - Connectivity tracking with transition callbacks
//! - The sync engine (queue draining, local-id resolution, cache refresh)
//!   and a background worker driving it
//! - An offline-aware facade with the same read/write surface as the remote
//!   client
//!
//! The remote backend stays the authority; local writes are optimistic until
//! acknowledged.

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod notify;
pub mod offline_api;
pub mod references;
pub mod remote;
pub mod retry;
pub mod sync_engine;
pub mod sync_worker;
pub mod types;

pub use cache::{CacheStore, InMemoryCacheStore, LocalCache, SqliteCacheStore, StoreError};
pub use config::SyncConfig;
pub use connectivity::{ConnectivityMonitor, Subscription};
pub use notify::{BroadcastNotifier, Notification, Notifier, TracingNotifier};
pub use offline_api::{ApiError, OfflineApi};
pub use remote::{
    InMemoryRemote, RemoteCall, RemoteError, RemoteErrorKind, RemoteQuery, RemoteService,
    RestRemoteService,
};
pub use retry::RetryPolicy;
pub use sync_engine::{FullSyncReport, SyncEngine, SyncError, SyncStage};
pub use sync_worker::{SyncWorker, SyncWorkerHandle};
pub use types::{
    CacheRefreshReport, CachedEntity, ConnectivityState, MutationFailure, MutationOperation,
    MutationStatus, PendingMutation, SyncMeta, SyncResultKind, SyncStatus, SyncSummary,
};
