//! In-memory backend double.
//!
//! Behaves like the hosted backend for the parts the sync layer relies on:
//! server-assigned ids, full-record responses, stock deduction on output
//! creation with an "insufficient stock" rejection. Every call is recorded so
//! tests can assert on ordering, and failures can be injected per call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;

use stockpro_core::{EntityKind, RecordId, id::is_local_id};

use super::{RemoteError, RemoteQuery, RemoteResult, RemoteService};
use crate::references;

/// One call received by the double.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    FetchAll(EntityKind),
    FetchById(EntityKind, RecordId),
    Create { kind: EntityKind, body: Value },
    Update { kind: EntityKind, id: RecordId, patch: Value },
    Delete { kind: EntityKind, id: RecordId },
    Ping,
}

impl RemoteCall {
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            RemoteCall::Create { .. } | RemoteCall::Update { .. } | RemoteCall::Delete { .. }
        )
    }
}

type FailureRule = Arc<dyn Fn(&RemoteCall) -> Option<RemoteError> + Send + Sync>;

#[derive(Default)]
pub struct InMemoryRemote {
    tables: Mutex<HashMap<EntityKind, Vec<Value>>>,
    calls: Mutex<Vec<RemoteCall>>,
    failure: Mutex<Option<FailureRule>>,
    offline: AtomicBool,
    latency_ms: AtomicU64,
    next_id: AtomicU64,
}

impl core::fmt::Debug for InMemoryRemote {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryRemote").finish_non_exhaustive()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace by `id`) a server-side record.
    pub fn insert(&self, kind: EntityKind, record: Value) {
        let mut tables = lock(&self.tables);
        let rows = tables.entry(kind).or_default();
        let id = record.get("id").cloned();
        match rows.iter_mut().find(|r| id.is_some() && r.get("id") == id.as_ref()) {
            Some(existing) => *existing = record,
            None => rows.push(record),
        }
    }

    pub fn records(&self, kind: EntityKind) -> Vec<Value> {
        lock(&self.tables).get(&kind).cloned().unwrap_or_default()
    }

    pub fn record(&self, kind: EntityKind, id: &str) -> Option<Value> {
        lock(&self.tables)
            .get(&kind)?
            .iter()
            .find(|r| r.get("id").and_then(Value::as_str) == Some(id))
            .cloned()
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        lock(&self.calls).clone()
    }

    pub fn write_calls(&self) -> Vec<RemoteCall> {
        lock(&self.calls).iter().filter(|c| c.is_write()).cloned().collect()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    /// Fail every call for which `rule` returns an error.
    pub fn fail_when(&self, rule: impl Fn(&RemoteCall) -> Option<RemoteError> + Send + Sync + 'static) {
        *lock(&self.failure) = Some(Arc::new(rule));
    }

    pub fn clear_failures(&self) {
        *lock(&self.failure) = None;
    }

    /// While offline every call fails with a transient network error.
    pub fn set_reachable(&self, reachable: bool) {
        self.offline.store(!reachable, Ordering::SeqCst);
    }

    /// Delay applied before answering each call.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn enter(&self, call: RemoteCall) -> RemoteResult<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        lock(&self.calls).push(call.clone());

        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::network("connection refused"));
        }
        let rule = lock(&self.failure).clone();
        match rule.and_then(|rule| rule(&call)) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn assign_id(&self, kind: EntityKind) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{n}", kind.as_str())
    }

    /// Server-side effect of recording an output: deduct the product's stock.
    fn apply_output(&self, tables: &mut HashMap<EntityKind, Vec<Value>>, body: &Value) -> RemoteResult<()> {
        let product_id = body.get("product_id").and_then(Value::as_str).unwrap_or_default();
        let quantity = body.get("quantity").and_then(Value::as_f64).unwrap_or_default();

        let product = tables
            .get_mut(&EntityKind::Product)
            .and_then(|rows| {
                rows.iter_mut()
                    .find(|r| r.get("id").and_then(Value::as_str) == Some(product_id))
            })
            .ok_or_else(|| {
                RemoteError::permanent(format!("product {product_id} does not exist")).with_code("23503")
            })?;

        let stock = product.get("quantity").and_then(Value::as_f64).unwrap_or_default();
        if quantity > stock {
            return Err(RemoteError::permanent("insufficient stock").with_code("P0001"));
        }
        product["quantity"] = Value::from(stock - quantity);
        Ok(())
    }
}

#[async_trait::async_trait]
impl RemoteService for InMemoryRemote {
    async fn fetch_all(&self, kind: EntityKind, query: &RemoteQuery) -> RemoteResult<Vec<Value>> {
        self.enter(RemoteCall::FetchAll(kind)).await?;
        Ok(self
            .records(kind)
            .into_iter()
            .filter(|r| query.matches(r))
            .collect())
    }

    async fn fetch_by_id(&self, kind: EntityKind, id: &RecordId) -> RemoteResult<Option<Value>> {
        self.enter(RemoteCall::FetchById(kind, id.clone())).await?;
        Ok(self.record(kind, id.as_str()))
    }

    async fn create(&self, kind: EntityKind, body: &Value) -> RemoteResult<Value> {
        self.enter(RemoteCall::Create {
            kind,
            body: body.clone(),
        })
        .await?;

        if references::find_local_id(body).is_some() {
            return Err(RemoteError::permanent("unresolved local reference").with_code("22P02"));
        }

        let mut tables = lock(&self.tables);
        if kind == EntityKind::Output {
            self.apply_output(&mut tables, body)?;
        }

        let mut record = body.clone();
        if let Value::Object(map) = &mut record {
            map.insert("id".to_string(), Value::String(self.assign_id(kind)));
        }
        tables.entry(kind).or_default().push(record.clone());
        Ok(record)
    }

    async fn update(&self, kind: EntityKind, id: &RecordId, patch: &Value) -> RemoteResult<Value> {
        self.enter(RemoteCall::Update {
            kind,
            id: id.clone(),
            patch: patch.clone(),
        })
        .await?;

        if is_local_id(id.as_str()) || references::find_local_id(patch).is_some() {
            return Err(RemoteError::permanent("unresolved local reference").with_code("22P02"));
        }

        let mut tables = lock(&self.tables);
        let record = tables
            .get_mut(&kind)
            .and_then(|rows| {
                rows.iter_mut()
                    .find(|r| r.get("id").and_then(Value::as_str) == Some(id.as_str()))
            })
            .ok_or_else(|| {
                RemoteError::permanent(format!("{kind} {id} not found on server")).with_code("not_found")
            })?;
        references::merge_patch(record, patch);
        Ok(record.clone())
    }

    async fn delete(&self, kind: EntityKind, id: &RecordId) -> RemoteResult<()> {
        self.enter(RemoteCall::Delete {
            kind,
            id: id.clone(),
        })
        .await?;

        if let Some(rows) = lock(&self.tables).get_mut(&kind) {
            rows.retain(|r| r.get("id").and_then(Value::as_str) != Some(id.as_str()));
        }
        Ok(())
    }

    async fn ping(&self) -> RemoteResult<()> {
        self.enter(RemoteCall::Ping).await
    }
}
