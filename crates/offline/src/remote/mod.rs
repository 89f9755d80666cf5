//! Remote service boundary.
//!
//! The backend is reached through [`RemoteService`], which deals in raw JSON
//! records so the sync engine can replay any queued mutation without knowing
//! its concrete type. Every failure carries a [`RemoteErrorKind`] deciding
//! whether the mutation is retried.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use stockpro_core::{EntityKind, RecordId};

pub mod in_memory;
pub mod rest;

pub use in_memory::{InMemoryRemote, RemoteCall};
pub use rest::RestRemoteService;

pub type RemoteResult<T> = Result<T, RemoteError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// Timeout, network failure, 408/429/5xx. Retry eligible.
    Transient,
    /// Business-rule rejection, validation failure, missing record. Needs a human.
    Permanent,
}

/// Structured failure returned by the remote service.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl RemoteError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::Transient,
            message: message.into(),
            code: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: RemoteErrorKind::Permanent,
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn timeout(after: Duration) -> Self {
        Self::transient(format!("remote call timed out after {}s", after.as_secs_f64()))
            .with_code("timeout")
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::transient(message).with_code("network")
    }

    /// Classify an HTTP error response. PostgREST-style bodies
    /// (`{"message": .., "code": ..}`) provide the message and code.
    pub fn from_status(status: u16, body: &str) -> Self {
        let parsed: Option<Value> = serde_json::from_str(body).ok();
        let message = parsed
            .as_ref()
            .and_then(|v| v.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| {
                if body.trim().is_empty() {
                    format!("HTTP {status}")
                } else {
                    body.trim().to_string()
                }
            });
        let code = parsed
            .as_ref()
            .and_then(|v| v.get("code"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| status.to_string());

        let kind = if status == 408 || status == 429 || status >= 500 {
            RemoteErrorKind::Transient
        } else {
            RemoteErrorKind::Permanent
        };

        Self {
            kind,
            message,
            code: Some(code),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == RemoteErrorKind::Transient
    }
}

/// Row filter for collection reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteQuery {
    All,
    /// `from <= column <= to`
    Between {
        column: String,
        from: String,
        to: String,
    },
    /// `column >= from`
    Since { column: String, from: String },
}

impl RemoteQuery {
    /// Records whose date `column` equals `date`.
    pub fn on_date(column: impl Into<String>, date: NaiveDate) -> Self {
        let day = date.to_string();
        RemoteQuery::Between {
            column: column.into(),
            from: day.clone(),
            to: day,
        }
    }

    pub fn between_times(column: impl Into<String>, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        RemoteQuery::Between {
            column: column.into(),
            from: from.to_rfc3339_opts(SecondsFormat::Secs, true),
            to: to.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    pub fn since(column: impl Into<String>, from: DateTime<Utc>) -> Self {
        RemoteQuery::Since {
            column: column.into(),
            from: from.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    /// Evaluate the filter against a record, locally.
    pub fn matches(&self, record: &Value) -> bool {
        match self {
            RemoteQuery::All => true,
            RemoteQuery::Between { column, from, to } => match record.get(column).and_then(Value::as_str) {
                Some(v) => compare(v, from) != Ordering::Less && compare(v, to) != Ordering::Greater,
                None => false,
            },
            RemoteQuery::Since { column, from } => match record.get(column).and_then(Value::as_str) {
                Some(v) => compare(v, from) != Ordering::Less,
                None => false,
            },
        }
    }
}

/// Timestamps compare chronologically, anything else as text.
fn compare(a: &str, b: &str) -> Ordering {
    match (DateTime::parse_from_rfc3339(a), DateTime::parse_from_rfc3339(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// Async CRUD against the backend, per entity kind.
///
/// Writes return the full stored record; the server is authoritative for
/// computed fields (ids, stock after deduction, timestamps).
#[async_trait::async_trait]
pub trait RemoteService: Send + Sync {
    async fn fetch_all(&self, kind: EntityKind, query: &RemoteQuery) -> RemoteResult<Vec<Value>>;

    async fn fetch_by_id(&self, kind: EntityKind, id: &RecordId) -> RemoteResult<Option<Value>>;

    /// Create a record. `body` carries no `id`; the server assigns it.
    async fn create(&self, kind: EntityKind, body: &Value) -> RemoteResult<Value>;

    async fn update(&self, kind: EntityKind, id: &RecordId, patch: &Value) -> RemoteResult<Value>;

    async fn delete(&self, kind: EntityKind, id: &RecordId) -> RemoteResult<()>;

    /// Lightweight reachability check.
    async fn ping(&self) -> RemoteResult<()>;
}

#[async_trait::async_trait]
impl<S> RemoteService for Arc<S>
where
    S: RemoteService + ?Sized,
{
    async fn fetch_all(&self, kind: EntityKind, query: &RemoteQuery) -> RemoteResult<Vec<Value>> {
        (**self).fetch_all(kind, query).await
    }

    async fn fetch_by_id(&self, kind: EntityKind, id: &RecordId) -> RemoteResult<Option<Value>> {
        (**self).fetch_by_id(kind, id).await
    }

    async fn create(&self, kind: EntityKind, body: &Value) -> RemoteResult<Value> {
        (**self).create(kind, body).await
    }

    async fn update(&self, kind: EntityKind, id: &RecordId, patch: &Value) -> RemoteResult<Value> {
        (**self).update(kind, id, patch).await
    }

    async fn delete(&self, kind: EntityKind, id: &RecordId) -> RemoteResult<()> {
        (**self).delete(kind, id).await
    }

    async fn ping(&self) -> RemoteResult<()> {
        (**self).ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_classification() {
        assert!(RemoteError::from_status(503, "").is_transient());
        assert!(RemoteError::from_status(429, "slow down").is_transient());
        assert!(RemoteError::from_status(408, "").is_transient());
        assert!(!RemoteError::from_status(400, "").is_transient());
        assert!(!RemoteError::from_status(409, "").is_transient());
    }

    #[test]
    fn postgrest_body_provides_message_and_code() {
        let err = RemoteError::from_status(
            400,
            r#"{"code":"P0001","message":"insufficient stock","details":null}"#,
        );
        assert_eq!(err.message, "insufficient stock");
        assert_eq!(err.code.as_deref(), Some("P0001"));

        let plain = RemoteError::from_status(502, "");
        assert_eq!(plain.message, "HTTP 502");
        assert_eq!(plain.code.as_deref(), Some("502"));
    }

    #[test]
    fn date_filter_matches_single_day() {
        let day = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        let query = RemoteQuery::on_date("date", day);
        assert!(query.matches(&json!({ "date": "2026-03-14" })));
        assert!(!query.matches(&json!({ "date": "2026-03-15" })));
        assert!(!query.matches(&json!({ "quantity": 1 })));
    }

    #[test]
    fn since_compares_timestamps_chronologically() {
        let from = DateTime::parse_from_rfc3339("2026-03-10T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let query = RemoteQuery::since("recorded_at", from);
        assert!(query.matches(&json!({ "recorded_at": "2026-03-10T00:00:00+00:00" })));
        assert!(query.matches(&json!({ "recorded_at": "2026-03-12T08:30:00.123Z" })));
        assert!(!query.matches(&json!({ "recorded_at": "2026-03-09T23:59:59Z" })));
    }
}
