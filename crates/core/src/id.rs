//! Record identifiers.
//!
//! Remote records carry the identifier issued by the backend. Records created
//! while offline carry a *local* identifier until the server acknowledges them.
//! Local identifiers always start with [`LOCAL_ID_PREFIX`] followed by a UUIDv7,
//! so they never collide with each other (across calls or reloads) and are
//! trivially distinguishable from server-issued ids.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Reserved prefix for client-generated identifiers.
pub const LOCAL_ID_PREFIX: &str = "local_";

/// Identifier of a cached record (local or remote).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Wrap a server-issued identifier.
    pub fn remote(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh local identifier.
    ///
    /// Uses UUIDv7 (time-ordered with a random tail), never a counter, so
    /// identifiers stay unique across page reloads and process restarts.
    pub fn new_local() -> Self {
        Self(format!("{LOCAL_ID_PREFIX}{}", Uuid::now_v7()))
    }

    /// `true` when this identifier was generated on the client.
    pub fn is_local(&self) -> bool {
        is_local_id(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

/// Pure predicate on the reserved local-id format.
pub fn is_local_id(id: &str) -> bool {
    id.strip_prefix(LOCAL_ID_PREFIX)
        .is_some_and(|rest| Uuid::parse_str(rest).is_ok())
}

impl core::fmt::Display for RecordId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RecordId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl FromStr for RecordId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(DomainError::invalid_id("RecordId: empty identifier"));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Identifier of a queued mutation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MutationId(Uuid);

impl MutationId {
    /// Uses UUIDv7 so ids sort in creation order.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MutationId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for MutationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for MutationId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s)
            .map_err(|e| DomainError::invalid_id(format!("MutationId: {e}")))?;
        Ok(Self(uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn local_ids_are_prefixed_and_unique() {
        let a = RecordId::new_local();
        let b = RecordId::new_local();

        assert!(a.as_str().starts_with(LOCAL_ID_PREFIX));
        assert!(a.is_local());
        assert_ne!(a, b);
    }

    #[test]
    fn server_uuid_is_not_local() {
        let remote = RecordId::remote(Uuid::now_v7().to_string());
        assert!(!remote.is_local());
    }

    #[test]
    fn prefix_alone_is_not_a_local_id() {
        assert!(!is_local_id("local_"));
        assert!(!is_local_id("local_pizza"));
    }

    #[test]
    fn empty_record_id_is_rejected() {
        let err = "   ".parse::<RecordId>().unwrap_err();
        assert!(matches!(err, DomainError::InvalidId(_)));
    }

    proptest! {
        #[test]
        fn arbitrary_server_ids_never_look_local(id in "[A-Za-z0-9-]{1,40}") {
            prop_assert!(!RecordId::remote(id).is_local());
        }
    }
}
