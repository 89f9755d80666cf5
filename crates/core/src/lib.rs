//! `stockpro-core`: shared building blocks for the kitchen inventory domain.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! record identifiers, entity kinds and the domain error model.

pub mod entity;
pub mod error;
pub mod id;

pub use entity::{Entity, EntityKind};
pub use error::{DomainError, DomainResult};
pub use id::{LOCAL_ID_PREFIX, MutationId, RecordId};
