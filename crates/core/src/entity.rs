//! Entity trait: identity + the collection a record lives in.

use core::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::RecordId;

/// Every collection mirrored by the offline cache.
///
/// Each kind maps to exactly one cache table and one remote table; there is
/// no untyped, string-keyed collection access.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Product,
    Output,
    Recipe,
    Menu,
    TemperatureEquipment,
    TemperatureReading,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Product,
        EntityKind::Output,
        EntityKind::Recipe,
        EntityKind::Menu,
        EntityKind::TemperatureEquipment,
        EntityKind::TemperatureReading,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Product => "product",
            EntityKind::Output => "output",
            EntityKind::Recipe => "recipe",
            EntityKind::Menu => "menu",
            EntityKind::TemperatureEquipment => "temperature_equipment",
            EntityKind::TemperatureReading => "temperature_reading",
        }
    }

    /// Table name, shared by the local cache and the remote backend.
    pub fn table_name(&self) -> &'static str {
        match self {
            EntityKind::Product => "products",
            EntityKind::Output => "outputs",
            EntityKind::Recipe => "recipes",
            EntityKind::Menu => "menus",
            EntityKind::TemperatureEquipment => "temperature_equipment",
            EntityKind::TemperatureReading => "temperature_readings",
        }
    }
}

impl core::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown entity kind '{s}'")))
    }
}

/// A typed record that can be mirrored in the local cache.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Collection this record belongs to.
    const KIND: EntityKind;

    /// Returns the record identifier (local or remote).
    fn id(&self) -> &RecordId;
}
