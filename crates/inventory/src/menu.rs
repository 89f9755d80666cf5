use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use stockpro_core::{Entity, EntityKind, RecordId};

/// A dated menu built from recipes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Menu {
    pub id: RecordId,
    pub name: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub recipe_ids: Vec<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

impl Entity for Menu {
    const KIND: EntityKind = EntityKind::Menu;

    fn id(&self) -> &RecordId {
        &self.id
    }
}
