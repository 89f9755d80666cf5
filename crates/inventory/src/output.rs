use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use stockpro_core::{DomainError, DomainResult, Entity, EntityKind, RecordId};

/// Why stock left the kitchen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputReason {
    Service,
    Loss,
    StaffMeal,
    Transfer,
}

/// A stock output: a quantity of one product consumed on a given day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub id: RecordId,
    pub product_id: RecordId,
    pub quantity: f64,
    pub reason: OutputReason,
    pub date: NaiveDate,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Entity for Output {
    const KIND: EntityKind = EntityKind::Output;

    fn id(&self) -> &RecordId {
        &self.id
    }
}

/// Input for recording an output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOutput {
    pub product_id: RecordId,
    pub quantity: f64,
    pub reason: OutputReason,
    pub date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl NewOutput {
    pub fn validate(&self) -> DomainResult<()> {
        if !self.quantity.is_finite() || self.quantity <= 0.0 {
            return Err(DomainError::validation("output quantity must be positive"));
        }
        Ok(())
    }

    pub fn into_output(self, id: RecordId, created_at: DateTime<Utc>) -> Output {
        Output {
            id,
            product_id: self.product_id,
            quantity: self.quantity,
            reason: self.reason,
            date: self.date,
            created_at,
            notes: self.notes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_output(quantity: f64) -> NewOutput {
        NewOutput {
            product_id: RecordId::remote("p-1"),
            quantity,
            reason: OutputReason::Service,
            date: NaiveDate::from_ymd_opt(2026, 3, 14).unwrap(),
            notes: None,
        }
    }

    #[test]
    fn zero_quantity_is_invalid() {
        assert!(new_output(0.0).validate().is_err());
        assert!(new_output(f64::NAN).validate().is_err());
        assert!(new_output(1.5).validate().is_ok());
    }

    #[test]
    fn reason_serializes_snake_case() {
        let json = serde_json::to_value(OutputReason::StaffMeal).unwrap();
        assert_eq!(json, serde_json::json!("staff_meal"));
    }

    #[test]
    fn into_output_keeps_fields() {
        let id = RecordId::new_local();
        let output = new_output(2.0).into_output(id.clone(), Utc::now());
        assert_eq!(output.id, id);
        assert_eq!(output.quantity, 2.0);
        assert_eq!(output.product_id, RecordId::remote("p-1"));
    }
}
