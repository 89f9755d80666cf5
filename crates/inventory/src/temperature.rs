//! HACCP temperature logging.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockpro_core::{DomainError, DomainResult, Entity, EntityKind, RecordId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquipmentType {
    Fridge,
    Freezer,
    ColdRoom,
    HotHolding,
}

/// A monitored appliance with its acceptable range in °C.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureEquipment {
    pub id: RecordId,
    pub name: String,
    pub equipment_type: EquipmentType,
    pub min_temp: f64,
    pub max_temp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl Entity for TemperatureEquipment {
    const KIND: EntityKind = EntityKind::TemperatureEquipment;

    fn id(&self) -> &RecordId {
        &self.id
    }
}

impl TemperatureEquipment {
    /// Inclusive on both bounds.
    pub fn is_within_range(&self, temperature: f64) -> bool {
        temperature >= self.min_temp && temperature <= self.max_temp
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReading {
    pub id: RecordId,
    pub equipment_id: RecordId,
    pub temperature: f64,
    pub recorded_at: DateTime<Utc>,
    pub is_compliant: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Entity for TemperatureReading {
    const KIND: EntityKind = EntityKind::TemperatureReading;

    fn id(&self) -> &RecordId {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTemperatureReading {
    pub equipment_id: RecordId,
    pub temperature: f64,
    pub recorded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl NewTemperatureReading {
    /// Build the stored reading; compliance is judged against `equipment`.
    pub fn into_reading(
        self,
        id: RecordId,
        equipment: &TemperatureEquipment,
    ) -> DomainResult<TemperatureReading> {
        if !self.temperature.is_finite() {
            return Err(DomainError::validation("temperature must be a number"));
        }
        if self.equipment_id != equipment.id {
            return Err(DomainError::invariant("equipment_id mismatch"));
        }
        Ok(TemperatureReading {
            id,
            is_compliant: equipment.is_within_range(self.temperature),
            equipment_id: self.equipment_id,
            temperature: self.temperature,
            recorded_at: self.recorded_at,
            recorded_by: self.recorded_by,
            notes: self.notes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fridge() -> TemperatureEquipment {
        TemperatureEquipment {
            id: RecordId::remote("eq-1"),
            name: "Frigo légumes".to_string(),
            equipment_type: EquipmentType::Fridge,
            min_temp: 0.0,
            max_temp: 4.0,
            location: None,
        }
    }

    fn reading(temperature: f64) -> NewTemperatureReading {
        NewTemperatureReading {
            equipment_id: RecordId::remote("eq-1"),
            temperature,
            recorded_at: Utc::now(),
            recorded_by: Some("Chef".to_string()),
            notes: None,
        }
    }

    #[test]
    fn range_bounds_are_inclusive() {
        let eq = fridge();
        assert!(eq.is_within_range(0.0));
        assert!(eq.is_within_range(4.0));
        assert!(!eq.is_within_range(4.1));
        assert!(!eq.is_within_range(-0.5));
    }

    #[test]
    fn reading_compliance_is_computed() {
        let eq = fridge();
        let ok = reading(3.0).into_reading(RecordId::new_local(), &eq).unwrap();
        let hot = reading(8.0).into_reading(RecordId::new_local(), &eq).unwrap();
        assert!(ok.is_compliant);
        assert!(!hot.is_compliant);
    }

    #[test]
    fn reading_for_other_equipment_is_rejected() {
        let mut other = fridge();
        other.id = RecordId::remote("eq-2");
        let err = reading(3.0).into_reading(RecordId::new_local(), &other).unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }
}
