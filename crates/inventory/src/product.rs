use serde::{Deserialize, Serialize};

use stockpro_core::{DomainError, DomainResult, Entity, EntityKind, RecordId};

/// A stocked product (ingredient, consumable, packaging...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: RecordId,
    pub name: String,
    pub unit: String,
    /// Quantity currently in stock, expressed in `unit`.
    pub quantity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_stock: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplier: Option<String>,
}

impl Entity for Product {
    const KIND: EntityKind = EntityKind::Product;

    fn id(&self) -> &RecordId {
        &self.id
    }
}

impl Product {
    /// Remove `quantity` from stock, as the backend does when an output is recorded.
    pub fn deduct(&mut self, quantity: f64) -> DomainResult<()> {
        if !quantity.is_finite() || quantity <= 0.0 {
            return Err(DomainError::validation("output quantity must be positive"));
        }
        if quantity > self.quantity {
            return Err(DomainError::InsufficientStock {
                available: self.quantity,
                requested: quantity,
            });
        }
        self.quantity -= quantity;
        Ok(())
    }

    pub fn is_below_minimum(&self) -> bool {
        self.min_stock.is_some_and(|min| self.quantity < min)
    }

    /// Apply a partial update in place.
    pub fn apply_patch(&mut self, patch: &ProductPatch) -> DomainResult<()> {
        patch.validate()?;
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(unit) = &patch.unit {
            self.unit = unit.clone();
        }
        if let Some(quantity) = patch.quantity {
            self.quantity = quantity;
        }
        if let Some(category) = &patch.category {
            self.category = Some(category.clone());
        }
        if let Some(min_stock) = patch.min_stock {
            self.min_stock = Some(min_stock);
        }
        if let Some(unit_price) = patch.unit_price {
            self.unit_price = Some(unit_price);
        }
        if let Some(supplier) = &patch.supplier {
            self.supplier = Some(supplier.clone());
        }
        Ok(())
    }
}

/// Partial update of a product. `None` fields are left untouched and are not
/// serialized, so the JSON form doubles as the remote PATCH body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_stock: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supplier: Option<String>,
}

impl ProductPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(DomainError::validation("name cannot be empty"));
        }
        if self.quantity.is_some_and(|q| !q.is_finite() || q < 0.0) {
            return Err(DomainError::validation("quantity cannot be negative"));
        }
        if self.min_stock.is_some_and(|q| !q.is_finite() || q < 0.0) {
            return Err(DomainError::validation("min_stock cannot be negative"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn carrots(quantity: f64) -> Product {
        Product {
            id: RecordId::remote("p-1"),
            name: "Carottes".to_string(),
            unit: "kg".to_string(),
            quantity,
            category: None,
            min_stock: Some(5.0),
            unit_price: None,
            supplier: None,
        }
    }

    #[test]
    fn deduct_reduces_stock() {
        let mut product = carrots(50.0);
        product.deduct(10.0).unwrap();
        assert_eq!(product.quantity, 40.0);
    }

    #[test]
    fn deduct_rejects_more_than_available() {
        let mut product = carrots(3.0);
        let err = product.deduct(4.0).unwrap_err();
        match err {
            DomainError::InsufficientStock { available, requested } => {
                assert_eq!(available, 3.0);
                assert_eq!(requested, 4.0);
            }
            _ => panic!("Expected InsufficientStock error"),
        }
        assert_eq!(product.quantity, 3.0);
    }

    #[test]
    fn deduct_rejects_non_positive_quantity() {
        let mut product = carrots(3.0);
        assert!(matches!(product.deduct(0.0), Err(DomainError::Validation(_))));
        assert!(matches!(product.deduct(-1.0), Err(DomainError::Validation(_))));
    }

    #[test]
    fn below_minimum_uses_min_stock() {
        assert!(carrots(4.0).is_below_minimum());
        assert!(!carrots(5.0).is_below_minimum());
    }

    #[test]
    fn patch_only_touches_set_fields() {
        let mut product = carrots(50.0);
        let patch = ProductPatch {
            quantity: Some(12.5),
            supplier: Some("Primeurs du Sud".to_string()),
            ..Default::default()
        };
        product.apply_patch(&patch).unwrap();

        assert_eq!(product.quantity, 12.5);
        assert_eq!(product.supplier.as_deref(), Some("Primeurs du Sud"));
        assert_eq!(product.name, "Carottes");
    }

    #[test]
    fn patch_serializes_without_unset_fields() {
        let patch = ProductPatch {
            quantity: Some(3.0),
            ..Default::default()
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json, serde_json::json!({ "quantity": 3.0 }));
    }

    #[test]
    fn patch_rejects_blank_name() {
        let patch = ProductPatch {
            name: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(patch.validate().is_err());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: a successful deduction never leaves negative stock.
            #[test]
            fn deduction_never_goes_negative(stock in 0.0f64..1000.0, qty in 0.001f64..1000.0) {
                let mut product = carrots(stock);
                match product.deduct(qty) {
                    Ok(()) => prop_assert!(product.quantity >= 0.0),
                    Err(_) => prop_assert_eq!(product.quantity, stock),
                }
            }
        }
    }
}
