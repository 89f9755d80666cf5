use serde::{Deserialize, Serialize};

use stockpro_core::{Entity, EntityKind, RecordId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeIngredient {
    pub product_id: RecordId,
    /// Quantity for the recipe's base number of portions.
    pub quantity: f64,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub id: RecordId,
    pub name: String,
    pub portions: f64,
    #[serde(default)]
    pub ingredients: Vec<RecipeIngredient>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl Entity for Recipe {
    const KIND: EntityKind = EntityKind::Recipe;

    fn id(&self) -> &RecordId {
        &self.id
    }
}

impl Recipe {
    /// Ingredient quantities needed for `portions`, scaled from the base yield.
    pub fn requirements_for(&self, portions: f64) -> Vec<(RecordId, f64)> {
        if self.portions <= 0.0 {
            return Vec::new();
        }
        let factor = portions / self.portions;
        self.ingredients
            .iter()
            .map(|i| (i.product_id.clone(), i.quantity * factor))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requirements_scale_linearly() {
        let recipe = Recipe {
            id: RecordId::remote("r-1"),
            name: "Velouté de carottes".to_string(),
            portions: 4.0,
            ingredients: vec![RecipeIngredient {
                product_id: RecordId::remote("p-1"),
                quantity: 1.0,
                unit: "kg".to_string(),
            }],
            instructions: None,
        };

        let req = recipe.requirements_for(10.0);
        assert_eq!(req, vec![(RecordId::remote("p-1"), 2.5)]);
    }

    #[test]
    fn zero_yield_recipe_needs_nothing() {
        let recipe = Recipe {
            id: RecordId::remote("r-2"),
            name: "Brouillon".to_string(),
            portions: 0.0,
            ingredients: Vec::new(),
            instructions: None,
        };
        assert!(recipe.requirements_for(3.0).is_empty());
    }
}
