//! Binding free-text product names to the catalog.

use serde::{Deserialize, Serialize};

use stockpro_core::RecordId;
use stockpro_inventory::Product;

/// Catalog entry as seen by the importer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogProduct {
    pub id: RecordId,
    pub name: String,
    pub unit: String,
}

impl From<&Product> for CatalogProduct {
    fn from(p: &Product) -> Self {
        Self {
            id: p.id.clone(),
            name: p.name.clone(),
            unit: p.unit.clone(),
        }
    }
}

/// Which rule produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    Exact,
    Contains,
    Prefix,
}

/// Shortest first word used for prefix matching; shorter words match too much.
const MIN_PREFIX_LEN: usize = 3;

/// Find the catalog product for `name`, case-insensitively.
///
/// Tiers, first hit wins: exact name; containment in either direction;
/// catalog name starting with the first word of `name`.
pub fn match_product<'a>(
    name: &str,
    catalog: &'a [CatalogProduct],
) -> Option<(&'a CatalogProduct, MatchTier)> {
    let needle = name.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }
    let lowered: Vec<String> = catalog.iter().map(|p| p.name.trim().to_lowercase()).collect();

    if let Some(i) = lowered.iter().position(|n| *n == needle) {
        return Some((&catalog[i], MatchTier::Exact));
    }

    if let Some(i) = lowered
        .iter()
        .position(|n| !n.is_empty() && (n.contains(&needle) || needle.contains(n.as_str())))
    {
        return Some((&catalog[i], MatchTier::Contains));
    }

    let token = needle.split_whitespace().next()?;
    if token.chars().count() < MIN_PREFIX_LEN {
        return None;
    }
    lowered
        .iter()
        .position(|n| n.starts_with(token))
        .map(|i| (&catalog[i], MatchTier::Prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<CatalogProduct> {
        ["Carottes", "Poulet entier", "Huile d'olive"]
            .iter()
            .enumerate()
            .map(|(i, name)| CatalogProduct {
                id: RecordId::remote(format!("p-{}", i + 1)),
                name: name.to_string(),
                unit: "kg".to_string(),
            })
            .collect()
    }

    fn tier(name: &str) -> Option<(String, MatchTier)> {
        let catalog = catalog();
        match_product(name, &catalog).map(|(p, t)| (p.name.clone(), t))
    }

    #[test]
    fn exact_match_ignores_case() {
        assert_eq!(tier("carottes"), Some(("Carottes".to_string(), MatchTier::Exact)));
    }

    #[test]
    fn containment_works_both_ways() {
        assert_eq!(tier("Carottes bio"), Some(("Carottes".to_string(), MatchTier::Contains)));
        assert_eq!(tier("huile"), Some(("Huile d'olive".to_string(), MatchTier::Contains)));
    }

    #[test]
    fn prefix_uses_first_word() {
        assert_eq!(
            tier("Poulet haché"),
            Some(("Poulet entier".to_string(), MatchTier::Prefix))
        );
    }

    #[test]
    fn short_first_word_is_not_a_prefix() {
        assert_eq!(tier("Po xyz"), None);
        assert_eq!(tier("Ca rottes"), None);
    }

    #[test]
    fn blank_and_unknown_names_do_not_match() {
        assert_eq!(tier("   "), None);
        assert_eq!(tier("Saumon"), None);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: an exact catalog name matches regardless of letter case.
            #[test]
            fn exact_match_is_case_insensitive(idx in 0usize..3, upper in any::<bool>()) {
                let catalog = catalog();
                let name = if upper {
                    catalog[idx].name.to_uppercase()
                } else {
                    catalog[idx].name.to_lowercase()
                };
                let (found, tier) = match_product(&name, &catalog).unwrap();
                prop_assert_eq!(&found.id, &catalog[idx].id);
                prop_assert_eq!(tier, MatchTier::Exact);
            }
        }
    }
}
