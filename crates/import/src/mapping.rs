//! Which CSV column holds which field.

use serde::{Deserialize, Serialize};

/// Column index per imported field; `None` means "not in this file".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub product: Option<usize>,
    pub quantity: Option<usize>,
    pub unit: Option<usize>,
    pub price: Option<usize>,
}

impl Default for ColumnMapping {
    /// Template layout: product, quantity, unit, price.
    fn default() -> Self {
        Self {
            product: Some(0),
            quantity: Some(1),
            unit: Some(2),
            price: Some(3),
        }
    }
}

const PRODUCT_HEADERS: &[&str] = &["product", "produit", "name", "nom", "article", "designation"];
const QUANTITY_HEADERS: &[&str] = &["quantity", "quantite", "qty", "qte"];
const UNIT_HEADERS: &[&str] = &["unit", "unite"];
const PRICE_HEADERS: &[&str] = &["price", "prix", "unit price", "prix unitaire"];

impl ColumnMapping {
    /// Map columns from a header row; unrecognized fields keep their
    /// template position when that column exists and is not otherwise taken.
    pub fn guess(headers: &[String]) -> Self {
        let normalized: Vec<String> = headers.iter().map(|h| normalize(h)).collect();
        let mut used = vec![false; headers.len()];
        let mut find = |names: &[&str]| {
            let i = normalized.iter().enumerate().position(|(i, h)| {
                !used[i] && names.iter().any(|n| h == n || h.starts_with(&format!("{n} ")))
            })?;
            used[i] = true;
            Some(i)
        };

        // Price before unit so "unit price" is not taken for the unit.
        let product = find(PRODUCT_HEADERS);
        let quantity = find(QUANTITY_HEADERS);
        let price = find(PRICE_HEADERS);
        let unit = find(UNIT_HEADERS);
        let mut mapping = Self {
            product,
            quantity,
            unit,
            price,
        };

        let fallback = Self::default();
        for (field, default) in [
            (&mut mapping.product, fallback.product),
            (&mut mapping.quantity, fallback.quantity),
            (&mut mapping.unit, fallback.unit),
            (&mut mapping.price, fallback.price),
        ] {
            if field.is_some() {
                continue;
            }
            if let Some(i) = default.filter(|&i| i < used.len() && !used[i]) {
                used[i] = true;
                *field = Some(i);
            }
        }
        mapping
    }

    /// Field at `index` of `row`, or `""` when unmapped or missing.
    pub fn field<'a>(row: &'a [String], index: Option<usize>) -> &'a str {
        index.and_then(|i| row.get(i)).map(String::as_str).unwrap_or_default()
    }
}

/// Lowercase, strip French accents and surrounding punctuation.
fn normalize(header: &str) -> String {
    header
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'à' | 'â' => 'a',
            'î' | 'ï' => 'i',
            'ô' => 'o',
            'ù' | 'û' => 'u',
            'ç' => 'c',
            '_' | '-' => ' ',
            other => other,
        })
        .collect::<String>()
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_string()
}
