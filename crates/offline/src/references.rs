//! Identifier references inside JSON records and mutation payloads.
//!
//! Local ids are prefixed UUIDs, so any string value equal to one is a
//! reference to that record, whatever field it sits in (`id`, `product_id`,
//! `recipe_ids[..]`, ...).

use std::collections::HashSet;

use serde_json::Value;

use stockpro_core::id::is_local_id;

/// Replace every string equal to `old` with `new`; returns `true` if anything changed.
pub fn rewrite_id(value: &mut Value, old: &str, new: &str) -> bool {
    match value {
        Value::String(s) if s == old => {
            *s = new.to_string();
            true
        }
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |changed, v| rewrite_id(v, old, new) || changed),
        Value::Object(map) => map
            .values_mut()
            .fold(false, |changed, v| rewrite_id(v, old, new) || changed),
        _ => false,
    }
}

/// `true` when `value` contains the string `id` anywhere.
pub fn references(value: &Value, id: &str) -> bool {
    match value {
        Value::String(s) => s == id,
        Value::Array(items) => items.iter().any(|v| references(v, id)),
        Value::Object(map) => map.values().any(|v| references(v, id)),
        _ => false,
    }
}

/// `true` when `value` contains any of `ids`.
pub fn references_any(value: &Value, ids: &HashSet<String>) -> bool {
    match value {
        Value::String(s) => ids.contains(s),
        Value::Array(items) => items.iter().any(|v| references_any(v, ids)),
        Value::Object(map) => map.values().any(|v| references_any(v, ids)),
        _ => false,
    }
}

/// First local id found anywhere in `value`.
pub fn find_local_id(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) if is_local_id(s) => Some(s.as_str()),
        Value::Array(items) => items.iter().find_map(find_local_id),
        Value::Object(map) => map.values().find_map(find_local_id),
        _ => None,
    }
}

/// Shallow merge of a patch object into `target` (patch keys win).
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(t), Value::Object(p)) => {
            for (k, v) in p {
                t.insert(k.clone(), v.clone());
            }
        }
        (t, p) => *t = p.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn rewrite_reaches_nested_fields() {
        let mut menu = json!({
            "id": "m-1",
            "recipe_ids": ["local_a", "r-2"],
            "meta": { "origin": "local_a" }
        });

        assert!(rewrite_id(&mut menu, "local_a", "r-9"));
        assert_eq!(menu["recipe_ids"], json!(["r-9", "r-2"]));
        assert_eq!(menu["meta"]["origin"], json!("r-9"));
        assert!(!references(&menu, "local_a"));
    }

    #[test]
    fn rewrite_reports_no_change() {
        let mut output = json!({ "product_id": "p-1", "quantity": 2 });
        assert!(!rewrite_id(&mut output, "local_x", "p-2"));
    }

    #[test]
    fn references_any_checks_all_values() {
        let ids: HashSet<String> = ["local_b".to_string()].into_iter().collect();
        assert!(references_any(&json!({ "product_id": "local_b" }), &ids));
        assert!(!references_any(&json!({ "product_id": "local_c" }), &ids));
    }

    #[test]
    fn finds_nested_local_id() {
        let local = stockpro_core::RecordId::new_local();
        let body = json!({ "lines": [{ "product_id": local.as_str() }] });
        assert_eq!(find_local_id(&body), Some(local.as_str()));
        assert_eq!(find_local_id(&json!({ "product_id": "p-1" })), None);
    }

    #[test]
    fn merge_patch_overwrites_keys() {
        let mut body = json!({ "name": "Beurre", "quantity": 4.0 });
        merge_patch(&mut body, &json!({ "quantity": 2.5 }));
        assert_eq!(body, json!({ "name": "Beurre", "quantity": 2.5 }));
    }

    proptest! {
        #[test]
        fn rewrite_removes_every_occurrence(n in 0usize..8, keep in "[a-z]{1,8}") {
            let old = "local_old";
            let items: Vec<Value> = (0..n)
                .map(|i| if i % 2 == 0 { json!(old) } else { json!(keep.clone()) })
                .collect();
            let mut value = json!({ "items": items, "id": old });

            prop_assert!(rewrite_id(&mut value, old, "srv-1"));
            prop_assert!(!references(&value, old));
        }
    }
}
