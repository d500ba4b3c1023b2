//! Record representation and JSON helpers.
//!
//! A record is a semi-structured JSON object moving through the pipeline.
//! The engine never imposes a schema on records; adapters and route
//! conditions address fields by dotted path.

use serde_json::Value;

/// A single semi-structured record.
pub type Record = Value;

/// Look up a dotted field path (`"customer.address.city"`) in a record.
///
/// Returns `None` if any segment is missing or traverses a non-object.
#[must_use]
pub fn field_path<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = record;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// RFC 7386 merge-patch: object keys merge recursively, `null` removes a
/// key, anything else replaces the target wholesale.
///
/// Neither input is mutated; the merged document is a fresh value.
#[must_use]
pub fn merge_patch(base: &Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            let mut merged = base_map.clone();
            for (key, patch_value) in patch_map {
                if patch_value.is_null() {
                    merged.remove(key);
                } else {
                    let next = match merged.get(key) {
                        Some(existing) => merge_patch(existing, patch_value),
                        None => merge_patch(&Value::Null, patch_value),
                    };
                    merged.insert(key.clone(), next);
                }
            }
            Value::Object(merged)
        }
        // A non-object patch replaces the base entirely. Null removal of
        // nested keys only applies inside object-to-object merges.
        (_, Value::Object(patch_map)) => {
            let mut merged = serde_json::Map::new();
            for (key, patch_value) in patch_map {
                if !patch_value.is_null() {
                    merged.insert(key.clone(), merge_patch(&Value::Null, patch_value));
                }
            }
            Value::Object(merged)
        }
        (_, other) => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_path_resolves_nested_keys() {
        let record = json!({"customer": {"address": {"city": "Berlin"}}});
        assert_eq!(
            field_path(&record, "customer.address.city"),
            Some(&json!("Berlin"))
        );
        assert_eq!(field_path(&record, "customer.phone"), None);
        assert_eq!(field_path(&record, "customer.address.city.zip"), None);
    }

    #[test]
    fn field_path_single_segment() {
        let record = json!({"qty": 3});
        assert_eq!(field_path(&record, "qty"), Some(&json!(3)));
    }

    #[test]
    fn merge_patch_merges_and_removes() {
        let base = json!({"a": 1, "b": {"c": 2, "d": 3}, "e": 4});
        let patch = json!({"b": {"c": 20, "d": null}, "e": null, "f": 5});
        let merged = merge_patch(&base, &patch);
        assert_eq!(merged, json!({"a": 1, "b": {"c": 20}, "f": 5}));
        // Inputs untouched.
        assert_eq!(base["b"]["d"], json!(3));
        assert_eq!(patch["e"], json!(null));
    }

    #[test]
    fn merge_patch_scalar_replaces() {
        let base = json!({"a": 1});
        assert_eq!(merge_patch(&base, &json!(42)), json!(42));
        assert_eq!(merge_patch(&json!(1), &json!({"a": 2})), json!({"a": 2}));
    }

    #[test]
    fn merge_patch_is_idempotent() {
        let base = json!({"qty": 1, "name": "x"});
        let patch = json!({"qty": 7});
        let once = merge_patch(&base, &patch);
        let twice = merge_patch(&base, &patch);
        assert_eq!(once, twice);
    }
}
