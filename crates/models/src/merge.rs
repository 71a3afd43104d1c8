//! Recursive JSON merging, used for aggregate projections and the pricing
//! timeline.

use serde_json::{Map, Value};

/// Merges `overlay` into `base`. Nested objects are merged key by key;
/// every other value type is replaced by the overlay. Later writers win.
pub fn merge_json_objects(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, overlay_value) in overlay {
        match (base.get_mut(key), overlay_value) {
            (Some(Value::Object(base_object)), Value::Object(overlay_object)) => {
                merge_json_objects(base_object, overlay_object);
            }
            _ => {
                base.insert(key.clone(), overlay_value.clone());
            }
        }
    }
}

/// Folds a sequence of aggregate element contents, oldest first, into the
/// merged projection.
pub fn merge_aggregate_elements<'a>(
    elements: impl IntoIterator<Item = &'a Map<String, Value>>,
) -> Map<String, Value> {
    let mut merged = Map::new();
    for element in elements {
        merge_json_objects(&mut merged, element);
    }
    merged
}

#[cfg(test)]
mod test {
    use super::*;

    fn object(value: serde_json::Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    #[test]
    fn later_keys_override_earlier_ones() {
        let e1 = object(serde_json::json!({"a": 1, "b": 2}));
        let e2 = object(serde_json::json!({"b": 3, "c": 4}));
        let merged = merge_aggregate_elements([&e1, &e2]);
        assert_eq!(Value::Object(merged), serde_json::json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn nested_objects_merge_recursively() {
        let e1 = object(serde_json::json!({"price": {"storage": {"holding": "0.1"}}}));
        let e2 = object(serde_json::json!({"price": {"storage": {"payg": "0.01"}}}));
        let merged = merge_aggregate_elements([&e1, &e2]);
        assert_eq!(
            Value::Object(merged),
            serde_json::json!({"price": {"storage": {"holding": "0.1", "payg": "0.01"}}})
        );
    }

    #[test]
    fn arrays_are_replaced_not_merged() {
        let e1 = object(serde_json::json!({"keys": [1, 2, 3]}));
        let e2 = object(serde_json::json!({"keys": [4]}));
        let merged = merge_aggregate_elements([&e1, &e2]);
        assert_eq!(Value::Object(merged), serde_json::json!({"keys": [4]}));
    }

    #[test]
    fn object_replaces_scalar_and_vice_versa() {
        let e1 = object(serde_json::json!({"a": {"nested": true}}));
        let e2 = object(serde_json::json!({"a": 42}));
        let merged = merge_aggregate_elements([&e1, &e2]);
        assert_eq!(Value::Object(merged), serde_json::json!({"a": 42}));
    }
}
