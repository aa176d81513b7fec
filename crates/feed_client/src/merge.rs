//! Incremental delta merge.
//!
//! Deltas mirror the id-tree shape of the snapshot. Per key: `null` deletes,
//! a non-array object recurses (creating the target sub-object if absent),
//! anything else (scalar or array) overwrites wholesale. Arrays are never
//! merged element-wise. Applying the same delta twice is a no-op the second
//! time.

use serde_json::Value;

pub fn merge_delta(target: &mut Value, delta: &Value) {
    let delta_map = match delta {
        Value::Object(m) => m,
        // Non-object delta replaces the whole snapshot.
        other => {
            *target = other.clone();
            return;
        }
    };

    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    let target_map = target.as_object_mut().unwrap();

    for (key, dval) in delta_map {
        match dval {
            Value::Null => {
                target_map.remove(key);
            }
            Value::Object(_) => {
                let slot = target_map
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(Default::default()));
                merge_delta(slot, dval);
            }
            scalar_or_array => {
                target_map.insert(key.clone(), scalar_or_array.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_leaf_deletes_key() {
        let mut snap = json!({"a": {"b": 1, "c": 2}});
        merge_delta(&mut snap, &json!({"a": {"b": null}}));
        assert_eq!(snap, json!({"a": {"c": 2}}));
    }

    #[test]
    fn object_leaf_recurses_and_scalar_overwrites() {
        let mut snap = json!({"a": {"b": 1, "c": 2}});
        merge_delta(&mut snap, &json!({"a": {"b": 5}}));
        assert_eq!(snap, json!({"a": {"b": 5, "c": 2}}));
    }

    #[test]
    fn array_replaces_object_wholesale() {
        let mut snap = json!({"a": {"b": 1}});
        merge_delta(&mut snap, &json!({"a": [1, 2]}));
        assert_eq!(snap, json!({"a": [1, 2]}));
    }

    #[test]
    fn missing_subtree_is_created() {
        let mut snap = json!({});
        merge_delta(&mut snap, &json!({"game": {"10": {"price": "1.5"}}}));
        assert_eq!(snap, json!({"game": {"10": {"price": "1.5"}}}));
    }

    #[test]
    fn merge_is_idempotent() {
        let delta = json!({"game": {"10": {"price": "1.6", "old": null}, "11": null}});
        let mut once = json!({"game": {"10": {"price": "1.5", "old": 1}, "11": {"x": 2}}});
        merge_delta(&mut once, &delta);
        let mut twice = once.clone();
        merge_delta(&mut twice, &delta);
        assert_eq!(once, twice);
    }
}
