//! Canonical query keys.
//!
//! Two workers asking for the same view must land on the same upstream
//! subscription even when their query objects were built with different key
//! insertion orders, so the lookup key is a recursive key-sorted rendering
//! of the descriptor.

use serde_json::Value;

pub fn canonical_key(query: &Value) -> String {
    let mut out = String::new();
    write_canonical(&mut out, query);
    out
}

fn write_canonical(out: &mut String, v: &Value) {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(k);
                out.push(':');
                write_canonical(out, &map[*k]);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_is_insertion_order_independent() {
        let a = json!({"what": {"game": ["id", "name"]}, "where": {"sport": {"id": 1}}});
        let b = json!({"where": {"sport": {"id": 1}}, "what": {"game": ["id", "name"]}});
        assert_eq!(canonical_key(&a), canonical_key(&b));
    }

    #[test]
    fn key_distinguishes_values_and_array_order() {
        let a = json!({"where": {"sport": {"id": 1}}});
        let b = json!({"where": {"sport": {"id": 2}}});
        assert_ne!(canonical_key(&a), canonical_key(&b));

        let c = json!({"what": {"game": ["id", "name"]}});
        let d = json!({"what": {"game": ["name", "id"]}});
        assert_ne!(canonical_key(&c), canonical_key(&d));
    }
}
