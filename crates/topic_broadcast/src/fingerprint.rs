//! Snapshot fingerprinting for redundant-push suppression.
//!
//! A fingerprint is a canonical string over the client-visible subset of a
//! snapshot: entity collections sorted by their explicit `order` field
//! (tie-broken by id), scalar fields filtered down to the ones that actually
//! change what a client renders. Input key insertion order never matters;
//! any included-field difference always does.
//!
//! The default field set is a policy, not a law — some sports carry state in
//! different fields, so topic kinds can override it.

use std::collections::BTreeMap;
use std::collections::HashSet;

use serde_json::Value;

/// Scalar fields that affect client-visible state.
const DEFAULT_FIELDS: &[&str] = &[
    "price",
    "blocked",
    "name",
    "team1",
    "team2",
    "score",
    "text_info",
    "type",
    "order",
    "base",
    "count",
];

#[derive(Debug, Clone)]
pub struct FingerprintPolicy {
    fields: HashSet<String>,
    /// Subtrees cut out entirely (e.g. `market` when fingerprinting the
    /// games list, whose odds get their own per-game fingerprints).
    skip_subtrees: HashSet<String>,
}

impl FingerprintPolicy {
    pub fn new(fields: &[&str]) -> Self {
        Self {
            fields: fields.iter().map(|s| s.to_string()).collect(),
            skip_subtrees: HashSet::new(),
        }
    }

    pub fn skipping(mut self, subtrees: &[&str]) -> Self {
        self.skip_subtrees = subtrees.iter().map(|s| s.to_string()).collect();
        self
    }

    fn includes(&self, field: &str) -> bool {
        self.fields.contains(field)
    }
}

impl Default for FingerprintPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_FIELDS)
    }
}

pub fn fingerprint(v: &Value, policy: &FingerprintPolicy) -> String {
    let mut out = String::new();
    write_canonical(&mut out, v, policy);
    out
}

/// Per-entity fingerprints for a collection map (id → entity), e.g. one odds
/// fingerprint per game.
pub fn fingerprint_each(
    collection: &Value,
    subtree: &str,
    policy: &FingerprintPolicy,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Value::Object(map) = collection {
        for (id, entity) in map {
            let part = entity.get(subtree).cloned().unwrap_or(Value::Null);
            out.insert(id.clone(), fingerprint(&part, policy));
        }
    }
    out
}

fn write_canonical(out: &mut String, v: &Value, policy: &FingerprintPolicy) {
    match v {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map
                .iter()
                .filter(|(k, _)| !policy.skip_subtrees.contains(*k))
                .collect();
            entries.sort_by(|a, b| entity_sort_key(a, b));

            out.push('{');
            let mut wrote = false;
            for (key, child) in entries {
                match child {
                    Value::Object(_) | Value::Array(_) => {
                        if wrote {
                            out.push(';');
                        }
                        out.push_str(key);
                        out.push('=');
                        write_canonical(out, child, policy);
                        wrote = true;
                    }
                    scalar => {
                        if policy.includes(key) {
                            if wrote {
                                out.push(';');
                            }
                            out.push_str(key);
                            out.push('=');
                            out.push_str(&scalar.to_string());
                            wrote = true;
                        }
                    }
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(';');
                }
                write_canonical(out, item, policy);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Collection order: explicit `order` field first (numeric when both sides
/// are numeric), id string as tie-break.
fn entity_sort_key(a: &(&String, &Value), b: &(&String, &Value)) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    let oa = a.1.get("order");
    let ob = b.1.get("order");
    let by_order = match (oa, ob) {
        (Some(x), Some(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => x.to_string().cmp(&y.to_string()),
        },
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_order.then_with(|| a.0.cmp(b.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_insertion_order_is_irrelevant() {
        let policy = FingerprintPolicy::default();
        let a = json!({"game": {"10": {"price": "1.5", "name": "A vs B"}}});
        let b = json!({"game": {"10": {"name": "A vs B", "price": "1.5"}}});
        assert_eq!(fingerprint(&a, &policy), fingerprint(&b, &policy));
    }

    #[test]
    fn price_change_changes_fingerprint() {
        let policy = FingerprintPolicy::default();
        let a = json!({"game": {"10": {"price": "1.5"}}});
        let b = json!({"game": {"10": {"price": "1.6"}}});
        assert_ne!(fingerprint(&a, &policy), fingerprint(&b, &policy));
    }

    #[test]
    fn volatile_fields_are_excluded() {
        let policy = FingerprintPolicy::default();
        let a = json!({"game": {"10": {"price": "1.5", "update_ms": 111}}});
        let b = json!({"game": {"10": {"price": "1.5", "update_ms": 999}}});
        assert_eq!(fingerprint(&a, &policy), fingerprint(&b, &policy));
    }

    #[test]
    fn entities_sort_by_order_field_then_id() {
        let policy = FingerprintPolicy::default();
        // same logical content, entities carrying order fields
        let a = json!({"9": {"order": 2, "price": "2.0"}, "10": {"order": 1, "price": "1.5"}});
        let b = json!({"10": {"order": 1, "price": "1.5"}, "9": {"order": 2, "price": "2.0"}});
        let fa = fingerprint(&a, &policy);
        assert_eq!(fa, fingerprint(&b, &policy));
        // "10" (order 1) must precede "9" (order 2)
        assert!(fa.find("price=\"1.5\"").unwrap() < fa.find("price=\"2.0\"").unwrap());
    }

    #[test]
    fn skipped_subtrees_do_not_contribute() {
        let policy = FingerprintPolicy::default().skipping(&["market"]);
        let a = json!({"10": {"name": "A vs B", "market": {"m1": {"price": "1.5"}}}});
        let b = json!({"10": {"name": "A vs B", "market": {"m1": {"price": "9.9"}}}});
        assert_eq!(fingerprint(&a, &policy), fingerprint(&b, &policy));
    }

    #[test]
    fn per_entity_fingerprints_track_their_own_subtree() {
        let policy = FingerprintPolicy::default();
        let a = json!({
            "10": {"market": {"m1": {"price": "1.5"}}},
            "11": {"market": {"m2": {"price": "3.0"}}}
        });
        let b = json!({
            "10": {"market": {"m1": {"price": "1.6"}}},
            "11": {"market": {"m2": {"price": "3.0"}}}
        });
        let fa = fingerprint_each(&a, "market", &policy);
        let fb = fingerprint_each(&b, "market", &policy);
        assert_ne!(fa["10"], fb["10"]);
        assert_eq!(fa["11"], fb["11"]);
    }
}
