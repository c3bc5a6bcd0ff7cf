//! Partial values and the rules that keep them monotone.

use serde_json::Value;

use crate::schema::{child_path, kind_of};

/// A possibly-incomplete value observed while a stream is decoding.
pub type PartialValue = Value;

/// Returns true when `later` contains everything `earlier` does.
///
/// Objects keep all earlier keys, arrays keep their earlier prefix, strings
/// may only grow at the end, and every other value must be unchanged.
pub fn is_subsumed_by(earlier: &Value, later: &Value) -> bool {
    match (earlier, later) {
        (Value::Object(a), Value::Object(b)) => a
            .iter()
            .all(|(key, value)| b.get(key).is_some_and(|other| is_subsumed_by(value, other))),
        (Value::Array(a), Value::Array(b)) => {
            a.len() <= b.len() && a.iter().zip(b).all(|(x, y)| is_subsumed_by(x, y))
        }
        (Value::String(a), Value::String(b)) => b.starts_with(a.as_str()),
        (a, b) => a == b,
    }
}

/// A document that cannot be folded into what was already decoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct MergeConflict {
    pub path: String,
    pub message: String,
}

/// Folds `patch` into `target`.
///
/// Objects merge per key and arrays are extended. When `patch_is_partial` is
/// set, a patch string that is a prefix of the existing one is accepted since
/// it may still grow into it.
pub(crate) fn merge_document(
    target: &mut Value,
    patch: Value,
    path: &str,
    patch_is_partial: bool,
) -> Result<(), MergeConflict> {
    match (target, patch) {
        (Value::Object(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match existing.get_mut(&key) {
                    Some(slot) => {
                        merge_document(slot, value, &child_path(path, &key), patch_is_partial)?
                    }
                    None => {
                        existing.insert(key, value);
                    }
                }
            }
            Ok(())
        }
        (Value::Array(existing), Value::Array(incoming)) => {
            existing.extend(incoming);
            Ok(())
        }
        (Value::String(existing), Value::String(incoming))
            if patch_is_partial && existing.starts_with(incoming.as_str()) =>
        {
            Ok(())
        }
        (existing, incoming) if *existing == incoming => Ok(()),
        (existing, incoming) if kind_of(existing) != kind_of(&incoming) => Err(MergeConflict {
            path: path.to_string(),
            message: format!(
                "cannot replace {} with {}",
                kind_of(existing),
                kind_of(&incoming)
            ),
        }),
        (existing, incoming) => Err(MergeConflict {
            path: path.to_string(),
            message: format!("conflicting values {existing} and {incoming}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subsumption_allows_growth_only() {
        assert!(is_subsumed_by(&json!({"a": "x"}), &json!({"a": "xy", "b": 1})));
        assert!(is_subsumed_by(&json!([1]), &json!([1, 2])));
        assert!(!is_subsumed_by(&json!({"a": "x"}), &json!({"a": "y"})));
        assert!(!is_subsumed_by(&json!([1, 2]), &json!([1])));
        assert!(!is_subsumed_by(&json!({"a": 1}), &json!({"a": "1"})));
    }

    #[test]
    fn merge_combines_objects_and_extends_arrays() {
        let mut target = json!({"name": "Alice", "items": [{"id": "1"}]});
        merge_document(&mut target, json!({"items": [{"id": "2"}], "age": 3}), "$", false)
            .expect("merge");
        assert_eq!(
            target,
            json!({"name": "Alice", "items": [{"id": "1"}, {"id": "2"}], "age": 3})
        );
    }

    #[test]
    fn merge_rejects_changed_scalars_and_types() {
        let mut target = json!({"name": "Alice"});
        let err = merge_document(&mut target, json!({"name": "Bob"}), "$", false)
            .expect_err("conflict");
        assert_eq!(err.path, "$.name");

        let err = merge_document(&mut target, json!({"name": 5}), "$", false)
            .expect_err("type change");
        assert_eq!(err.message, "cannot replace string with number");
    }

    #[test]
    fn partial_merge_accepts_string_prefixes() {
        let mut target = json!({"name": "Alice"});
        assert!(merge_document(&mut target, json!({"name": "Al"}), "$", true).is_ok());
        assert_eq!(target, json!({"name": "Alice"}));
        assert!(merge_document(&mut target, json!({"name": "Al"}), "$", false).is_err());
    }
}
