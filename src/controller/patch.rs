//! JSON merge patch (RFC 7386) computation

use serde_json::{Map, Value};

/// Merge patch turning `from` into `to`, `None` when they are equal.
///
/// Keys present in `from` but not in `to` are set to `null` so the patch
/// replaces nested objects instead of merging into them.
pub fn merge_patch(from: &Value, to: &Value) -> Option<Value> {
    if from == to {
        return None;
    }
    match (from, to) {
        (Value::Object(from), Value::Object(to)) => {
            let mut patch = Map::new();
            for key in from.keys() {
                if !to.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            for (key, value) in to {
                match from.get(key) {
                    Some(old) => {
                        if let Some(diff) = merge_patch(old, value) {
                            patch.insert(key.clone(), diff);
                        }
                    }
                    None => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            Some(Value::Object(patch))
        }
        _ => Some(to.clone()),
    }
}
