//! JSON merge-patch (RFC 7386) helpers.
//!
//! RFC 6902 operation lists come from the `json_patch` crate; the merge-patch
//! side lives here because we also need the reverse direction (computing a
//! merge patch from two documents) for drift reporting.

use serde_json::{Map, Value};

/// Applies an RFC 7386 merge patch to `doc` in place.
pub fn apply_merge_patch(doc: &mut Value, patch: &Value) {
    let Value::Object(entries) = patch else {
        *doc = patch.clone();
        return;
    };

    if !doc.is_object() {
        *doc = Value::Object(Map::new());
    }
    if let Value::Object(target) = doc {
        for (key, value) in entries {
            if value.is_null() {
                target.remove(key);
            } else {
                match target.get_mut(key) {
                    Some(existing) => apply_merge_patch(existing, value),
                    None => {
                        let mut fresh = Value::Null;
                        apply_merge_patch(&mut fresh, value);
                        target.insert(key.clone(), fresh);
                    }
                }
            }
        }
    }
}

/// Computes the RFC 7386 merge patch that turns `original` into `modified`.
///
/// Returns `Value::Null`-free objects; an empty object means the documents
/// already agree.
pub fn create_merge_patch(original: &Value, modified: &Value) -> Value {
    match (original, modified) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for (key, new_value) in new {
                match old.get(key) {
                    Some(old_value) if old_value == new_value => {}
                    Some(old_value) => {
                        patch.insert(key.clone(), create_merge_patch(old_value, new_value));
                    }
                    None => {
                        patch.insert(key.clone(), new_value.clone());
                    }
                }
            }
            for key in old.keys() {
                if !new.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => modified.clone(),
    }
}

/// Deep-merges `overlay` onto `base`: maps merge recursively with the overlay
/// winning per key, everything else (scalars and arrays) is replaced.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}
