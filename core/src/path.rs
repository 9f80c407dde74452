//! Dotted-path access into JSON documents.
//!
//! Events, view models and notifications are plain [`serde_json::Value`]
//! documents whose interesting fields live at configurable locations such as
//! `"aggregate.id"` or `"payload.email"`. This module is the single place that
//! knows how to walk those paths.
//!
//! # Example
//!
//! ```
//! use denormalizer_core::path;
//! use serde_json::json;
//!
//! let mut doc = json!({ "aggregate": { "id": "user-1" } });
//! assert_eq!(path::get(&doc, "aggregate.id"), Some(&json!("user-1")));
//!
//! path::set(&mut doc, "payload.email", json!("a@b.c"));
//! assert_eq!(path::get(&doc, "payload.email"), Some(&json!("a@b.c")));
//! ```

use serde_json::{Map, Value};

/// Get the value at `path`, or `None` if any segment is missing.
///
/// Numeric segments index into arrays. An empty path returns the document itself.
#[must_use]
pub fn get<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }

    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Mutable variant of [`get`].
#[must_use]
pub fn get_mut<'a>(value: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    if path.is_empty() {
        return Some(value);
    }

    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(move |i| items.get_mut(i)),
        _ => None,
    })
}

/// Set `new_value` at `path`, creating intermediate objects as needed.
///
/// Non-object intermediate values are replaced by empty objects.
pub fn set(value: &mut Value, path: &str, new_value: Value) {
    if path.is_empty() {
        *value = new_value;
        return;
    }

    let mut current = value;
    let mut segments = path.split('.').peekable();

    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };

        if segments.peek().is_none() {
            map.insert(segment.to_string(), new_value);
            return;
        }

        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Remove and return the value at `path`.
///
/// Only object members can be removed; array elements are left alone.
pub fn remove(value: &mut Value, path: &str) -> Option<Value> {
    let (parent, leaf) = match path.rsplit_once('.') {
        Some((parent, leaf)) => (get_mut(value, parent)?, leaf),
        None => (value, path),
    };
    match parent {
        Value::Object(map) => map.remove(leaf),
        _ => None,
    }
}

/// Check whether `path` resolves to a value.
#[must_use]
pub fn has(value: &Value, path: &str) -> bool {
    get(value, path).is_some()
}

/// Render a scalar as an identifier string.
///
/// Strings are returned as-is, numbers and booleans via their JSON text.
/// `null`, arrays and objects are not identifiers.
#[must_use]
pub fn as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn get_walks_objects_and_arrays() {
        let doc = json!({ "a": { "b": [ { "c": 1 } ] } });
        assert_eq!(get(&doc, "a.b.0.c"), Some(&json!(1)));
        assert_eq!(get(&doc, "a.x"), None);
        assert_eq!(get(&doc, "a.b.7"), None);
        assert_eq!(get(&doc, ""), Some(&doc));
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut doc = json!({ "a": 1 });
        set(&mut doc, "a.b.c", json!("x"));
        assert_eq!(doc, json!({ "a": { "b": { "c": "x" } } }));
    }

    #[test]
    fn set_overwrites_existing_leaf() {
        let mut doc = json!({ "payload": { "name": "old", "keep": true } });
        set(&mut doc, "payload.name", json!("new"));
        assert_eq!(doc, json!({ "payload": { "name": "new", "keep": true } }));
    }

    #[test]
    fn get_mut_allows_in_place_edit() {
        let mut doc = json!({ "counter": { "value": 1 } });
        if let Some(v) = get_mut(&mut doc, "counter.value") {
            *v = json!(2);
        }
        assert_eq!(doc["counter"]["value"], json!(2));
    }

    #[test]
    fn remove_deletes_object_members() {
        let mut doc = json!({ "a": { "b": 1, "c": 2 }, "d": 3 });
        assert_eq!(remove(&mut doc, "a.b"), Some(json!(1)));
        assert_eq!(remove(&mut doc, "d"), Some(json!(3)));
        assert_eq!(remove(&mut doc, "a.zz"), None);
        assert_eq!(doc, json!({ "a": { "c": 2 } }));
    }

    proptest::proptest! {
        #[test]
        fn set_never_disturbs_sibling_paths(
            segments in proptest::collection::vec("[a-z]{1,6}", 1..5),
            value in 0i64..1000,
        ) {
            let mut doc = json!({ "zzzzzzz": "sibling" });
            let field_path = segments.join(".");
            set(&mut doc, &field_path, json!(value));
            proptest::prop_assert_eq!(get(&doc, &field_path), Some(&json!(value)));
            proptest::prop_assert_eq!(get(&doc, "zzzzzzz"), Some(&json!("sibling")));
        }
    }

    #[test]
    fn as_id_accepts_scalars_only() {
        assert_eq!(as_id(&json!("abc")), Some("abc".to_string()));
        assert_eq!(as_id(&json!(42)), Some("42".to_string()));
        assert_eq!(as_id(&json!(null)), None);
        assert_eq!(as_id(&json!({ "id": 1 })), None);
    }
}
