//! Query descriptors and canonical cache-key derivation.
//!
//! A [`QueryDescriptor`] identifies one unit of reactive data: a stable
//! query name plus a JSON arguments value. Two descriptors are equivalent
//! iff their names match and their arguments are deeply equal irrespective
//! of key order, so every comparison and cache key goes through
//! [`canonicalize`] first.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifies one unit of reactive data: a query name plus arguments.
///
/// Equality is canonical: argument objects built in different key
/// insertion orders compare equal and produce byte-identical cache keys.
///
/// # Examples
///
/// ```
/// use livequery::QueryDescriptor;
/// use serde_json::json;
///
/// let d = QueryDescriptor::new("events.list", json!({ "status": "on_sale" }));
/// assert_eq!(
///     d.cache_key("query"),
///     r#"query:events.list:{"status":"on_sale"}"#
/// );
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryDescriptor {
    name: String,
    args: Value,
}

impl QueryDescriptor {
    /// Build a descriptor from a query name and a JSON arguments value.
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// The stable query name (e.g. `"events.list"`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The arguments value exactly as supplied.
    pub fn args(&self) -> &Value {
        &self.args
    }

    /// Replace the arguments value in place.
    ///
    /// Used by the engine when a consumer changes arguments; the caller is
    /// responsible for re-subscribing afterwards.
    pub(crate) fn set_args(&mut self, args: Value) {
        self.args = args;
    }

    /// The arguments with all object keys recursively sorted.
    pub fn canonical_args(&self) -> Value {
        canonicalize(&self.args)
    }

    /// Derive the canonical cache key: `"<prefix>:<name>:<canonical-json>"`.
    ///
    /// Byte-for-byte identical for deeply-equal arguments regardless of
    /// how the argument object was constructed.
    pub fn cache_key(&self, prefix: &str) -> String {
        format!("{prefix}:{}:{}", self.name, self.canonical_args())
    }
}

impl PartialEq for QueryDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.canonical_args() == other.canonical_args()
    }
}

impl Eq for QueryDescriptor {}

/// Recursively sort object keys; recurse into arrays element-wise;
/// leave primitives untouched.
///
/// Keys are inserted in sorted order, which keeps the serialized output
/// stable even when `serde_json` is built with the `preserve_order`
/// feature (where `Map` remembers insertion order instead of sorting).
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        primitive => primitive.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Build a JSON object with keys in the exact order given, bypassing
    /// any sorting the `json!` macro's map type might apply.
    fn object_in_order(pairs: &[(&str, Value)]) -> Value {
        let mut map = serde_json::Map::new();
        for (key, value) in pairs {
            map.insert((*key).to_string(), value.clone());
        }
        Value::Object(map)
    }

    #[test]
    fn canonical_key_identical_across_insertion_orders() {
        let a = object_in_order(&[
            ("status", json!("on_sale")),
            ("limit", json!(10)),
            ("venue", object_in_order(&[("city", json!("Oslo")), ("id", json!(7))])),
        ]);
        let b = object_in_order(&[
            ("venue", object_in_order(&[("id", json!(7)), ("city", json!("Oslo"))])),
            ("limit", json!(10)),
            ("status", json!("on_sale")),
        ]);

        let key_a = QueryDescriptor::new("events.list", a).cache_key("query");
        let key_b = QueryDescriptor::new("events.list", b).cache_key("query");
        assert_eq!(key_a, key_b);
    }

    #[test]
    fn canonicalize_recurses_into_arrays() {
        let value = json!([
            { "b": 2, "a": 1 },
            { "d": 4, "c": 3 }
        ]);
        let canonical = canonicalize(&value);
        assert_eq!(
            canonical.to_string(),
            r#"[{"a":1,"b":2},{"c":3,"d":4}]"#
        );
    }

    #[test]
    fn canonicalize_leaves_primitives_untouched() {
        for value in [json!(null), json!(true), json!(42), json!("text")] {
            assert_eq!(canonicalize(&value), value);
        }
    }

    #[test]
    fn descriptors_equal_irrespective_of_key_order() {
        let a = QueryDescriptor::new(
            "events.list",
            object_in_order(&[("x", json!(1)), ("y", json!(2))]),
        );
        let b = QueryDescriptor::new(
            "events.list",
            object_in_order(&[("y", json!(2)), ("x", json!(1))]),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn descriptors_with_different_names_differ() {
        let a = QueryDescriptor::new("events.list", json!({}));
        let b = QueryDescriptor::new("events.get", json!({}));
        assert_ne!(a, b);
    }

    #[test]
    fn descriptors_with_different_args_differ() {
        let a = QueryDescriptor::new("events.list", json!({ "eventId": "A" }));
        let b = QueryDescriptor::new("events.list", json!({ "eventId": "B" }));
        assert_ne!(a, b);
    }

    #[test]
    fn cache_key_format() {
        let d = QueryDescriptor::new("events.list", json!({ "status": "on_sale" }));
        assert_eq!(
            d.cache_key("query"),
            r#"query:events.list:{"status":"on_sale"}"#
        );
    }
}
