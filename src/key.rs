//! Query Key Module
//!
//! Structured, JSON-serializable keys identifying cache entries. Two keys
//! are equal iff their canonical serialization is equal; the canonical form
//! (`KeyHash`) is what the cache actually indexes by. Keys also support
//! hierarchical matching: `["todos"]` prefix-matches `["todos", 1]`, which
//! underlies bulk invalidation and removal by partial key.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// == Query Key ==
/// Ordered, arbitrarily-nested identifier for a logical resource.
///
/// Built from a list of JSON values, most conveniently via the
/// [`query_key!`](crate::query_key) macro:
///
/// ```
/// use requery::query_key;
///
/// let key = query_key!["user", 1, { "filter": "active" }];
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<Value>);

impl QueryKey {
    /// Creates a key from its ordered elements.
    pub fn new(parts: Vec<Value>) -> Self {
        Self(parts)
    }

    /// The key's elements, in order.
    pub fn parts(&self) -> &[Value] {
        &self.0
    }

    /// Number of elements in the key.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true for the empty key.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    // == Hashing ==
    /// Computes the canonical serialization used as the cache map key.
    ///
    /// Object keys are sorted, so two keys that differ only in object member
    /// order hash identically.
    pub fn hash(&self) -> KeyHash {
        let mut out = String::from("[");
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            write_canonical(part, &mut out);
        }
        out.push(']');
        KeyHash(out)
    }

    // == Hierarchical Matching ==
    /// Returns true if `self`'s elements are a canonicalized prefix of
    /// `other`'s, i.e. `other` is a descendant match of `self`.
    pub fn is_prefix_of(&self, other: &QueryKey) -> bool {
        if self.0.len() > other.0.len() {
            return false;
        }
        self.0
            .iter()
            .zip(other.0.iter())
            .all(|(a, b)| canonical_eq(a, b))
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(parts: Vec<Value>) -> Self {
        Self(parts)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hash().as_str())
    }
}

// == Key Hash ==
/// Canonical serialization of a [`QueryKey`]; the actual map key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyHash(String);

impl KeyHash {
    /// The canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// == Canonical Serialization ==
/// Writes a JSON value with object keys sorted, independent of any
/// preserve-order feature on the underlying map type.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by_key(|(k, _)| *k);
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // String keys serialize infallibly
                out.push_str(&serde_json::to_string(k).expect("string key serializes"));
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => {
            out.push_str(&serde_json::to_string(scalar).expect("scalar serializes"));
        }
    }
}

/// Equality under canonical serialization (object member order ignored).
fn canonical_eq(a: &Value, b: &Value) -> bool {
    let mut sa = String::new();
    let mut sb = String::new();
    write_canonical(a, &mut sa);
    write_canonical(b, &mut sb);
    sa == sb
}

// == Key Macro ==
/// Builds a [`QueryKey`] from a comma-separated list of JSON-like elements.
#[macro_export]
macro_rules! query_key {
    [$($part:tt),* $(,)?] => {
        $crate::key::QueryKey::new(vec![$($crate::__private::serde_json::json!($part)),*])
    };
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_equal_keys_hash_equal() {
        let a = QueryKey::new(vec![json!("user"), json!(1)]);
        let b = QueryKey::new(vec![json!("user"), json!(1)]);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_different_keys_hash_differently() {
        let a = QueryKey::new(vec![json!("user"), json!(1)]);
        let b = QueryKey::new(vec![json!("user"), json!(2)]);
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_object_member_order_is_irrelevant() {
        let a = QueryKey::new(vec![json!({"page": 1, "size": 20})]);
        let b = QueryKey::new(vec![json!({"size": 20, "page": 1})]);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_nested_object_member_order_is_irrelevant() {
        let a = QueryKey::new(vec![json!({"f": {"a": 1, "b": [2, {"x": 1, "y": 2}]}})]);
        let b = QueryKey::new(vec![json!({"f": {"b": [2, {"y": 2, "x": 1}], "a": 1}})]);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_prefix_matching() {
        let parent = query_key!["todos"];
        let child = query_key!["todos", 1];
        let sibling = query_key!["users", 1];

        assert!(parent.is_prefix_of(&child));
        assert!(parent.is_prefix_of(&parent));
        assert!(!child.is_prefix_of(&parent));
        assert!(!parent.is_prefix_of(&sibling));
    }

    #[test]
    fn test_prefix_matching_ignores_object_order() {
        let parent = query_key!["todos", { "a": 1, "b": 2 }];
        let child = query_key!["todos", { "b": 2, "a": 1 }, "extra"];
        assert!(parent.is_prefix_of(&child));
    }

    #[test]
    fn test_empty_key_is_prefix_of_everything() {
        let empty = QueryKey::new(vec![]);
        let key = query_key!["anything"];
        assert!(empty.is_prefix_of(&key));
        assert!(empty.is_empty());
    }

    #[test]
    fn test_macro_builds_structured_key() {
        let key = query_key!["user", 42, { "active": true }];
        assert_eq!(key.len(), 3);
        assert_eq!(key.parts()[0], json!("user"));
        assert_eq!(key.parts()[1], json!(42));
    }

    // == Property Tests ==

    fn arb_json_leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::from),
            any::<i32>().prop_map(Value::from),
            "[a-z]{0,8}".prop_map(Value::from),
        ]
    }

    fn arb_json_value() -> impl Strategy<Value = Value> {
        arb_json_leaf().prop_recursive(3, 16, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,4}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        // Hash equality must be exactly canonical-serialization equality.
        #[test]
        fn prop_hash_is_deterministic(parts in prop::collection::vec(arb_json_value(), 0..4)) {
            let a = QueryKey::new(parts.clone());
            let b = QueryKey::new(parts);
            prop_assert_eq!(a.hash(), b.hash());
        }

        // A key always prefix-matches any extension of itself.
        #[test]
        fn prop_key_prefixes_its_extensions(
            parts in prop::collection::vec(arb_json_value(), 0..4),
            extra in prop::collection::vec(arb_json_value(), 0..3),
        ) {
            let base = QueryKey::new(parts.clone());
            let mut extended = parts;
            extended.extend(extra);
            let extended = QueryKey::new(extended);
            prop_assert!(base.is_prefix_of(&extended));
        }
    }
}
