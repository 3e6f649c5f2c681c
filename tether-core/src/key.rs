//! Canonical cache keys for (function, arguments) pairs.
//!
//! Two argument values that are logically equal always produce the same key,
//! regardless of object key order or how the `Value` was built. Keys are
//! structural (not parsed back from strings); `Display` exists for logs only.

use crate::function::{FunctionName, QueryArgs};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Write};

/// Serialize a JSON value with object keys sorted recursively.
///
/// The writer is explicit so the output does not depend on which map
/// representation `serde_json` was compiled with.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            let _ = write!(out, "{}", n);
        }
        // Display on a string value produces an escaped JSON literal.
        Value::String(_) => {
            let _ = write!(out, "{}", value);
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
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}", Value::String(k.clone()));
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
    }
}

// ============================================================================
// KEY TYPES
// ============================================================================

/// Function name plus canonical argument encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryKey {
    pub function: FunctionName,
    pub args: String,
}

impl QueryKey {
    pub fn new(function: &FunctionName, args: &Value) -> Self {
        Self {
            function: function.clone(),
            args: canonical_json(args),
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.function, self.args)
    }
}

/// One page of a paginated query.
///
/// The generation separates pages loaded before and after a `reset()`, so
/// results for a discarded window never land in the current one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageKey {
    pub base: QueryKey,
    pub generation: u64,
    pub cursor: Option<String>,
    pub num_items: usize,
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#g{}/{}/{}",
            self.base,
            self.generation,
            self.cursor.as_deref().unwrap_or("start"),
            self.num_items
        )
    }
}

/// Identity of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum CacheKey {
    /// Sentinel meaning "do not fetch". Never backed by remote work.
    Skip,
    /// A plain (unpaginated) query.
    Query(QueryKey),
    /// The logical paginated query; overlays for a paginated list target this.
    Paginated(QueryKey),
    /// A single loaded page of a paginated query.
    Page(PageKey),
}

impl CacheKey {
    pub fn query(function: &FunctionName, args: &Value) -> Self {
        CacheKey::Query(QueryKey::new(function, args))
    }

    /// Key for a query call, mapping the skip sentinel to [`CacheKey::Skip`].
    pub fn from_args(function: &FunctionName, args: &QueryArgs) -> Self {
        match args {
            QueryArgs::Skip => CacheKey::Skip,
            QueryArgs::Args(value) => Self::query(function, value),
        }
    }

    pub fn paginated(function: &FunctionName, args: &Value) -> Self {
        CacheKey::Paginated(QueryKey::new(function, args))
    }

    pub fn page(
        base: &QueryKey,
        generation: u64,
        cursor: Option<String>,
        num_items: usize,
    ) -> Self {
        CacheKey::Page(PageKey {
            base: base.clone(),
            generation,
            cursor,
            num_items,
        })
    }

    pub fn is_skip(&self) -> bool {
        matches!(self, CacheKey::Skip)
    }

    pub fn function(&self) -> Option<&FunctionName> {
        match self {
            CacheKey::Skip => None,
            CacheKey::Query(q) | CacheKey::Paginated(q) => Some(&q.function),
            CacheKey::Page(p) => Some(&p.base.function),
        }
    }

    /// The key whose overlays apply to this entry.
    ///
    /// Pages share the overlays of their paginated base so a patch spans the
    /// whole loaded window.
    pub fn overlay_target(&self) -> CacheKey {
        match self {
            CacheKey::Page(p) => CacheKey::Paginated(p.base.clone()),
            other => other.clone(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Skip => f.write_str("skip"),
            CacheKey::Query(q) => write!(f, "{}", q),
            CacheKey::Paginated(q) => write!(f, "paginated({})", q),
            CacheKey::Page(p) => write!(f, "page({})", p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn name(s: &str) -> FunctionName {
        FunctionName::new(s).unwrap()
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let a = json!({ "b": 1, "a": { "z": [1, { "y": 2, "x": 3 }], "c": null } });
        assert_eq!(
            canonical_json(&a),
            r#"{"a":{"c":null,"z":[1,{"x":3,"y":2}]},"b":1}"#
        );
    }

    #[test]
    fn test_canonical_json_escapes_strings() {
        let v = json!({ "q\"uote": "line\nbreak" });
        assert_eq!(canonical_json(&v), r#"{"q\"uote":"line\nbreak"}"#);
    }

    #[test]
    fn test_key_independent_of_construction_order() {
        let mut first = serde_json::Map::new();
        first.insert("channel".into(), json!("general"));
        first.insert("limit".into(), json!(10));
        let mut second = serde_json::Map::new();
        second.insert("limit".into(), json!(10));
        second.insert("channel".into(), json!("general"));

        let f = name("messages:list");
        assert_eq!(
            CacheKey::query(&f, &Value::Object(first)),
            CacheKey::query(&f, &Value::Object(second))
        );
    }

    #[test]
    fn test_skip_is_distinct() {
        let f = name("messages:list");
        assert!(CacheKey::from_args(&f, &QueryArgs::Skip).is_skip());
        assert_ne!(CacheKey::Skip, CacheKey::query(&f, &Value::Null));
        assert_eq!(CacheKey::Skip.function(), None);
    }

    #[test]
    fn test_query_and_paginated_keys_do_not_collide() {
        let f = name("messages:list");
        let args = json!({ "channel": "general" });
        assert_ne!(CacheKey::query(&f, &args), CacheKey::paginated(&f, &args));
    }

    #[test]
    fn test_page_overlay_target_is_paginated_base() {
        let f = name("messages:list");
        let base = QueryKey::new(&f, &json!({}));
        let page = CacheKey::page(&base, 2, Some("c1".into()), 3);
        assert_eq!(page.overlay_target(), CacheKey::Paginated(base.clone()));
        assert_eq!(
            CacheKey::Query(base.clone()).overlay_target(),
            CacheKey::Query(base)
        );
    }

    #[test]
    fn test_key_serde_round_trip() {
        let f = name("messages:list");
        let key = CacheKey::page(&QueryKey::new(&f, &json!({"a": 1})), 0, None, 5);
        let encoded = serde_json::to_string(&key).unwrap();
        let decoded: CacheKey = serde_json::from_str(&encoded).unwrap();
        assert_eq!(key, decoded);
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-z]{0,8}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-e]{1,3}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn canonical_json_round_trips_to_equal_value(value in arb_json()) {
            let text = canonical_json(&value);
            let parsed: Value = serde_json::from_str(&text).unwrap();
            prop_assert_eq!(parsed, value);
        }

        #[test]
        fn key_ignores_object_insertion_order(
            entries in prop::collection::btree_map("[a-z]{1,4}", any::<i32>(), 0..8)
        ) {
            let forward: serde_json::Map<String, Value> =
                entries.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
            let reverse: serde_json::Map<String, Value> =
                entries.iter().rev().map(|(k, v)| (k.clone(), json!(v))).collect();
            let f = FunctionName::new("items:list").unwrap();
            prop_assert_eq!(
                CacheKey::query(&f, &Value::Object(forward)),
                CacheKey::query(&f, &Value::Object(reverse))
            );
        }
    }
}
