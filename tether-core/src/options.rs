//! Per-call options for queries and paginated queries.

use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Pure transform applied to a query's visible value.
#[derive(Clone)]
pub struct ValueTransform(Arc<dyn Fn(Value) -> Value + Send + Sync>);

impl ValueTransform {
    pub fn new(f: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn apply(&self, value: Value) -> Value {
        (self.0)(value)
    }
}

impl fmt::Debug for ValueTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ValueTransform(..)")
    }
}

/// Pure transform applied to the merged item sequence of a paginated query.
#[derive(Clone)]
pub struct ItemsTransform(Arc<dyn Fn(Vec<Value>) -> Vec<Value> + Send + Sync>);

impl ItemsTransform {
    pub fn new(f: impl Fn(Vec<Value>) -> Vec<Value> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn apply(&self, items: Vec<Value>) -> Vec<Value> {
        (self.0)(items)
    }
}

impl fmt::Debug for ItemsTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ItemsTransform(..)")
    }
}

/// Extracts the identity used to de-duplicate items across pages.
///
/// Items without an identity are never considered duplicates.
#[derive(Clone)]
pub struct ItemIdentity(Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>);

impl ItemIdentity {
    pub fn new(f: impl Fn(&Value) -> Option<String> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Identity read from a top-level field. Strings are used as-is, other
    /// scalars by their JSON text.
    pub fn by_field(field: impl Into<String>) -> Self {
        let field = field.into();
        Self::new(move |item| match item.get(&field)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        })
    }

    pub fn identify(&self, item: &Value) -> Option<String> {
        (self.0)(item)
    }
}

impl Default for ItemIdentity {
    fn default() -> Self {
        Self::by_field("_id")
    }
}

impl fmt::Debug for ItemIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ItemIdentity(..)")
    }
}

// ============================================================================
// QUERY OPTIONS
// ============================================================================

/// Options recognized by `Client::query`.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Participate in server rendering and hydration.
    pub server: bool,
    /// Return immediately instead of waiting for the first result.
    pub lazy: bool,
    /// Skip the identity cache entirely.
    pub public: bool,
    pub transform: Option<ValueTransform>,
    /// Promote lifecycle logging from debug to info.
    pub verbose: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            server: true,
            lazy: false,
            public: false,
            transform: None,
            verbose: false,
        }
    }
}

impl QueryOptions {
    pub fn with_server(mut self, server: bool) -> Self {
        self.server = server;
        self
    }

    pub fn with_lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    pub fn with_public(mut self, public: bool) -> Self {
        self.public = public;
        self
    }

    pub fn with_transform(mut self, f: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        self.transform = Some(ValueTransform::new(f));
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// Options recognized by `Client::paginated_query`.
#[derive(Debug, Clone)]
pub struct PaginatedQueryOptions {
    /// Size of the first page. Falls back to the client's pagination default.
    pub initial_num_items: Option<usize>,
    pub transform: Option<ItemsTransform>,
    pub identity: ItemIdentity,
    pub public: bool,
    pub lazy: bool,
    pub verbose: bool,
}

impl Default for PaginatedQueryOptions {
    fn default() -> Self {
        Self {
            initial_num_items: None,
            transform: None,
            identity: ItemIdentity::default(),
            public: false,
            lazy: false,
            verbose: false,
        }
    }
}

impl PaginatedQueryOptions {
    pub fn with_initial_num_items(mut self, n: usize) -> Self {
        self.initial_num_items = Some(n);
        self
    }

    pub fn with_transform(
        mut self,
        f: impl Fn(Vec<Value>) -> Vec<Value> + Send + Sync + 'static,
    ) -> Self {
        self.transform = Some(ItemsTransform::new(f));
        self
    }

    pub fn with_identity(mut self, identity: ItemIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_public(mut self, public: bool) -> Self {
        self.public = public;
        self
    }

    pub fn with_lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_options_defaults() {
        let opts = QueryOptions::default();
        assert!(opts.server);
        assert!(!opts.lazy);
        assert!(!opts.public);
        assert!(!opts.verbose);
        assert!(opts.transform.is_none());
    }

    #[test]
    fn test_identity_by_field() {
        let id = ItemIdentity::default();
        assert_eq!(id.identify(&json!({ "_id": "m1" })), Some("m1".to_string()));
        assert_eq!(id.identify(&json!({ "_id": 7 })), Some("7".to_string()));
        assert_eq!(id.identify(&json!({ "_id": null })), None);
        assert_eq!(id.identify(&json!({ "name": "x" })), None);
        assert_eq!(
            ItemIdentity::by_field("id").identify(&json!({ "id": "tmp" })),
            Some("tmp".to_string())
        );
    }

    #[test]
    fn test_transforms_apply() {
        let opts = QueryOptions::default().with_transform(|v| json!({ "wrapped": v }));
        let out = opts.transform.as_ref().map(|t| t.apply(json!(1)));
        assert_eq!(out, Some(json!({ "wrapped": 1 })));

        let paged = PaginatedQueryOptions::default()
            .with_transform(|mut items| {
                items.reverse();
                items
            })
            .with_initial_num_items(3);
        assert_eq!(paged.initial_num_items, Some(3));
        let items = paged.transform.as_ref().map(|t| t.apply(vec![json!(1), json!(2)]));
        assert_eq!(items, Some(vec![json!(2), json!(1)]));
    }
}
