//! Optimistic overlay algebra.
//!
//! An overlay is a list of [`Patch`]es recorded against target keys. Patches
//! are data: they never touch the authoritative entry and are folded over it,
//! in installation order, every time a visible value is computed. Removing an
//! overlay therefore restores exactly the authoritative state.

use crate::cache::QueryCache;
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use tether_core::{canonical_json, CacheKey, OverlayId, ServerVersion, SortOrder};

pub type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
pub type Updater = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
pub type SortKey = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// One speculative edit.
#[derive(Clone)]
pub enum Patch {
    /// Replace an unpaginated value outright.
    Replace(Value),
    /// Prepend to the first page (or the list).
    InsertAtTop(Value),
    /// Insert before the first item that sorts after it.
    InsertAtPosition {
        item: Value,
        order: SortOrder,
        sort_key: SortKey,
    },
    /// Append, but only once the list is fully loaded.
    InsertAtBottomIfLoaded(Value),
    DeleteWhere(Predicate),
    UpdateWhere {
        predicate: Predicate,
        updater: Updater,
    },
}

impl fmt::Debug for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Patch::Replace(v) => f.debug_tuple("Replace").field(v).finish(),
            Patch::InsertAtTop(v) => f.debug_tuple("InsertAtTop").field(v).finish(),
            Patch::InsertAtPosition { item, order, .. } => f
                .debug_struct("InsertAtPosition")
                .field("item", item)
                .field("order", order)
                .finish_non_exhaustive(),
            Patch::InsertAtBottomIfLoaded(v) => {
                f.debug_tuple("InsertAtBottomIfLoaded").field(v).finish()
            }
            Patch::DeleteWhere(_) => f.write_str("DeleteWhere(..)"),
            Patch::UpdateWhere { .. } => f.write_str("UpdateWhere(..)"),
        }
    }
}

impl Patch {
    /// Apply to an unpaginated value.
    ///
    /// List edits apply to array values; a plain list counts as fully loaded.
    /// `UpdateWhere` also applies to a single non-array value it matches.
    pub fn apply_to_value(&self, base: Option<Value>) -> Option<Value> {
        match (self, base) {
            (Patch::Replace(v), _) => Some(v.clone()),
            (_, Some(Value::Array(items))) => {
                let mut pages = vec![items];
                self.apply_to_pages(&mut pages, true);
                pages.pop().map(Value::Array)
            }
            (Patch::UpdateWhere { predicate, updater }, Some(value)) if predicate(&value) => {
                Some(updater(&value))
            }
            (_, other) => other,
        }
    }

    /// Apply across the loaded pages of a paginated list.
    ///
    /// With no pages loaded there is nothing to anchor an edit to, so every
    /// patch is a no-op until the first page arrives.
    pub fn apply_to_pages(&self, pages: &mut Vec<Vec<Value>>, exhausted: bool) {
        if pages.is_empty() {
            return;
        }
        match self {
            Patch::Replace(_) => {}
            Patch::InsertAtTop(item) => pages[0].insert(0, item.clone()),
            Patch::InsertAtBottomIfLoaded(item) => {
                if exhausted {
                    if let Some(last) = pages.last_mut() {
                        last.push(item.clone());
                    }
                }
            }
            Patch::InsertAtPosition {
                item,
                order,
                sort_key,
            } => {
                let key = sort_key(item);
                let goes_before = |existing: &Value| {
                    let cmp = compare_json(&key, &sort_key(existing));
                    match order {
                        SortOrder::Asc => cmp == Ordering::Less,
                        SortOrder::Desc => cmp == Ordering::Greater,
                    }
                };
                for page in pages.iter_mut() {
                    if let Some(idx) = page.iter().position(&goes_before) {
                        page.insert(idx, item.clone());
                        return;
                    }
                }
                // Sorts after everything loaded: only safe to show at the end
                // when nothing further can be loaded.
                if exhausted {
                    if let Some(last) = pages.last_mut() {
                        last.push(item.clone());
                    }
                }
            }
            Patch::DeleteWhere(predicate) => {
                for page in pages.iter_mut() {
                    page.retain(|item| !predicate(item));
                }
            }
            Patch::UpdateWhere { predicate, updater } => {
                for page in pages.iter_mut() {
                    for item in page.iter_mut() {
                        if predicate(item) {
                            *item = updater(item);
                        }
                    }
                }
            }
        }
    }
}

/// Total order over JSON values: null < bool < number < string < array < object.
pub fn compare_json(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            match (x.as_i64(), y.as_i64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => {
                    let x = x.as_f64().unwrap_or(f64::NAN);
                    let y = y.as_f64().unwrap_or(f64::NAN);
                    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
                }
            }
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y.iter()) {
                let cmp = compare_json(l, r);
                if cmp != Ordering::Equal {
                    return cmp;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(_), Value::Object(_)) => canonical_json(a).cmp(&canonical_json(b)),
        _ => rank(a).cmp(&rank(b)),
    }
}

// ============================================================================
// INSTALLED OVERLAYS
// ============================================================================

/// Where an installed overlay is in its lifecycle for one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayPhase {
    /// Mutation in flight. Authoritative updates to the target are held back
    /// while any layer is pending.
    Pending,
    /// Mutation confirmed at `version`, when the backend reported one, while
    /// the target stood at sequence `after`. Retired once the target's
    /// watermark confirms it.
    Settling {
        after: u64,
        version: Option<ServerVersion>,
    },
}

/// The patches one overlay contributes to one target.
#[derive(Debug, Clone)]
pub struct OverlayLayer {
    pub id: OverlayId,
    pub patches: Vec<Patch>,
    pub phase: OverlayPhase,
    /// Target watermark sequence when the layer was installed.
    pub installed_at: u64,
}

// ============================================================================
// OVERLAY API
// ============================================================================

/// Staging area handed to an optimistic update callback.
///
/// Edits are recorded, not applied: the mutation driver installs them as one
/// overlay before the remote call starts. Reads see the cache's current
/// visible state plus the edits staged so far.
pub struct OverlayApi<'a> {
    cache: &'a QueryCache,
    staged: Vec<(CacheKey, Patch)>,
}

impl<'a> OverlayApi<'a> {
    pub fn new(cache: &'a QueryCache) -> Self {
        Self {
            cache,
            staged: Vec::new(),
        }
    }

    fn stage(&mut self, target: &CacheKey, patch: Patch) {
        if target.is_skip() {
            return;
        }
        self.staged.push((target.overlay_target(), patch));
    }

    /// Current visible value of an unpaginated query, including staged edits.
    ///
    /// Paginated targets have no single value and return `None`.
    pub fn get_query(&self, target: &CacheKey) -> Option<Value> {
        match target {
            CacheKey::Query(_) => {
                let target = target.overlay_target();
                self.staged
                    .iter()
                    .filter(|(key, _)| *key == target)
                    .fold(self.cache.visible(&target), |acc, (_, patch)| {
                        patch.apply_to_value(acc)
                    })
            }
            _ => None,
        }
    }

    pub fn set_query(&mut self, target: &CacheKey, value: Value) {
        self.stage(target, Patch::Replace(value));
    }

    pub fn insert_at_top(&mut self, target: &CacheKey, item: Value) {
        self.stage(target, Patch::InsertAtTop(item));
    }

    pub fn insert_at_position(
        &mut self,
        target: &CacheKey,
        item: Value,
        order: SortOrder,
        sort_key: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) {
        self.stage(
            target,
            Patch::InsertAtPosition {
                item,
                order,
                sort_key: Arc::new(sort_key),
            },
        );
    }

    pub fn insert_at_bottom_if_loaded(&mut self, target: &CacheKey, item: Value) {
        self.stage(target, Patch::InsertAtBottomIfLoaded(item));
    }

    pub fn delete_where(
        &mut self,
        target: &CacheKey,
        predicate: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) {
        self.stage(target, Patch::DeleteWhere(Arc::new(predicate)));
    }

    pub fn update_where(
        &mut self,
        target: &CacheKey,
        predicate: impl Fn(&Value) -> bool + Send + Sync + 'static,
        updater: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) {
        self.stage(
            target,
            Patch::UpdateWhere {
                predicate: Arc::new(predicate),
                updater: Arc::new(updater),
            },
        );
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    pub fn into_patches(self) -> Vec<(CacheKey, Patch)> {
        self.staged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn by_id(id: &'static str) -> Predicate {
        Arc::new(move |v: &Value| v["id"] == json!(id))
    }

    fn ts_key() -> SortKey {
        Arc::new(|v: &Value| v["ts"].clone())
    }

    #[test]
    fn test_insert_at_top_on_first_page() {
        let mut pages = vec![vec![json!({"id": "a"})], vec![json!({"id": "b"})]];
        Patch::InsertAtTop(json!({"id": "tmp"})).apply_to_pages(&mut pages, false);
        assert_eq!(pages[0][0], json!({"id": "tmp"}));
        assert_eq!(pages[1].len(), 1);
    }

    #[test]
    fn test_no_pages_is_noop() {
        let mut pages: Vec<Vec<Value>> = Vec::new();
        Patch::InsertAtTop(json!(1)).apply_to_pages(&mut pages, true);
        assert!(pages.is_empty());
    }

    #[test]
    fn test_insert_at_bottom_gated_on_exhaustion() {
        let patch = Patch::InsertAtBottomIfLoaded(json!({"id": "z"}));
        let mut pages = vec![vec![json!({"id": "a"})]];
        patch.apply_to_pages(&mut pages, false);
        assert_eq!(pages[0].len(), 1);

        patch.apply_to_pages(&mut pages, true);
        assert_eq!(pages[0].last(), Some(&json!({"id": "z"})));
    }

    #[test]
    fn test_insert_at_position_ascending() {
        let patch = Patch::InsertAtPosition {
            item: json!({"id": "x", "ts": 15}),
            order: SortOrder::Asc,
            sort_key: ts_key(),
        };
        let mut pages = vec![
            vec![json!({"id": "a", "ts": 10})],
            vec![json!({"id": "b", "ts": 20}), json!({"id": "c", "ts": 30})],
        ];
        patch.apply_to_pages(&mut pages, false);
        assert_eq!(pages[1][0]["id"], json!("x"));
        assert_eq!(pages[0].len(), 1);
    }

    #[test]
    fn test_insert_at_position_descending_past_loaded_window() {
        let patch = Patch::InsertAtPosition {
            item: json!({"id": "old", "ts": 1}),
            order: SortOrder::Desc,
            sort_key: ts_key(),
        };
        let mut pages = vec![vec![json!({"id": "a", "ts": 30}), json!({"id": "b", "ts": 20})]];
        patch.apply_to_pages(&mut pages, false);
        assert_eq!(pages[0].len(), 2);
        patch.apply_to_pages(&mut pages, true);
        assert_eq!(pages[0][2]["id"], json!("old"));
    }

    #[test]
    fn test_insert_at_position_equal_keys_go_after() {
        let patch = Patch::InsertAtPosition {
            item: json!({"id": "x", "ts": 10}),
            order: SortOrder::Asc,
            sort_key: ts_key(),
        };
        let value = patch.apply_to_value(Some(json!([
            {"id": "a", "ts": 10},
            {"id": "b", "ts": 11}
        ])));
        assert_eq!(value.unwrap()[1]["id"], json!("x"));
    }

    #[test]
    fn test_delete_and_update_where() {
        let base = Some(json!([{"id": "a", "n": 1}, {"id": "b", "n": 2}]));
        let deleted = Patch::DeleteWhere(by_id("a")).apply_to_value(base.clone());
        assert_eq!(deleted, Some(json!([{"id": "b", "n": 2}])));

        let updated = Patch::UpdateWhere {
            predicate: by_id("b"),
            updater: Arc::new(|v: &Value| {
                let mut v = v.clone();
                v["n"] = json!(20);
                v
            }),
        }
        .apply_to_value(base);
        assert_eq!(updated.unwrap()[1]["n"], json!(20));
    }

    #[test]
    fn test_update_where_on_single_document() {
        let patch = Patch::UpdateWhere {
            predicate: by_id("doc"),
            updater: Arc::new(|_: &Value| json!({"id": "doc", "title": "new"})),
        };
        let out = patch.apply_to_value(Some(json!({"id": "doc", "title": "old"})));
        assert_eq!(out.unwrap()["title"], json!("new"));
    }

    #[test]
    fn test_replace_and_missing_value() {
        assert_eq!(Patch::Replace(json!(3)).apply_to_value(None), Some(json!(3)));
        assert_eq!(Patch::InsertAtTop(json!(1)).apply_to_value(None), None);
    }

    #[test]
    fn test_compare_json_total_order() {
        assert_eq!(compare_json(&json!(null), &json!(false)), Ordering::Less);
        assert_eq!(compare_json(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(compare_json(&json!(2.5), &json!(2)), Ordering::Greater);
        assert_eq!(compare_json(&json!("b"), &json!("a")), Ordering::Greater);
        assert_eq!(compare_json(&json!([1, 2]), &json!([1, 2, 0])), Ordering::Less);
        assert_eq!(compare_json(&json!(99), &json!("1")), Ordering::Less);
    }

    proptest! {
        #[test]
        fn insert_then_delete_composes_in_order(
            items in prop::collection::vec(0i64..50, 0..12),
            doomed in 0i64..50,
        ) {
            let base = json!(items.iter().map(|n| json!({"id": n})).collect::<Vec<_>>());
            let patches = vec![
                Patch::InsertAtTop(json!({"id": -1})),
                Patch::DeleteWhere(Arc::new(move |v: &Value| v["id"] == json!(doomed))),
            ];
            let out = patches
                .iter()
                .fold(Some(base), |acc, p| p.apply_to_value(acc))
                .unwrap();
            let out = out.as_array().unwrap();
            let removed = items.iter().filter(|n| **n == doomed).count();
            prop_assert_eq!(out.len(), items.len() + 1 - removed);
            prop_assert_eq!(&out[0], &json!({"id": -1}));
            prop_assert!(out.iter().all(|v| v["id"] != json!(doomed)));
        }
    }
}
