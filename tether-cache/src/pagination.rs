//! Cursor-based pagination state machine.
//!
//! ```text
//! LoadingFirstPage --page--> CanLoadMore --load_more--> LoadingMore --page--> CanLoadMore
//!                                                                   \-last--> Exhausted
//! any state --failure--> Error (pages kept)      any state --reset--> LoadingFirstPage
//! ```
//!
//! Each page lives in the query cache under its own page key. The key carries
//! the state's generation, so results for a window discarded by `reset()` are
//! recognized and ignored. Cursors are opaque strings.

use crate::overlay::Patch;
use serde_json::Value;
use std::collections::HashSet;
use tether_core::{
    CacheKey, FunctionCall, ItemIdentity, ItemsTransform, PaginationStatus, QueryKey,
    TetherError, TetherResult, TransportError,
};
use tracing::debug;

/// One page as returned by the backend:
/// `{ "page": [...], "isDone": bool, "continueCursor": string }`.
#[derive(Debug, Clone, PartialEq)]
pub struct PageResult {
    pub items: Vec<Value>,
    pub is_done: bool,
    pub continue_cursor: Option<String>,
}

impl PageResult {
    pub fn from_value(value: &Value) -> TetherResult<Self> {
        let decode = |reason: &str| -> TetherError {
            TransportError::Decode {
                reason: format!("page result: {}", reason),
            }
            .into()
        };
        let items = value
            .get("page")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| decode("missing `page` array"))?;
        let is_done = value
            .get("isDone")
            .and_then(Value::as_bool)
            .ok_or_else(|| decode("missing `isDone` flag"))?;
        let continue_cursor = match value.get("continueCursor") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => return Err(decode("`continueCursor` must be a string")),
        };
        Ok(Self {
            items,
            is_done,
            continue_cursor,
        })
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "page": self.items,
            "isDone": self.is_done,
            "continueCursor": self.continue_cursor,
        })
    }
}

/// A page fetch the driver should issue.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub key: CacheKey,
    pub generation: u64,
    pub cursor: Option<String>,
    /// Pins the end of an already-loaded page when it is re-fetched.
    pub end_cursor: Option<String>,
    pub num_items: usize,
}

impl PageRequest {
    /// The remote call for this page: the caller's arguments plus
    /// `paginationOpts`.
    pub fn call(&self, base: &FunctionCall) -> TetherResult<FunctionCall> {
        base.with_pagination(
            self.num_items,
            self.cursor.as_deref(),
            self.end_cursor.as_deref(),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub key: CacheKey,
    pub items: Vec<Value>,
    pub cursor_in: Option<String>,
    pub cursor_out: Option<String>,
    pub is_last_page: bool,
}

#[derive(Debug, Clone)]
pub struct PaginationState {
    base: QueryKey,
    pages: Vec<Page>,
    status: PaginationStatus,
    generation: u64,
    error: Option<TetherError>,
    loading: Option<PageRequest>,
}

impl PaginationState {
    /// Start a paginated query; returns the first page request.
    pub fn new(base: QueryKey, initial_num_items: usize) -> (Self, PageRequest) {
        let mut state = Self {
            base,
            pages: Vec::new(),
            status: PaginationStatus::LoadingFirstPage,
            generation: 0,
            error: None,
            loading: None,
        };
        let request = state.start_first_page(initial_num_items);
        (state, request)
    }

    fn start_first_page(&mut self, num_items: usize) -> PageRequest {
        let request = PageRequest {
            key: CacheKey::page(&self.base, self.generation, None, num_items),
            generation: self.generation,
            cursor: None,
            end_cursor: None,
            num_items,
        };
        self.loading = Some(request.clone());
        self.status = PaginationStatus::LoadingFirstPage;
        request
    }

    pub fn base(&self) -> &QueryKey {
        &self.base
    }

    pub fn status(&self) -> PaginationStatus {
        self.status
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn error(&self) -> Option<&TetherError> {
        self.error.as_ref()
    }

    /// The request currently loading (or the one that failed).
    pub fn loading(&self) -> Option<&PageRequest> {
        self.loading.as_ref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.pages.last().map(|p| p.is_last_page).unwrap_or(false)
    }

    /// Page keys belonging to the current generation, loaded or loading.
    pub fn active_keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self.pages.iter().map(|p| p.key.clone()).collect();
        if let Some(req) = &self.loading {
            keys.push(req.key.clone());
        }
        keys
    }

    /// Whether `key` is a page of this query's current generation.
    pub fn owns(&self, key: &CacheKey) -> bool {
        matches!(key, CacheKey::Page(page) if page.base == self.base && page.generation == self.generation)
    }

    /// Request the next page. A no-op unless the status is `CanLoadMore`.
    pub fn load_more(&mut self, num_items: usize) -> Option<PageRequest> {
        if self.status != PaginationStatus::CanLoadMore {
            return None;
        }
        let cursor = self.pages.last()?.cursor_out.clone()?;
        let request = PageRequest {
            key: CacheKey::page(&self.base, self.generation, Some(cursor.clone()), num_items),
            generation: self.generation,
            cursor: Some(cursor),
            end_cursor: None,
            num_items,
        };
        self.loading = Some(request.clone());
        self.status = PaginationStatus::LoadingMore;
        Some(request)
    }

    /// Apply a result for one of this query's pages: either the page being
    /// loaded (appended) or an already-loaded page (replaced in place).
    /// Returns `false` for results that do not belong to this generation.
    pub fn apply_page(&mut self, key: &CacheKey, result: PageResult) -> bool {
        if !self.owns(key) {
            debug!(key = %key, generation = self.generation, "ignoring stale page result");
            return false;
        }
        if let Some(page) = self.pages.iter_mut().find(|p| p.key == *key) {
            page.items = result.items;
            page.cursor_out = result.continue_cursor;
            page.is_last_page = result.is_done;
        } else if self.loading.as_ref().map(|r| r.key == *key).unwrap_or(false) {
            let cursor_in = self.loading.take().and_then(|r| r.cursor);
            self.pages.push(Page {
                key: key.clone(),
                items: result.items,
                cursor_in,
                cursor_out: result.continue_cursor,
                is_last_page: result.is_done,
            });
        } else {
            return false;
        }
        self.recompute_status();
        true
    }

    /// Record a failed page fetch. Loaded pages are kept.
    pub fn apply_failure(&mut self, key: &CacheKey, error: TetherError) -> bool {
        if !self.owns(key) {
            return false;
        }
        debug!(key = %key, error = %error, "page fetch failed");
        self.error = Some(error);
        self.status = PaginationStatus::Error;
        true
    }

    /// Re-fetch every loaded page over its current cursor range, plus the
    /// failed request if there is one. Page boundaries do not change.
    pub fn refresh(&mut self) -> Vec<PageRequest> {
        let mut requests: Vec<PageRequest> = self
            .pages
            .iter()
            .map(|page| PageRequest {
                key: page.key.clone(),
                generation: self.generation,
                cursor: page.cursor_in.clone(),
                end_cursor: if page.is_last_page {
                    None
                } else {
                    page.cursor_out.clone()
                },
                num_items: match &page.key {
                    CacheKey::Page(p) => p.num_items,
                    _ => page.items.len(),
                },
            })
            .collect();
        if let Some(req) = &self.loading {
            requests.push(req.clone());
        }
        self.error = None;
        self.recompute_status();
        requests
    }

    /// Discard every page and start over under a new generation.
    pub fn reset(&mut self, initial_num_items: usize) -> PageRequest {
        self.generation += 1;
        self.pages.clear();
        self.error = None;
        self.start_first_page(initial_num_items)
    }

    fn recompute_status(&mut self) {
        self.status = if self.error.is_some() {
            PaginationStatus::Error
        } else if self.loading.is_some() {
            if self.pages.is_empty() {
                PaginationStatus::LoadingFirstPage
            } else {
                PaginationStatus::LoadingMore
            }
        } else if self.is_exhausted() {
            PaginationStatus::Exhausted
        } else if self.pages.is_empty() {
            PaginationStatus::LoadingFirstPage
        } else {
            PaginationStatus::CanLoadMore
        };
    }

    /// The externally visible sequence: overlays applied across the loaded
    /// window, pages merged, then the optional transform.
    pub fn visible(
        &self,
        patches: &[Patch],
        identity: &ItemIdentity,
        transform: Option<&ItemsTransform>,
    ) -> Vec<Value> {
        let mut pages: Vec<Vec<Value>> = self.pages.iter().map(|p| p.items.clone()).collect();
        let exhausted = self.is_exhausted();
        for patch in patches {
            patch.apply_to_pages(&mut pages, exhausted);
        }
        let merged = merge_pages(pages, identity);
        match transform {
            Some(transform) => transform.apply(merged),
            None => merged,
        }
    }
}

/// Concatenate pages in load order. When an identity appears more than once
/// the later occurrence wins, at its own position.
pub fn merge_pages(pages: Vec<Vec<Value>>, identity: &ItemIdentity) -> Vec<Value> {
    let all: Vec<Value> = pages.into_iter().flatten().collect();
    let mut seen: HashSet<String> = HashSet::new();
    let mut kept: Vec<Value> = Vec::with_capacity(all.len());
    for item in all.into_iter().rev() {
        match identity.identify(&item) {
            Some(id) => {
                if seen.insert(id) {
                    kept.push(item);
                }
            }
            None => kept.push(item),
        }
    }
    kept.reverse();
    kept
}
