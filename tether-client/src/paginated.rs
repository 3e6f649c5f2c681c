//! Paginated query driver.
//!
//! Owns a [`PaginationState`] and keeps one cache entry (and, interactively,
//! one live channel) per loaded page. Page results reach the state through a
//! change listener on the paginated base key, which also receives overlay
//! changes for the list.
//!
//! The state lock is never held while calling into the cache: cache
//! mutations notify listeners synchronously, and the listener takes the
//! same lock.

use crate::client::{lock, ChannelSlot, Client};
use futures_util::future::join_all;
use serde_json::Value;
use std::sync::{Arc, Mutex, Weak};
use tether_cache::{
    CacheEvent, ChangeSubscription, EntrySnapshot, Page, PageRequest, PageResult,
    PaginationState, QueryCache,
};
use tether_core::{
    CacheKey, FunctionCall, FunctionName, PaginatedQueryOptions, PaginationStatus, QueryKey,
    QueryStatus, TetherError, TetherResult,
};
use tokio::sync::watch;
use tracing::warn;

struct PageAttachment {
    cache: QueryCache,
    slot: Arc<ChannelSlot>,
    /// Set by a reset; the page key belongs to a dead generation.
    superseded: bool,
}

impl PageAttachment {
    fn supersede(mut self) {
        self.superseded = true;
    }
}

impl Drop for PageAttachment {
    fn drop(&mut self) {
        if self.superseded {
            self.slot.close();
            self.cache.discard(self.slot.key());
        } else {
            self.cache.release(self.slot.key());
        }
    }
}

struct Shared {
    client: Client,
    base_call: FunctionCall,
    base: CacheKey,
    options: PaginatedQueryOptions,
    initial_num_items: usize,
    state: Mutex<PaginationState>,
    attachments: Mutex<Vec<PageAttachment>>,
    version: watch::Sender<u64>,
}

impl Shared {
    fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn on_event(&self, event: &CacheEvent) {
        if let CacheEvent::Entry(snapshot) = event {
            if matches!(snapshot.key(), CacheKey::Page(_)) {
                self.absorb(snapshot);
            }
        }
        self.bump();
    }

    /// Fold a page entry's settled state into the pagination state.
    fn absorb(&self, snapshot: &EntrySnapshot) -> bool {
        let key = snapshot.key();
        match snapshot.status() {
            QueryStatus::Success => match snapshot.authoritative().map(PageResult::from_value) {
                Some(Ok(page)) => lock(&self.state).apply_page(key, page),
                Some(Err(err)) => lock(&self.state).apply_failure(key, err),
                None => false,
            },
            QueryStatus::Error => match snapshot.error() {
                Some(err) => lock(&self.state).apply_failure(key, err.clone()),
                None => false,
            },
            _ => false,
        }
    }

    fn sync_page(&self, key: &CacheKey) {
        if let Some(snapshot) = self.client.cache().snapshot(key) {
            if self.absorb(&snapshot) {
                self.bump();
            }
        }
    }

    fn slot_for(&self, key: &CacheKey) -> Option<Arc<ChannelSlot>> {
        lock(&self.attachments)
            .iter()
            .find(|a| a.slot.key() == key)
            .map(|a| a.slot.clone())
    }

    async fn start_page(&self, request: PageRequest) {
        let call = match request.call(&self.base_call) {
            Ok(call) => call,
            Err(err) => {
                lock(&self.state).apply_failure(&request.key, err);
                self.bump();
                return;
            }
        };
        let key = request.key.clone();
        let cache = self.client.cache().clone();
        cache.retain(&key);
        let slot = ChannelSlot::new(key.clone(), call.clone(), self.options.public);
        lock(&self.attachments).push(PageAttachment {
            cache: cache.clone(),
            slot: slot.clone(),
            superseded: false,
        });
        let existing = cache.get_or_create(&key);
        lifecycle!(self.options.verbose, key = %key, generation = request.generation, "loading page");

        if self.client.is_server() {
            if !existing.status().is_settled() {
                let _ = self
                    .client
                    .fetch_and_record(&key, call, self.options.public)
                    .await;
            } else {
                self.client.record(&key, &existing);
            }
        } else if let Err(err) = self.client.hydrate_or_open(&slot, &existing).await {
            warn!(key = %key, error = %err, "page not attached");
        }
        self.sync_page(&key);
    }

    async fn refetch(&self, request: PageRequest) -> TetherResult<()> {
        let call = request.call(&self.base_call)?;
        let result = self
            .client
            .fetch_and_record(&request.key, call, self.options.public)
            .await;
        if !self.client.is_server() {
            if let Some(slot) = self.slot_for(&request.key) {
                if slot.is_open() {
                    self.client.multiplexer().revive(&request.key);
                } else {
                    let _ = self.client.open_channel(&slot).await;
                }
            }
        }
        self.sync_page(&request.key);
        result.map(|_| ())
    }
}

/// Live handle on a cursor-paginated list.
pub struct PaginatedQuery {
    shared: Arc<Shared>,
    changes: watch::Receiver<u64>,
    _listener: ChangeSubscription,
}

impl std::fmt::Debug for PaginatedQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaginatedQuery")
            .field("key", &self.shared.base)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl PaginatedQuery {
    pub(crate) async fn open(
        client: Client,
        function: FunctionName,
        args: Value,
        options: PaginatedQueryOptions,
    ) -> TetherResult<Self> {
        let base_query = QueryKey::new(&function, &args);
        let base = CacheKey::Paginated(base_query.clone());
        let initial_num_items = options
            .initial_num_items
            .unwrap_or(client.config().pagination.default_initial_num_items);
        let (state, first) = PaginationState::new(base_query, initial_num_items);
        let (version, changes) = watch::channel(0u64);
        let lazy = options.lazy;
        let shared = Arc::new(Shared {
            base_call: FunctionCall::new(function, args),
            base: base.clone(),
            options,
            initial_num_items,
            state: Mutex::new(state),
            attachments: Mutex::new(Vec::new()),
            version,
            client,
        });
        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let listener = shared.client.cache().subscribe_change(&base, move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.on_event(event);
            }
        });
        let mut query = Self {
            shared,
            changes,
            _listener: listener,
        };
        query.shared.start_page(first).await;
        if !lazy && !query.shared.client.is_server() {
            let _ = query.wait_loaded().await;
        }
        Ok(query)
    }

    /// The paginated base key; also the overlay target for this list.
    pub fn key(&self) -> &CacheKey {
        &self.shared.base
    }

    /// Loaded pages merged, with overlays and the transform applied.
    pub fn results(&self) -> Vec<Value> {
        let patches = self.shared.client.cache().patches_for(&self.shared.base);
        let options = &self.shared.options;
        lock(&self.shared.state).visible(&patches, &options.identity, options.transform.as_ref())
    }

    pub fn status(&self) -> PaginationStatus {
        lock(&self.shared.state).status()
    }

    pub fn error(&self) -> Option<TetherError> {
        lock(&self.shared.state).error().cloned()
    }

    pub fn generation(&self) -> u64 {
        lock(&self.shared.state).generation()
    }

    pub fn pages(&self) -> Vec<Page> {
        lock(&self.shared.state).pages().to_vec()
    }

    pub fn is_exhausted(&self) -> bool {
        lock(&self.shared.state).is_exhausted()
    }

    /// Load `num_items` more. Returns `false` (and does nothing) unless the
    /// status is `CanLoadMore`.
    pub async fn load_more(&self, num_items: usize) -> bool {
        let request = lock(&self.shared.state).load_more(num_items);
        match request {
            Some(request) => {
                self.shared.bump();
                self.shared.start_page(request).await;
                true
            }
            None => false,
        }
    }

    /// Drop every page and start over from the first page. The old
    /// generation's entries and channels go with it.
    pub async fn reset(&self) {
        let request = lock(&self.shared.state).reset(self.shared.initial_num_items);
        let superseded = std::mem::take(&mut *lock(&self.shared.attachments));
        for attachment in superseded {
            attachment.supersede();
        }
        lifecycle!(self.shared.options.verbose, key = %self.shared.base, "pagination reset");
        self.shared.bump();
        self.shared.start_page(request).await;
    }

    /// Re-fetch every loaded page over its current cursor range, plus a
    /// failed page load. Returns the first failure.
    pub async fn refresh(&self) -> TetherResult<()> {
        let requests = lock(&self.shared.state).refresh();
        self.shared.bump();
        let results = join_all(requests.into_iter().map(|r| self.shared.refetch(r))).await;
        results.into_iter().collect::<TetherResult<Vec<()>>>().map(|_| ())
    }

    pub async fn changed(&mut self) {
        let _ = self.changes.changed().await;
    }

    /// Wait until no page is loading. Returns the error if the list failed.
    pub async fn wait_loaded(&mut self) -> TetherResult<()> {
        loop {
            self.changes.borrow_and_update();
            match self.status() {
                PaginationStatus::Error => {
                    return Err(self.error().unwrap_or_else(|| {
                        TetherError::function(self.shared.base_call.function.as_str(), "page load failed")
                    }))
                }
                status if !status.is_loading() => return Ok(()),
                _ => self.changed().await,
            }
        }
    }
}
