//! Query cache and lifecycle manager.
//!
//! One entry per [`CacheKey`], guarded per key by `DashMap`. Every mutation is
//! applied and its guard released before change listeners run, so listeners
//! always observe a complete state and may re-enter the cache.

use super::entry::{CacheEntry, EntrySnapshot, HeldUpdate};
use super::stats::{CacheStats, StatsCounters};
use super::watermark::{Watermark, WatermarkRegistry};
use crate::overlay::{OverlayLayer, OverlayPhase, Patch};
use crate::single_flight::{Flight, SingleFlight};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tether_core::{
    CacheError, CacheKey, ConnectionState, DataSource, OverlayId, QueryStatus, ServerVersion,
    TetherError, TetherResult,
};
use tracing::{debug, trace, warn};

/// Change notification delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    /// An entry changed state or value.
    Entry(EntrySnapshot),
    /// The overlays on a target changed and the target has no entry of its
    /// own (paginated bases, or queries not yet requested).
    Overlay { target: CacheKey },
}

impl CacheEvent {
    pub fn key(&self) -> &CacheKey {
        match self {
            CacheEvent::Entry(snapshot) => snapshot.key(),
            CacheEvent::Overlay { target } => target,
        }
    }
}

pub type ChangeListener = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

/// Registration guard for a change listener. Dropping it detaches the
/// listener.
#[must_use = "dropping the subscription detaches the listener"]
pub struct ChangeSubscription {
    cache: Weak<Inner>,
    key: CacheKey,
    id: u64,
}

impl ChangeSubscription {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn unsubscribe(self) {}
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.cache.upgrade() {
            if let Some(mut listeners) = inner.listeners.get_mut(&self.key) {
                listeners.retain(|(id, _)| *id != self.id);
            }
            inner.listeners.remove_if(&self.key, |_, l| l.is_empty());
        }
    }
}

struct Inner {
    entries: DashMap<CacheKey, CacheEntry>,
    overlays: DashMap<CacheKey, Vec<OverlayLayer>>,
    marks: WatermarkRegistry,
    listeners: DashMap<CacheKey, Vec<(u64, ChangeListener)>>,
    next_listener: AtomicU64,
    flights: SingleFlight<CacheKey, TetherResult<Value>>,
    stats: StatsCounters,
}

/// Process-local store of query results, overlays and their listeners.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Inner>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.inner.entries.len())
            .field("overlay_targets", &self.inner.overlays.len())
            .finish()
    }
}

impl QueryCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                overlays: DashMap::new(),
                marks: WatermarkRegistry::new(),
                listeners: DashMap::new(),
                next_listener: AtomicU64::new(1),
                flights: SingleFlight::new(),
                stats: StatsCounters::default(),
            }),
        }
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Look up an entry, creating it `Pending` if absent.
    ///
    /// The skip key yields an idle snapshot and creates nothing.
    pub fn get_or_create(&self, key: &CacheKey) -> EntrySnapshot {
        if key.is_skip() {
            return EntrySnapshot::idle();
        }
        let entry = match self.inner.entries.entry(key.clone()) {
            Entry::Occupied(slot) => {
                StatsCounters::bump(&self.inner.stats.hits);
                slot.get().clone()
            }
            Entry::Vacant(slot) => {
                StatsCounters::bump(&self.inner.stats.misses);
                trace!(key = %key, "cache entry created");
                slot.insert(CacheEntry::pending()).clone()
            }
        };
        self.build_snapshot(key, &entry)
    }

    /// Snapshot of an existing entry.
    pub fn snapshot(&self, key: &CacheKey) -> Option<EntrySnapshot> {
        if key.is_skip() {
            return Some(EntrySnapshot::idle());
        }
        let entry = self.inner.entries.get(key).map(|e| e.value().clone())?;
        Some(self.build_snapshot(key, &entry))
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.entries.contains_key(key)
    }

    /// Authoritative value with overlays applied, as a caller would see it.
    pub fn visible(&self, key: &CacheKey) -> Option<Value> {
        match key {
            CacheKey::Query(_) if !self.contains(key) => self
                .patches_for(key)
                .iter()
                .fold(None, |acc, patch| patch.apply_to_value(acc)),
            _ => self.snapshot(key).and_then(|s| s.data().cloned()),
        }
    }

    fn build_snapshot(&self, key: &CacheKey, entry: &CacheEntry) -> EntrySnapshot {
        match key {
            CacheKey::Query(_) => {
                let patches = self.patches_for(key);
                let visible = patches
                    .iter()
                    .fold(entry.value.clone(), |acc, patch| patch.apply_to_value(acc));
                EntrySnapshot::from_entry(key.clone(), entry, visible, !patches.is_empty())
            }
            _ => EntrySnapshot::from_entry(key.clone(), entry, entry.value.clone(), false),
        }
    }

    // ========================================================================
    // LIFECYCLE TRANSITIONS
    // ========================================================================

    fn transition<F>(
        &self,
        key: &CacheKey,
        operation: &'static str,
        next: QueryStatus,
        apply: F,
    ) -> TetherResult<CacheEntry>
    where
        F: FnOnce(&mut CacheEntry),
    {
        if key.is_skip() {
            return Err(CacheError::SkipKey { operation }.into());
        }
        let mut entry = self
            .inner
            .entries
            .entry(key.clone())
            .or_insert_with(CacheEntry::pending);
        Self::advance_status(key, entry.value_mut(), next, apply)
    }

    fn advance_status<F>(
        key: &CacheKey,
        entry: &mut CacheEntry,
        next: QueryStatus,
        apply: F,
    ) -> TetherResult<CacheEntry>
    where
        F: FnOnce(&mut CacheEntry),
    {
        let from = entry.status;
        if !from.can_transition_to(next) {
            return Err(CacheError::InvalidTransition {
                key: key.to_string(),
                from,
                to: next,
            }
            .into());
        }
        apply(entry);
        entry.status = next;
        entry.last_updated = Utc::now();
        debug!(key = %key, from = %from, to = %next, "cache transition");
        Ok(entry.clone())
    }

    fn record_success(
        key: &CacheKey,
        entry: &mut CacheEntry,
        update: HeldUpdate,
    ) -> TetherResult<CacheEntry> {
        Self::advance_status(key, entry, QueryStatus::Success, |e| {
            if update.source == DataSource::Subscription {
                e.update_count += 1;
                e.connection = ConnectionState::Live;
            }
            e.value = Some(update.value);
            e.error = None;
            e.data_source = Some(update.source);
            e.version = update.version;
        })
    }

    /// Mark an entry as loading. The last known value is kept.
    pub fn set_pending(&self, key: &CacheKey) -> TetherResult<EntrySnapshot> {
        let entry = self.transition(key, "set_pending", QueryStatus::Pending, |e| {
            e.error = None;
        })?;
        Ok(self.publish(key, &entry))
    }

    /// Move an entry to `Pending` ahead of a fetch. An entry that is already
    /// loading, including one just created, is left as it is.
    fn begin_load(&self, key: &CacheKey) -> TetherResult<()> {
        let loading = self
            .inner
            .entries
            .entry(key.clone())
            .or_insert_with(CacheEntry::pending)
            .status
            == QueryStatus::Pending;
        if !loading {
            self.set_pending(key)?;
        }
        Ok(())
    }

    /// Record a result with no server version.
    pub fn set_success(
        &self,
        key: &CacheKey,
        value: Value,
        source: DataSource,
    ) -> TetherResult<EntrySnapshot> {
        self.set_success_at(key, value, source, None)
    }

    /// Record a result observed at `version`.
    ///
    /// Push-delivered results count as updates and mark the channel live.
    /// Authoritative results advance the target's watermark, which retires
    /// confirmed overlays before listeners observe the new value.
    ///
    /// While a mutation with an overlay on the target is in flight, an
    /// authoritative result for an entry that already shows a value is held
    /// back: the entry keeps showing its previous value under the overlay
    /// until the mutation settles, so the written row never appears next to
    /// its optimistic stand-in.
    pub fn set_success_at(
        &self,
        key: &CacheKey,
        value: Value,
        source: DataSource,
        version: Option<ServerVersion>,
    ) -> TetherResult<EntrySnapshot> {
        if key.is_skip() {
            return Err(CacheError::SkipKey {
                operation: "set_success",
            }
            .into());
        }
        let target = key.overlay_target();
        let update = HeldUpdate {
            value,
            source,
            version,
        };
        let recorded = {
            let mut entry = self
                .inner
                .entries
                .entry(key.clone())
                .or_insert_with(CacheEntry::pending);
            if !source.is_authoritative() {
                Some(Self::record_success(key, entry.value_mut(), update)?)
            } else if entry.value.is_some() && self.has_pending_layer(&target) {
                entry.held = Some(update);
                None
            } else {
                entry.held = None;
                Some(Self::record_success(key, entry.value_mut(), update)?)
            }
        };
        let entry = match recorded {
            Some(entry) => entry,
            None => {
                trace!(key = %key, "result held behind a pending overlay");
                return self.snapshot(key).ok_or_else(|| {
                    CacheError::Superseded {
                        key: key.to_string(),
                    }
                    .into()
                });
            }
        };
        if source.is_authoritative() {
            let mark = self.inner.marks.advance(&target, version);
            self.retire_confirmed(&target, mark);
        }
        Ok(self.publish(key, &entry))
    }

    /// Record a failure. The last value is retained on the entry; whether it
    /// stays visible depends on the error class.
    pub fn set_error(&self, key: &CacheKey, error: TetherError) -> TetherResult<EntrySnapshot> {
        let entry = self.transition(key, "set_error", QueryStatus::Error, |e| {
            e.error = Some(error);
        })?;
        Ok(self.publish(key, &entry))
    }

    /// Update the push-channel state of an existing entry.
    pub fn set_connection(&self, key: &CacheKey, state: ConnectionState) -> Option<EntrySnapshot> {
        let entry = {
            let mut entry = self.inner.entries.get_mut(key)?;
            if entry.connection == state {
                return None;
            }
            entry.connection = state;
            entry.clone()
        };
        debug!(key = %key, connection = ?state, "connection state changed");
        Some(self.publish(key, &entry))
    }

    /// Register a consumer of `key`. Returns the new consumer count.
    pub fn retain(&self, key: &CacheKey) -> usize {
        if key.is_skip() {
            return 0;
        }
        let mut entry = self
            .inner
            .entries
            .entry(key.clone())
            .or_insert_with(CacheEntry::pending);
        entry.subscriber_count += 1;
        entry.subscriber_count
    }

    pub fn release(&self, key: &CacheKey) -> usize {
        match self.inner.entries.get_mut(key) {
            Some(mut entry) => {
                entry.subscriber_count = entry.subscriber_count.saturating_sub(1);
                entry.subscriber_count
            }
            None => 0,
        }
    }

    // ========================================================================
    // FETCH
    // ========================================================================

    /// Run `fetcher` for `key`, sharing the work with any identical fetch
    /// already in flight.
    ///
    /// Only the caller that starts the flight moves the entry to `Pending`;
    /// the result is written once, by the flight itself.
    pub async fn fetch<F, Fut>(
        &self,
        key: &CacheKey,
        source: DataSource,
        fetcher: F,
    ) -> TetherResult<EntrySnapshot>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TetherResult<Value>> + Send + 'static,
    {
        if key.is_skip() {
            return Err(CacheError::SkipKey { operation: "fetch" }.into());
        }
        let cache = self.clone();
        let flight_key = key.clone();
        let (flight, role) = self.inner.flights.join_or_start(key.clone(), move || {
            let work = fetcher();
            async move {
                let result = work.await;
                let applied = match &result {
                    Ok(value) => cache.set_success(&flight_key, value.clone(), source),
                    Err(err) => cache.set_error(&flight_key, err.clone()),
                };
                if let Err(err) = applied {
                    warn!(key = %flight_key, error = %err, "fetch result not applied");
                }
                result
            }
        });

        match role {
            Flight::Leader => {
                StatsCounters::bump(&self.inner.stats.fetches);
                self.begin_load(key)?;
            }
            Flight::Joined => {
                StatsCounters::bump(&self.inner.stats.dedup_joins);
                debug!(key = %key, "joined in-flight fetch");
            }
        }

        let result = flight.clone().await;
        self.inner.flights.complete(key, &flight);
        result?;
        self.snapshot(key).ok_or_else(|| {
            CacheError::Superseded {
                key: key.to_string(),
            }
            .into()
        })
    }

    pub fn is_fetching(&self, key: &CacheKey) -> bool {
        self.inner.flights.is_in_flight(key)
    }

    // ========================================================================
    // OVERLAYS
    // ========================================================================

    /// Install an overlay. Patches are grouped by overlay target; returns the
    /// targets touched.
    pub fn install_overlay(&self, id: OverlayId, patches: Vec<(CacheKey, Patch)>) -> Vec<CacheKey> {
        let mut grouped: Vec<(CacheKey, Vec<Patch>)> = Vec::new();
        for (key, patch) in patches {
            let target = key.overlay_target();
            if target.is_skip() {
                continue;
            }
            match grouped.iter_mut().find(|(k, _)| *k == target) {
                Some((_, group)) => group.push(patch),
                None => grouped.push((target, vec![patch])),
            }
        }

        let mut targets = Vec::with_capacity(grouped.len());
        for (target, patches) in grouped {
            let installed_at = self.inner.marks.current(&target).sequence;
            self.inner
                .overlays
                .entry(target.clone())
                .or_default()
                .push(OverlayLayer {
                    id,
                    patches,
                    phase: OverlayPhase::Pending,
                    installed_at,
                });
            targets.push(target);
        }
        debug!(overlay = %id, targets = targets.len(), "overlay installed");
        for target in &targets {
            self.publish_overlay(target);
        }
        targets
    }

    /// The mutation behind `id` succeeded, at `version` when the backend
    /// reported one.
    ///
    /// Per target, the layer is dropped at once when no channel will deliver
    /// an update or the target already shows the write; otherwise it waits
    /// for an update that does. Results held back behind the layer are
    /// applied, and may retire it. Returns the targets still waiting.
    pub fn settle_overlay(&self, id: OverlayId, version: Option<ServerVersion>) -> Vec<CacheKey> {
        let mut waiting = Vec::new();
        for target in self.targets_of(id) {
            let live = self.is_live(&target);
            let mark = self.inner.marks.current(&target);
            let removed = match self.inner.overlays.get_mut(&target) {
                Some(mut layers) => match layers.iter().position(|l| l.id == id) {
                    Some(idx) if !live || mark.confirms(layers[idx].installed_at, version) => {
                        layers.remove(idx);
                        true
                    }
                    Some(idx) => {
                        layers[idx].phase = OverlayPhase::Settling {
                            after: mark.sequence,
                            version,
                        };
                        false
                    }
                    None => false,
                },
                None => false,
            };
            if removed {
                self.inner.overlays.remove_if(&target, |_, l| l.is_empty());
            }
            let released = self.release_held(&target);
            if removed && released == 0 {
                self.publish_overlay(&target);
            }
            if self.overlay_phase(&target, id).is_some() {
                waiting.push(target);
            }
        }
        debug!(overlay = %id, version = ?version, waiting = waiting.len(), "overlay settling");
        waiting
    }

    /// Drop an overlay from every target. Returns whether anything was removed.
    pub fn remove_overlay(&self, id: OverlayId) -> bool {
        let targets = self.targets_of(id);
        for target in &targets {
            if let Some(mut layers) = self.inner.overlays.get_mut(target) {
                layers.retain(|l| l.id != id);
            }
            self.inner.overlays.remove_if(target, |_, l| l.is_empty());
        }
        for target in &targets {
            if self.release_held(target) == 0 {
                self.publish_overlay(target);
            }
        }
        if !targets.is_empty() {
            debug!(overlay = %id, "overlay removed");
        }
        !targets.is_empty()
    }

    pub fn has_overlay(&self, id: OverlayId) -> bool {
        self.inner
            .overlays
            .iter()
            .any(|layers| layers.iter().any(|l| l.id == id))
    }

    /// Patches for a target in installation order.
    pub fn patches_for(&self, target: &CacheKey) -> Vec<Patch> {
        self.inner
            .overlays
            .get(target)
            .map(|layers| {
                layers
                    .iter()
                    .flat_map(|l| l.patches.iter().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn overlay_phase(&self, target: &CacheKey, id: OverlayId) -> Option<OverlayPhase> {
        self.inner
            .overlays
            .get(target)
            .and_then(|layers| layers.iter().find(|l| l.id == id).map(|l| l.phase))
    }

    fn targets_of(&self, id: OverlayId) -> Vec<CacheKey> {
        self.inner
            .overlays
            .iter()
            .filter(|layers| layers.iter().any(|l| l.id == id))
            .map(|layers| layers.key().clone())
            .collect()
    }

    /// Drop settling layers whose write `mark` shows.
    fn retire_confirmed(&self, target: &CacheKey, mark: Watermark) {
        let retired = match self.inner.overlays.get_mut(target) {
            Some(mut layers) => {
                let before = layers.len();
                layers.retain(|l| match l.phase {
                    OverlayPhase::Settling { after, version } => !mark.confirms(after, version),
                    OverlayPhase::Pending => true,
                });
                before - layers.len()
            }
            None => 0,
        };
        self.inner.overlays.remove_if(target, |_, l| l.is_empty());
        if retired > 0 {
            debug!(target = %target, retired, "confirmed overlays retired");
        }
    }

    fn has_pending_layer(&self, target: &CacheKey) -> bool {
        self.inner
            .overlays
            .get(target)
            .map(|layers| layers.iter().any(|l| l.phase == OverlayPhase::Pending))
            .unwrap_or(false)
    }

    /// Apply the results held back for `target` once no layer on it is
    /// pending. Every held result is applied before any listener runs.
    /// Returns how many were applied.
    fn release_held(&self, target: &CacheKey) -> usize {
        let keys: Vec<CacheKey> = self
            .inner
            .entries
            .iter()
            .filter(|e| e.held.is_some() && e.key().overlay_target() == *target)
            .map(|e| e.key().clone())
            .collect();
        let mut applied: Vec<(CacheKey, CacheEntry, Option<ServerVersion>)> = Vec::new();
        for key in keys {
            let recorded = {
                let mut entry = match self.inner.entries.get_mut(&key) {
                    Some(entry) => entry,
                    None => continue,
                };
                if self.has_pending_layer(target) {
                    break;
                }
                let update = match entry.held.take() {
                    Some(update) => update,
                    None => continue,
                };
                let version = update.version;
                Self::record_success(&key, entry.value_mut(), update).map(|e| (e, version))
            };
            match recorded {
                Ok((entry, version)) => applied.push((key, entry, version)),
                Err(err) => warn!(key = %key, error = %err, "held result not applied"),
            }
        }
        if applied.is_empty() {
            return 0;
        }
        let mut mark = self.inner.marks.current(target);
        for (_, _, version) in &applied {
            mark = self.inner.marks.advance(target, *version);
        }
        self.retire_confirmed(target, mark);
        debug!(target = %target, released = applied.len(), "held results applied");
        for (key, entry, _) in &applied {
            self.publish(key, entry);
        }
        applied.len()
    }

    /// Whether a push channel currently feeds the target.
    fn is_live(&self, target: &CacheKey) -> bool {
        match target {
            CacheKey::Paginated(base) => self.inner.entries.iter().any(|entry| {
                matches!(entry.key(), CacheKey::Page(page) if page.base == *base)
                    && entry.connection != ConnectionState::Closed
            }),
            other => self
                .inner
                .entries
                .get(other)
                .map(|e| e.connection != ConnectionState::Closed)
                .unwrap_or(false),
        }
    }

    // ========================================================================
    // LISTENERS
    // ========================================================================

    /// Attach a listener for changes to `key`.
    ///
    /// Listeners on a paginated base also receive every change to its pages.
    pub fn subscribe_change<F>(&self, key: &CacheKey, listener: F) -> ChangeSubscription
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(listener)));
        ChangeSubscription {
            cache: Arc::downgrade(&self.inner),
            key: key.clone(),
            id,
        }
    }

    pub fn listener_count(&self, key: &CacheKey) -> usize {
        self.inner.listeners.get(key).map(|l| l.len()).unwrap_or(0)
    }

    fn listeners_for(&self, key: &CacheKey) -> Vec<ChangeListener> {
        let mut out: Vec<ChangeListener> = Vec::new();
        if let Some(listeners) = self.inner.listeners.get(key) {
            out.extend(listeners.iter().map(|(_, l)| l.clone()));
        }
        let target = key.overlay_target();
        if target != *key {
            if let Some(listeners) = self.inner.listeners.get(&target) {
                out.extend(listeners.iter().map(|(_, l)| l.clone()));
            }
        }
        out
    }

    fn notify(&self, key: &CacheKey, event: &CacheEvent) {
        for listener in self.listeners_for(key) {
            listener(event);
        }
    }

    fn publish(&self, key: &CacheKey, entry: &CacheEntry) -> EntrySnapshot {
        let snapshot = self.build_snapshot(key, entry);
        self.notify(key, &CacheEvent::Entry(snapshot.clone()));
        snapshot
    }

    fn publish_overlay(&self, target: &CacheKey) {
        match self.snapshot(target) {
            Some(snapshot) if !target.is_skip() => {
                self.notify(target, &CacheEvent::Entry(snapshot));
            }
            _ => self.notify(
                target,
                &CacheEvent::Overlay {
                    target: target.clone(),
                },
            ),
        }
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    /// Release a consumer of a key that will not be requested again, and
    /// drop the entry once no other consumer holds it. The target's
    /// watermark goes with its last entry unless overlays still need it.
    /// Returns whether the entry was removed.
    pub fn discard(&self, key: &CacheKey) -> bool {
        if self.release(key) > 0 || !self.remove_if_unused(key) {
            return false;
        }
        StatsCounters::bump(&self.inner.stats.evictions);
        let target = key.overlay_target();
        let in_use = self.inner.overlays.contains_key(&target)
            || self
                .inner
                .entries
                .iter()
                .any(|e| e.key().overlay_target() == target);
        if !in_use {
            self.inner.marks.forget(&target);
        }
        trace!(key = %key, "superseded entry discarded");
        true
    }

    /// Remove one entry if nothing consumes it. Returns whether it was removed.
    pub fn remove_if_unused(&self, key: &CacheKey) -> bool {
        if self.inner.flights.is_in_flight(key) {
            return false;
        }
        self.inner
            .entries
            .remove_if(key, |_, e| e.subscriber_count == 0)
            .is_some()
    }

    /// Drop entries with no consumers, no fetch in flight and no overlays.
    pub fn evict_unused(&self) -> usize {
        let candidates: Vec<CacheKey> = self
            .inner
            .entries
            .iter()
            .filter(|e| e.subscriber_count == 0)
            .map(|e| e.key().clone())
            .collect();
        let mut evicted = 0;
        for key in candidates {
            if self.inner.overlays.contains_key(&key.overlay_target()) {
                continue;
            }
            if self.remove_if_unused(&key) {
                evicted += 1;
            }
        }
        if evicted > 0 {
            StatsCounters::add(&self.inner.stats.evictions, evicted as u64);
            debug!(evicted, "evicted unused cache entries");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let overlay_ids: HashSet<OverlayId> = self
            .inner
            .overlays
            .iter()
            .flat_map(|layers| layers.iter().map(|l| l.id).collect::<Vec<_>>())
            .collect();
        self.inner.stats.snapshot(
            self.inner.entries.len() as u64,
            overlay_ids.len() as u64,
            self.inner.marks.len() as u64,
        )
    }
}
