//! Short-lived identity/token cache.
//!
//! Tokens are keyed by the session fingerprint, never the raw credential.
//! Expired entries are invisible to readers. `invalidate` bumps a
//! per-fingerprint epoch; a lookup that started under an older epoch never
//! populates the cache.

use crate::single_flight::{Flight, SingleFlight};
use chrono::Utc;
use dashmap::DashMap;
use std::future::Future;
use std::time::Duration;
use tether_core::{
    AuthToken, IdentityError, SessionFingerprint, TetherResult, Timestamp,
};
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct IdentityEntry {
    token: AuthToken,
    expires_at: Timestamp,
}

type LookupKey = (SessionFingerprint, u64);

pub struct IdentityCache {
    entries: DashMap<SessionFingerprint, IdentityEntry>,
    epochs: DashMap<SessionFingerprint, u64>,
    lookups: SingleFlight<LookupKey, TetherResult<Option<AuthToken>>>,
    ttl: Duration,
}

impl std::fmt::Debug for IdentityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityCache")
            .field("entries", &self.entries.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl IdentityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            epochs: DashMap::new(),
            lookups: SingleFlight::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached token, if present and unexpired.
    pub fn get(&self, fingerprint: &SessionFingerprint) -> Option<AuthToken> {
        let entry = self.entries.get(fingerprint)?;
        if entry.expires_at > Utc::now() {
            Some(entry.token.clone())
        } else {
            None
        }
    }

    pub fn set(&self, fingerprint: &SessionFingerprint, token: AuthToken, ttl: Duration) {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC);
        self.set_with_expiry(fingerprint, token, expires_at);
    }

    pub fn set_with_expiry(
        &self,
        fingerprint: &SessionFingerprint,
        token: AuthToken,
        expires_at: Timestamp,
    ) {
        trace!(fingerprint = %fingerprint, %expires_at, "token cached");
        self.entries
            .insert(fingerprint.clone(), IdentityEntry { token, expires_at });
    }

    /// Forget the token and fence off any lookup already in flight.
    ///
    /// The epoch shard stays locked while the entry is removed, so a lookup
    /// cannot store its token in between.
    pub fn invalidate(&self, fingerprint: &SessionFingerprint) {
        {
            let mut epoch = self.epochs.entry(fingerprint.clone()).or_insert(0);
            *epoch += 1;
            self.entries.remove(fingerprint);
        }
        debug!(fingerprint = %fingerprint, "identity invalidated");
    }

    /// Cache `token` only if no invalidation has happened since `epoch` was
    /// read. Lock order is epochs, then entries.
    fn store_if_current(
        &self,
        fingerprint: &SessionFingerprint,
        epoch: u64,
        token: &AuthToken,
    ) -> bool {
        let current = self.epochs.entry(fingerprint.clone()).or_insert(0);
        if *current != epoch {
            return false;
        }
        if self.get(fingerprint).is_none() {
            self.set(fingerprint, token.clone(), self.ttl);
        }
        true
    }

    pub fn epoch(&self, fingerprint: &SessionFingerprint) -> u64 {
        self.epochs.get(fingerprint).map(|e| *e).unwrap_or(0)
    }

    /// Read-through lookup.
    ///
    /// Concurrent callers for the same fingerprint share one call to `fetch`.
    /// A lookup overtaken by `invalidate` is discarded and retried once under
    /// the new epoch. `None` from the provider (signed out) is not cached.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        fingerprint: &SessionFingerprint,
        fetch: F,
    ) -> TetherResult<Option<AuthToken>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = TetherResult<Option<AuthToken>>> + Send + 'static,
    {
        if let Some(token) = self.get(fingerprint) {
            return Ok(Some(token));
        }
        for _ in 0..2 {
            let epoch = self.epoch(fingerprint);
            let lookup_key = (fingerprint.clone(), epoch);
            let (flight, role) = self.lookups.join_or_start(lookup_key.clone(), &fetch);
            if role == Flight::Joined {
                trace!(fingerprint = %fingerprint, "joined in-flight token lookup");
            }
            let result = flight.clone().await;
            self.lookups.complete(&lookup_key, &flight);

            let current = match &result {
                Ok(Some(token)) => self.store_if_current(fingerprint, epoch, token),
                _ => self.epoch(fingerprint) == epoch,
            };
            if !current {
                debug!(fingerprint = %fingerprint, "token lookup overtaken by invalidation");
                continue;
            }
            return result;
        }
        Err(IdentityError::LookupFailed {
            reason: "session invalidated during token lookup".to_string(),
        }
        .into())
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
