//! Subscription multiplexer.
//!
//! Shares one live channel per cache key among every consumer of that key.
//! The channel opens when the first [`SubscriptionHandle`] is acquired and
//! closes when the last one is released. Channel events become cache
//! mutations:
//!
//! - `Update` lands as a `Subscription`-sourced success at its server version
//! - `FunctionError` flips the entry to `Error`
//! - a disconnect keeps the last value and marks the entry `Reconnecting`
//!   while the channel reconnects on its [`RetryPolicy`]
//!
//! Only after `max_attempts` consecutive failures is the transport error
//! surfaced on the entry.

use crate::backend::{Backend, SubscriptionEvent};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::StreamExt;
use rand::Rng;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tether_cache::QueryCache;
use tether_core::{
    AuthToken, CacheKey, ConnectionState, DataSource, FunctionCall, FunctionError,
    ReconnectConfig, TetherError, TetherResult, TransportError,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct Channel {
    holders: usize,
    call: FunctionCall,
    auth: Option<AuthToken>,
    task: JoinHandle<()>,
}

/// Reconnect schedule shared by every channel of a multiplexer.
///
/// After the `n`th consecutive failure a channel waits
/// `initial_ms * multiplier^(n - 1)`, capped at `max_ms`, plus up to
/// `jitter_ms` of random spread. It gives up after `max_attempts` failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: ReconnectConfig,
}

/// Highest power the multiplier is raised to.
const MAX_EXPONENT: u32 = 32;

impl RetryPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    /// Whether `failures` consecutive failures end the channel.
    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.config.max_attempts
    }

    /// Delay before reconnecting after `failures` consecutive failures,
    /// without jitter.
    pub fn base_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(MAX_EXPONENT) as i32;
        let grown = self.config.initial_ms as f64 * self.config.multiplier.powi(exponent);
        Duration::from_millis(grown.min(self.config.max_ms as f64) as u64)
    }

    pub fn delay(&self, failures: u32) -> Duration {
        let spread = match self.config.jitter_ms {
            0 => 0,
            jitter => rand::rng().random_range(0..jitter),
        };
        self.base_delay(failures) + Duration::from_millis(spread)
    }
}

struct MuxInner {
    cache: QueryCache,
    backend: Arc<dyn Backend>,
    retry: RetryPolicy,
    channels: DashMap<CacheKey, Channel>,
}

impl MuxInner {
    fn spawn(&self, key: &CacheKey, call: FunctionCall, auth: Option<AuthToken>) -> JoinHandle<()> {
        tokio::spawn(run_channel(
            self.cache.clone(),
            self.backend.clone(),
            self.retry.clone(),
            key.clone(),
            call,
            auth,
        ))
    }

    fn release(&self, key: &CacheKey) {
        let last = match self.channels.get_mut(key) {
            Some(mut channel) => {
                channel.holders = channel.holders.saturating_sub(1);
                channel.holders == 0
            }
            None => false,
        };
        if !last {
            return;
        }
        if let Some((_, channel)) = self.channels.remove_if(key, |_, c| c.holders == 0) {
            channel.task.abort();
            info!(key = %key, "subscription channel closed");
            self.cache.set_connection(key, ConnectionState::Closed);
        }
    }
}

/// Reference-counted live channels keyed by cache key.
///
/// Channels run as Tokio tasks, so `acquire` must be called from within a
/// runtime.
#[derive(Clone)]
pub struct SubscriptionMultiplexer {
    inner: Arc<MuxInner>,
}

impl std::fmt::Debug for SubscriptionMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionMultiplexer")
            .field("channels", &self.inner.channels.len())
            .finish()
    }
}

impl SubscriptionMultiplexer {
    pub fn new(cache: QueryCache, backend: Arc<dyn Backend>, reconnect: ReconnectConfig) -> Self {
        Self {
            inner: Arc::new(MuxInner {
                cache,
                backend,
                retry: RetryPolicy::new(reconnect),
                channels: DashMap::new(),
            }),
        }
    }

    /// Join the channel for `key`, opening it if this is the first holder.
    ///
    /// The call and token of the first holder are used for the lifetime of
    /// the channel. The skip key yields an inert handle.
    pub fn acquire(
        &self,
        key: &CacheKey,
        call: FunctionCall,
        auth: Option<AuthToken>,
    ) -> SubscriptionHandle {
        if key.is_skip() {
            return SubscriptionHandle {
                mux: Weak::new(),
                key: CacheKey::Skip,
            };
        }
        match self.inner.channels.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                let channel = slot.get_mut();
                channel.holders += 1;
                if channel.task.is_finished() {
                    debug!(key = %key, "restarting finished subscription channel");
                    channel.task = self.inner.spawn(key, channel.call.clone(), channel.auth.clone());
                }
            }
            Entry::Vacant(slot) => {
                info!(key = %key, "subscription channel opened");
                let task = self.inner.spawn(key, call.clone(), auth.clone());
                slot.insert(Channel {
                    holders: 1,
                    call,
                    auth,
                    task,
                });
            }
        }
        SubscriptionHandle {
            mux: Arc::downgrade(&self.inner),
            key: key.clone(),
        }
    }

    /// Restart the channel for `key` if it gave up. Returns whether a new
    /// channel task was started.
    pub fn revive(&self, key: &CacheKey) -> bool {
        match self.inner.channels.get_mut(key) {
            Some(mut channel) if channel.task.is_finished() => {
                debug!(key = %key, "reviving subscription channel");
                let call = channel.call.clone();
                let auth = channel.auth.clone();
                channel.task = self.inner.spawn(key, call, auth);
                true
            }
            _ => false,
        }
    }

    pub fn active_channels(&self) -> usize {
        self.inner.channels.len()
    }

    /// Number of handles holding the channel for `key`.
    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.inner
            .channels
            .get(key)
            .map(|c| c.holders)
            .unwrap_or(0)
    }

    pub fn is_open(&self, key: &CacheKey) -> bool {
        self.inner.channels.contains_key(key)
    }
}

/// Holder's share of a channel. Dropping it releases the share.
#[must_use = "dropping the handle releases the subscription"]
pub struct SubscriptionHandle {
    mux: Weak<MuxInner>,
    key: CacheKey,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn release(self) {}
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("key", &self.key)
            .finish()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.mux.upgrade() {
            inner.release(&self.key);
        }
    }
}

// ============================================================================
// CHANNEL LOOP
// ============================================================================

async fn run_channel(
    cache: QueryCache,
    backend: Arc<dyn Backend>,
    retry: RetryPolicy,
    key: CacheKey,
    call: FunctionCall,
    auth: Option<AuthToken>,
) {
    let mut failures: u32 = 0;
    loop {
        let reason = match backend.subscribe(&call, auth.as_ref()).await {
            Ok(mut stream) => {
                cache.set_connection(&key, ConnectionState::Live);
                let mut delivered = false;
                let reason = loop {
                    match stream.next().await {
                        Some(SubscriptionEvent::Update { value, version }) => {
                            delivered = true;
                            log_unapplied(
                                &key,
                                cache.set_success_at(&key, value, DataSource::Subscription, version),
                            );
                        }
                        Some(SubscriptionEvent::FunctionError { message, data }) => {
                            delivered = true;
                            let err = FunctionError::Failed {
                                function: call.function.to_string(),
                                message,
                                data,
                            };
                            log_unapplied(&key, cache.set_error(&key, err.into()));
                        }
                        Some(SubscriptionEvent::Disconnected { reason }) => break reason,
                        None => break "subscription stream ended".to_string(),
                    }
                };
                if delivered {
                    failures = 0;
                }
                reason
            }
            Err(err) if !is_retryable(&err) => {
                warn!(key = %key, error = %err, "subscription rejected");
                log_unapplied(&key, cache.set_error(&key, err));
                cache.set_connection(&key, ConnectionState::Closed);
                return;
            }
            Err(err) => err.to_string(),
        };

        failures += 1;
        if retry.exhausted(failures) {
            error!(key = %key, attempts = failures, reason = %reason, "subscription retries exhausted");
            let err = TransportError::RetriesExhausted {
                attempts: failures,
                last_reason: reason,
            };
            log_unapplied(&key, cache.set_error(&key, err.into()));
            cache.set_connection(&key, ConnectionState::Closed);
            return;
        }

        cache.set_connection(&key, ConnectionState::Reconnecting);
        let delay = retry.delay(failures);
        warn!(key = %key, attempt = failures, delay_ms = delay.as_millis() as u64, reason = %reason, "subscription lost, reconnecting");
        tokio::time::sleep(delay).await;
    }
}

fn log_unapplied<T>(key: &CacheKey, result: TetherResult<T>) {
    if let Err(err) = result {
        warn!(key = %key, error = %err, "channel event not applied");
    }
}

/// Classify an error for a subscription that could not be opened.
pub(crate) fn is_retryable(err: &TetherError) -> bool {
    err.is_transport()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SubscriptionStream;
    use async_trait::async_trait;
    use futures_util::stream;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tether_core::{FunctionKind, FunctionName, QueryStatus};
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct ScriptedBackend {
        subscribes: AtomicUsize,
        refuse: AtomicBool,
        senders: Mutex<Vec<mpsc::UnboundedSender<SubscriptionEvent>>>,
    }

    impl ScriptedBackend {
        fn send(&self, event: SubscriptionEvent) {
            let senders = self.senders.lock().unwrap();
            if let Some(tx) = senders.last() {
                let _ = tx.send(event);
            }
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        async fn invoke(
            &self,
            _kind: FunctionKind,
            _call: &FunctionCall,
            _auth: Option<&AuthToken>,
        ) -> TetherResult<Value> {
            Ok(Value::Null)
        }

        async fn subscribe(
            &self,
            _call: &FunctionCall,
            _auth: Option<&AuthToken>,
        ) -> TetherResult<SubscriptionStream> {
            let n = self.subscribes.fetch_add(1, Ordering::SeqCst) + 1;
            if self.refuse.load(Ordering::SeqCst) {
                return Err(TransportError::Connect {
                    endpoint: "scripted".to_string(),
                    reason: "refused".to_string(),
                }
                .into());
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(SubscriptionEvent::update(json!({ "n": n })));
            self.senders.lock().unwrap().push(tx);
            Ok(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            })
            .boxed())
        }
    }

    fn fast_reconnect(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_ms: 1,
            max_ms: 4,
            multiplier: 2.0,
            jitter_ms: 0,
            max_attempts,
        }
    }

    fn setup(max_attempts: u32) -> (QueryCache, Arc<ScriptedBackend>, SubscriptionMultiplexer, CacheKey, FunctionCall) {
        let cache = QueryCache::new();
        let backend = Arc::new(ScriptedBackend::default());
        let mux = SubscriptionMultiplexer::new(cache.clone(), backend.clone(), fast_reconnect(max_attempts));
        let function = FunctionName::new("messages:list").unwrap();
        let key = CacheKey::query(&function, &json!({}));
        let call = FunctionCall::new(function, json!({}));
        cache.retain(&key);
        (cache, backend, mux, key, call)
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_one_channel_per_key() {
        let (cache, backend, mux, key, call) = setup(3);
        let a = mux.acquire(&key, call.clone(), None);
        let b = mux.acquire(&key, call, None);
        assert_eq!(mux.active_channels(), 1);
        assert_eq!(mux.subscriber_count(&key), 2);

        eventually(|| cache.snapshot(&key).map(|s| s.status()) == Some(QueryStatus::Success)).await;
        assert_eq!(backend.subscribes.load(Ordering::SeqCst), 1);

        drop(a);
        assert!(mux.is_open(&key));
        b.release();
        assert_eq!(mux.active_channels(), 0);
        assert_eq!(cache.snapshot(&key).unwrap().connection(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_updates_count_and_errors_flip_status() {
        let (cache, backend, mux, key, call) = setup(3);
        let _handle = mux.acquire(&key, call, None);
        eventually(|| cache.snapshot(&key).map(|s| s.update_count()) == Some(1)).await;

        backend.send(SubscriptionEvent::update(json!({ "n": 42 })));
        eventually(|| cache.snapshot(&key).map(|s| s.update_count()) == Some(2)).await;
        assert_eq!(cache.visible(&key), Some(json!({ "n": 42 })));

        backend.send(SubscriptionEvent::FunctionError {
            message: "boom".to_string(),
            data: None,
        });
        eventually(|| cache.snapshot(&key).map(|s| s.status()) == Some(QueryStatus::Error)).await;
        let snapshot = cache.snapshot(&key).unwrap();
        assert!(snapshot.data().is_none());
        assert_eq!(snapshot.error().map(|e| e.message()), Some("boom".to_string()));
    }

    #[tokio::test]
    async fn test_disconnect_keeps_value_and_reconnects() {
        let (cache, backend, mux, key, call) = setup(50);
        let _handle = mux.acquire(&key, call, None);
        eventually(|| cache.snapshot(&key).map(|s| s.update_count()) == Some(1)).await;

        backend.refuse.store(true, Ordering::SeqCst);
        backend.send(SubscriptionEvent::Disconnected {
            reason: "reset".to_string(),
        });
        eventually(|| {
            cache.snapshot(&key).map(|s| s.connection()) == Some(ConnectionState::Reconnecting)
        })
        .await;
        let snapshot = cache.snapshot(&key).unwrap();
        assert_eq!(snapshot.status(), QueryStatus::Success);
        assert_eq!(snapshot.data(), Some(&json!({ "n": 1 })));

        backend.refuse.store(false, Ordering::SeqCst);
        eventually(|| cache.snapshot(&key).map(|s| s.connection()) == Some(ConnectionState::Live)).await;
        assert!(backend.subscribes.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_transport_error() {
        let (cache, backend, mux, key, call) = setup(3);
        backend.refuse.store(true, Ordering::SeqCst);
        let _handle = mux.acquire(&key, call.clone(), None);
        eventually(|| cache.snapshot(&key).map(|s| s.status()) == Some(QueryStatus::Error)).await;
        let snapshot = cache.snapshot(&key).unwrap();
        assert!(snapshot.error().map(|e| e.is_transport()).unwrap_or(false));
        assert_eq!(backend.subscribes.load(Ordering::SeqCst), 3);

        backend.refuse.store(false, Ordering::SeqCst);
        eventually(|| {
            mux.inner
                .channels
                .get(&key)
                .map(|c| c.task.is_finished())
                .unwrap_or(false)
        })
        .await;
        assert!(mux.revive(&key));
        eventually(|| cache.snapshot(&key).map(|s| s.status()) == Some(QueryStatus::Success)).await;
    }

    #[test]
    fn test_retry_delay_grows_to_cap() {
        let retry = RetryPolicy::new(fast_reconnect(3));
        assert_eq!(retry.base_delay(1), Duration::from_millis(1));
        assert_eq!(retry.base_delay(2), Duration::from_millis(2));
        assert_eq!(retry.base_delay(3), Duration::from_millis(4));
        assert_eq!(retry.base_delay(4), Duration::from_millis(4));
        assert_eq!(retry.delay(2), Duration::from_millis(2));
        assert!(!retry.exhausted(2));
        assert!(retry.exhausted(3));
    }

    #[test]
    fn test_retry_delay_saturates_and_spreads() {
        let retry = RetryPolicy::new(ReconnectConfig {
            initial_ms: 500,
            max_ms: 30_000,
            multiplier: 2.0,
            jitter_ms: 100,
            max_attempts: u32::MAX,
        });
        assert_eq!(retry.base_delay(u32::MAX), Duration::from_millis(30_000));
        for failures in 1..20 {
            let delay = retry.delay(failures);
            let base = retry.base_delay(failures);
            assert!(delay >= base && delay < base + Duration::from_millis(100));
        }
    }

    #[test]
    fn test_only_transport_errors_are_retried() {
        assert!(is_retryable(&TransportError::Send { reason: "x".into() }.into()));
        assert!(!is_retryable(&TetherError::function("f", "no")));
    }
}
