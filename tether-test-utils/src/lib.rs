//! Tether Test Utilities
//!
//! Shared test infrastructure for the Tether workspace:
//! - `MockBackend`: scripted query/mutation handlers with call counters,
//!   a write clock stamping every result, push and disconnect injection,
//!   failure injection and latency
//! - `MockTokenProvider`: counting token source
//! - `paginate`: server-side cursor pagination over a fixed item list
//! - Proptest generators for argument values and item pages

pub use tether_client::{
    Backend, CallOutcome, SubscriptionEvent, SubscriptionStream, TokenProvider,
};
pub use tether_core::{
    AuthToken, FunctionCall, FunctionKind, ServerVersion, SessionCredential, TetherError,
    TetherResult,
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tether_core::{IdentityError, TransportError};
use tokio::sync::mpsc;

pub type Handler = Arc<dyn Fn(&Value) -> TetherResult<Value> + Send + Sync>;

// ============================================================================
// MOCK BACKEND
// ============================================================================

struct Subscriber {
    args: Value,
    /// Continue cursor of the first page result, pinned for later updates.
    end_cursor: Option<String>,
    tx: mpsc::UnboundedSender<SubscriptionEvent>,
}

#[derive(Default)]
struct MockInner {
    queries: DashMap<String, Handler>,
    mutations: DashMap<String, Handler>,
    invokes: DashMap<String, usize>,
    subscribes: DashMap<String, usize>,
    subscribers: DashMap<String, Vec<Subscriber>>,
    auth_seen: DashMap<String, Vec<Option<String>>>,
    latency_ms: AtomicU64,
    reply_delay_ms: AtomicU64,
    failing_subscribes: AtomicUsize,
    /// Bumped by every mutation before its handler runs.
    clock: AtomicU64,
    unversioned: AtomicBool,
}

/// In-memory backend driven by per-function handlers.
///
/// Subscriptions evaluate the query handler once on open and again on every
/// [`notify`](MockBackend::notify). Results carry the write clock, so a
/// `notify` from inside a mutation handler reports that mutation's version.
#[derive(Clone, Default)]
pub struct MockBackend {
    inner: Arc<MockInner>,
}

impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBackend")
            .field("queries", &self.inner.queries.len())
            .field("mutations", &self.inner.mutations.len())
            .finish()
    }
}

fn bump(counter: &DashMap<String, usize>, function: &str) {
    *counter.entry(function.to_string()).or_insert(0) += 1;
}

fn evaluate(handler: &Handler, args: &Value, version: Option<ServerVersion>) -> SubscriptionEvent {
    match handler(args) {
        Ok(value) => SubscriptionEvent::Update { value, version },
        Err(err) => SubscriptionEvent::FunctionError {
            message: err.message(),
            data: None,
        },
    }
}

fn continue_cursor(event: &SubscriptionEvent) -> Option<String> {
    match event {
        SubscriptionEvent::Update { value, .. } => value
            .get("continueCursor")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

async fn sleep_ms(ms: u64) {
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

fn with_end_cursor(args: &Value, end_cursor: Option<&str>) -> Value {
    let mut args = args.clone();
    if let (Some(end), Some(opts)) = (end_cursor, args.get_mut("paginationOpts")) {
        if let Some(opts) = opts.as_object_mut() {
            opts.entry("endCursor").or_insert_with(|| json!(end));
        }
    }
    args
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_query(
        &self,
        function: &str,
        handler: impl Fn(&Value) -> TetherResult<Value> + Send + Sync + 'static,
    ) -> &Self {
        self.inner
            .queries
            .insert(function.to_string(), Arc::new(handler));
        self
    }

    /// Query that always answers `value`.
    pub fn with_value(&self, function: &str, value: Value) -> &Self {
        self.on_query(function, move |_| Ok(value.clone()))
    }

    pub fn on_mutation(
        &self,
        function: &str,
        handler: impl Fn(&Value) -> TetherResult<Value> + Send + Sync + 'static,
    ) -> &Self {
        self.inner
            .mutations
            .insert(function.to_string(), Arc::new(handler));
        self
    }

    /// Delay applied to every invoke and subscription open.
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay between a mutation's handler running and its reply, so pushes
    /// caused by the write reach subscribers first.
    pub fn set_reply_delay(&self, delay: Duration) {
        self.inner
            .reply_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Stop reporting server versions on results and mutation replies.
    pub fn set_unversioned(&self, unversioned: bool) {
        self.inner.unversioned.store(unversioned, Ordering::SeqCst);
    }

    /// Version of the last write.
    pub fn clock(&self) -> ServerVersion {
        ServerVersion(self.inner.clock.load(Ordering::SeqCst))
    }

    fn stamp(&self) -> Option<ServerVersion> {
        if self.inner.unversioned.load(Ordering::SeqCst) {
            None
        } else {
            Some(self.clock())
        }
    }

    /// Make the next `n` subscription opens fail with a transport error.
    pub fn fail_next_subscribes(&self, n: usize) {
        self.inner.failing_subscribes.store(n, Ordering::SeqCst);
    }

    pub fn invoke_count(&self, function: &str) -> usize {
        self.inner.invokes.get(function).map(|c| *c).unwrap_or(0)
    }

    pub fn subscribe_count(&self, function: &str) -> usize {
        self.inner.subscribes.get(function).map(|c| *c).unwrap_or(0)
    }

    /// Remote calls of any kind made for `function`.
    pub fn total_calls(&self, function: &str) -> usize {
        self.invoke_count(function) + self.subscribe_count(function)
    }

    /// Subscriptions for `function` whose consumer is still attached.
    pub fn live_subscriptions(&self, function: &str) -> usize {
        self.inner
            .subscribers
            .get(function)
            .map(|subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Tokens presented on calls to `function`, in call order.
    pub fn auth_seen(&self, function: &str) -> Vec<Option<String>> {
        self.inner
            .auth_seen
            .get(function)
            .map(|seen| seen.clone())
            .unwrap_or_default()
    }

    /// Re-evaluate every live subscription of `function` and push the
    /// results. Page subscriptions keep their first continue cursor.
    pub fn notify(&self, function: &str) {
        let handler = match self.inner.queries.get(function) {
            Some(handler) => handler.clone(),
            None => return,
        };
        if let Some(mut subs) = self.inner.subscribers.get_mut(function) {
            subs.retain(|s| !s.tx.is_closed());
            for sub in subs.iter_mut() {
                let args = with_end_cursor(&sub.args, sub.end_cursor.as_deref());
                let event = evaluate(&handler, &args, self.stamp());
                if sub.end_cursor.is_none() {
                    sub.end_cursor = continue_cursor(&event);
                }
                let _ = sub.tx.send(event);
            }
        }
    }

    /// Push a raw event to every live subscription of `function`.
    pub fn push(&self, function: &str, event: SubscriptionEvent) {
        if let Some(subs) = self.inner.subscribers.get(function) {
            for sub in subs.iter() {
                let _ = sub.tx.send(event.clone());
            }
        }
    }

    /// Drop every subscription of `function` with a disconnect.
    pub fn disconnect(&self, function: &str, reason: &str) {
        if let Some((_, subs)) = self.inner.subscribers.remove(function) {
            for sub in subs {
                let _ = sub.tx.send(SubscriptionEvent::Disconnected {
                    reason: reason.to_string(),
                });
            }
        }
    }

    async fn delay(&self) {
        sleep_ms(self.inner.latency_ms.load(Ordering::SeqCst)).await;
    }

    fn record_auth(&self, function: &str, auth: Option<&AuthToken>) {
        self.inner
            .auth_seen
            .entry(function.to_string())
            .or_default()
            .push(auth.map(|t| t.as_str().to_string()));
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn invoke(
        &self,
        kind: FunctionKind,
        call: &FunctionCall,
        auth: Option<&AuthToken>,
    ) -> TetherResult<Value> {
        let function = call.function.as_str();
        bump(&self.inner.invokes, function);
        self.record_auth(function, auth);
        self.delay().await;
        let handlers = match kind {
            FunctionKind::Query => &self.inner.queries,
            FunctionKind::Mutation => &self.inner.mutations,
        };
        let handler = handlers.get(function).map(|h| h.clone());
        match handler {
            Some(handler) => handler(&call.args),
            None => Err(TetherError::function(function, "unknown function")),
        }
    }

    async fn mutate(
        &self,
        call: &FunctionCall,
        auth: Option<&AuthToken>,
    ) -> TetherResult<CallOutcome> {
        self.inner.clock.fetch_add(1, Ordering::SeqCst);
        let version = self.stamp();
        let value = self.invoke(FunctionKind::Mutation, call, auth).await?;
        sleep_ms(self.inner.reply_delay_ms.load(Ordering::SeqCst)).await;
        Ok(CallOutcome { value, version })
    }

    async fn subscribe(
        &self,
        call: &FunctionCall,
        auth: Option<&AuthToken>,
    ) -> TetherResult<SubscriptionStream> {
        let function = call.function.as_str();
        bump(&self.inner.subscribes, function);
        self.record_auth(function, auth);
        self.delay().await;
        let failing = self
            .inner
            .failing_subscribes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Connect {
                endpoint: "mock".to_string(),
                reason: "injected failure".to_string(),
            }
            .into());
        }
        let handler = self
            .inner
            .queries
            .get(function)
            .map(|h| h.clone())
            .ok_or_else(|| TetherError::function(function, "unknown function"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let first = evaluate(&handler, &call.args, self.stamp());
        let end_cursor = continue_cursor(&first);
        let _ = tx.send(first);
        self.inner
            .subscribers
            .entry(function.to_string())
            .or_default()
            .push(Subscriber {
                args: call.args.clone(),
                end_cursor,
                tx,
            });
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(Box::pin(stream))
    }
}

// ============================================================================
// MOCK TOKEN PROVIDER
// ============================================================================

/// Token source that counts lookups. Tokens are `token-<secret>-<n>`.
#[derive(Debug, Default)]
pub struct MockTokenProvider {
    calls: AtomicUsize,
    latency_ms: AtomicU64,
    signed_out: AtomicBool,
    failing: AtomicBool,
}

impl MockTokenProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Answer `None` for every session.
    pub fn set_signed_out(&self, signed_out: bool) {
        self.signed_out.store(signed_out, Ordering::SeqCst);
    }

    /// Reject every lookup.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl TokenProvider for MockTokenProvider {
    async fn get_token(&self, session: &SessionCredential) -> TetherResult<Option<AuthToken>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(IdentityError::Rejected {
                reason: "mock provider rejects".to_string(),
            }
            .into());
        }
        if self.signed_out.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(AuthToken::new(format!(
            "token-{}-{}",
            session.expose(),
            n
        ))))
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

/// Cursor pagination over `items`, reading `paginationOpts` from `args`.
///
/// Cursors are item offsets. With `endCursor` the page spans exactly up to
/// it, regardless of `numItems`.
pub fn paginate(items: &[Value], args: &Value) -> TetherResult<Value> {
    let opts = args
        .get("paginationOpts")
        .ok_or_else(|| TetherError::function("paginate", "missing paginationOpts"))?;
    let num_items = opts
        .get("numItems")
        .and_then(Value::as_u64)
        .ok_or_else(|| TetherError::function("paginate", "missing numItems"))?
        as usize;
    let offset = |field: &str| -> TetherResult<Option<usize>> {
        match opts.get(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => s
                .parse()
                .map(Some)
                .map_err(|_| TetherError::function("paginate", format!("bad {}", field))),
            Some(_) => Err(TetherError::function("paginate", format!("bad {}", field))),
        }
    };
    let start = offset("cursor")?.unwrap_or(0).min(items.len());
    let end = match offset("endCursor")? {
        Some(end) => end.clamp(start, items.len()),
        None => (start + num_items).min(items.len()),
    };
    Ok(json!({
        "page": items[start..end].to_vec(),
        "isDone": end >= items.len(),
        "continueCursor": end.to_string(),
    }))
}

/// `n` items `{ "_id": "<prefix><i>", "n": i }`.
pub fn numbered_items(prefix: &str, n: usize) -> Vec<Value> {
    (0..n)
        .map(|i| json!({ "_id": format!("{}{}", prefix, i), "n": i }))
        .collect()
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Tether values.

    use proptest::prelude::*;
    use serde_json::{json, Value};

    /// Arbitrary JSON, nested up to three levels.
    pub fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(|n| json!(n)),
            "[a-z0-9]{0,8}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-f]{1,3}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    /// Argument objects as passed to a query.
    pub fn arb_args() -> impl Strategy<Value = Value> {
        prop::collection::btree_map("[a-z]{1,6}", arb_json(), 0..5)
            .prop_map(|m| Value::Object(m.into_iter().collect()))
    }

    /// A list item with an identity drawn from a small pool, so lists
    /// contain duplicates.
    pub fn arb_item() -> impl Strategy<Value = Value> {
        (0u8..12, any::<i16>()).prop_map(|(id, n)| json!({ "_id": format!("i{}", id), "n": n }))
    }

    /// Up to five pages of up to six items each.
    pub fn arb_pages() -> impl Strategy<Value = Vec<Vec<Value>>> {
        prop::collection::vec(prop::collection::vec(arb_item(), 0..6), 0..5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tether_core::FunctionName;

    fn call(function: &str, args: Value) -> FunctionCall {
        FunctionCall::new(FunctionName::new(function).unwrap(), args)
    }

    #[test]
    fn test_paginate_walks_and_pins() {
        let items = numbered_items("m", 5);
        let first = paginate(&items, &json!({ "paginationOpts": { "numItems": 2, "cursor": null } })).unwrap();
        assert_eq!(first["page"].as_array().unwrap().len(), 2);
        assert_eq!(first["continueCursor"], json!("2"));
        assert_eq!(first["isDone"], json!(false));

        let last = paginate(&items, &json!({ "paginationOpts": { "numItems": 9, "cursor": "2" } })).unwrap();
        assert_eq!(last["page"].as_array().unwrap().len(), 3);
        assert_eq!(last["isDone"], json!(true));

        let pinned = paginate(
            &items,
            &json!({ "paginationOpts": { "numItems": 1, "cursor": null, "endCursor": "3" } }),
        )
        .unwrap();
        assert_eq!(pinned["page"].as_array().unwrap().len(), 3);
        assert_eq!(pinned["continueCursor"], json!("3"));
    }

    #[tokio::test]
    async fn test_mock_subscription_pushes_and_counts() {
        let backend = MockBackend::new();
        backend.with_value("posts:list", json!([1]));
        let mut stream = backend
            .subscribe(&call("posts:list", json!({})), None)
            .await
            .unwrap();
        assert_eq!(
            stream.next().await,
            Some(SubscriptionEvent::Update {
                value: json!([1]),
                version: Some(ServerVersion(0)),
            })
        );
        backend.with_value("posts:list", json!([1, 2]));
        backend.notify("posts:list");
        assert_eq!(
            stream.next().await,
            Some(SubscriptionEvent::Update {
                value: json!([1, 2]),
                version: Some(ServerVersion(0)),
            })
        );
        assert_eq!(backend.subscribe_count("posts:list"), 1);
        assert_eq!(backend.live_subscriptions("posts:list"), 1);
        drop(stream);
        assert_eq!(backend.live_subscriptions("posts:list"), 0);
    }

    #[tokio::test]
    async fn test_mutation_reply_and_pushes_share_the_write_version() {
        let backend = MockBackend::new();
        backend.with_value("posts:list", json!([]));
        let notifier = backend.clone();
        backend.on_mutation("posts:create", move |_| {
            notifier.with_value("posts:list", json!(["p1"]));
            notifier.notify("posts:list");
            Ok(json!("p1"))
        });
        let mut stream = backend
            .subscribe(&call("posts:list", json!({})), None)
            .await
            .unwrap();
        stream.next().await;

        let outcome = backend
            .mutate(&call("posts:create", json!({})), None)
            .await
            .unwrap();
        assert_eq!(outcome.value, json!("p1"));
        assert_eq!(outcome.version, Some(ServerVersion(1)));
        assert_eq!(
            stream.next().await,
            Some(SubscriptionEvent::Update {
                value: json!(["p1"]),
                version: Some(ServerVersion(1)),
            })
        );

        backend.set_unversioned(true);
        let outcome = backend
            .mutate(&call("posts:create", json!({})), None)
            .await
            .unwrap();
        assert_eq!(outcome.version, None);
        assert_eq!(backend.clock(), ServerVersion(2));
    }

    #[tokio::test]
    async fn test_injected_subscribe_failures() {
        let backend = MockBackend::new();
        backend.with_value("posts:list", json!([]));
        backend.fail_next_subscribes(1);
        let call = call("posts:list", json!({}));
        let err = backend.subscribe(&call, None).await.err().unwrap();
        assert!(err.is_transport());
        assert!(backend.subscribe(&call, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_token_provider_counts() {
        let provider = MockTokenProvider::new();
        let session = SessionCredential::new("s");
        let token = provider.get_token(&session).await.unwrap();
        assert_eq!(token, Some(AuthToken::new("token-s-1")));
        provider.set_signed_out(true);
        assert_eq!(provider.get_token(&session).await.unwrap(), None);
        assert_eq!(provider.calls(), 2);
    }
}
