//! The `Client`: one cache, one identity store and one multiplexer bound to a
//! render context.
//!
//! ```ignore
//! // Server render
//! let server = Client::server(backend.clone(), "req-1")?;
//! let posts = server.query("posts:list", json!({}), QueryOptions::default()).await?;
//! let payload = server.hydration_payload();
//!
//! // Interactive session picks up where the render left off
//! let client = Client::builder(backend).with_hydration(payload).build()?;
//! let posts = client.query("posts:list", json!({}), QueryOptions::default()).await?;
//! client.take_over().await;
//! ```

use crate::backend::{Backend, TokenProvider};
use crate::context::RenderContext;
use crate::multiplexer::{SubscriptionHandle, SubscriptionMultiplexer};
use crate::mutation::{Mutation, MutationOptions};
use crate::paginated::PaginatedQuery;
use crate::query::Query;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tether_cache::{EntrySnapshot, HydrationBridge, HydrationPayload, IdentityCache, QueryCache};
use tether_core::{
    AuthToken, CacheKey, DataSource, FunctionCall, FunctionKind, FunctionName,
    PaginatedQueryOptions, QueryArgs, QueryOptions, SessionCredential, SyncConfig, TetherResult,
};
use tracing::{debug, info, warn};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// CHANNEL SLOTS
// ============================================================================

/// A consumer's claim on the live channel for one key. Empty until the
/// channel is opened; hydrated consumers stay empty until take-over.
pub(crate) struct ChannelSlot {
    key: CacheKey,
    call: FunctionCall,
    public: bool,
    handle: Mutex<Option<SubscriptionHandle>>,
}

impl ChannelSlot {
    pub(crate) fn new(key: CacheKey, call: FunctionCall, public: bool) -> Arc<Self> {
        Arc::new(Self {
            key,
            call,
            public,
            handle: Mutex::new(None),
        })
    }

    pub(crate) fn key(&self) -> &CacheKey {
        &self.key
    }

    pub(crate) fn is_open(&self) -> bool {
        lock(&self.handle).is_some()
    }

    /// Give up this consumer's share of the channel now.
    pub(crate) fn close(&self) {
        let handle = lock(&self.handle).take();
        drop(handle);
    }
}

// ============================================================================
// BUILDER
// ============================================================================

pub struct ClientBuilder {
    backend: Arc<dyn Backend>,
    tokens: Option<Arc<dyn TokenProvider>>,
    session: Option<SessionCredential>,
    config: SyncConfig,
    context: RenderContext,
    hydration: Option<HydrationPayload>,
}

impl ClientBuilder {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            tokens: None,
            session: None,
            config: SyncConfig::default(),
            context: RenderContext::Interactive,
            hydration: None,
        }
    }

    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(provider);
        self
    }

    pub fn with_session(mut self, session: SessionCredential) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_context(mut self, context: RenderContext) -> Self {
        self.context = context;
        self
    }

    /// Results recorded by a server render, claimable once each.
    pub fn with_hydration(mut self, payload: HydrationPayload) -> Self {
        self.hydration = Some(payload);
        self
    }

    pub fn build(self) -> TetherResult<Client> {
        self.config.validate()?;
        let cache = QueryCache::new();
        let hydration = match self.hydration {
            Some(payload) if !self.context.is_server() => HydrationBridge::from_payload(payload),
            _ => HydrationBridge::new(),
        };
        let multiplexer = SubscriptionMultiplexer::new(
            cache.clone(),
            self.backend.clone(),
            self.config.reconnect.clone(),
        );
        info!(context = %self.context, "client created");
        Ok(Client {
            inner: Arc::new(ClientInner {
                identity: IdentityCache::new(self.config.identity.token_ttl()),
                context: self.context,
                config: self.config,
                cache,
                backend: self.backend,
                tokens: self.tokens,
                session: RwLock::new(self.session),
                hydration,
                multiplexer,
                deferred: Mutex::new(Vec::new()),
            }),
        })
    }
}

// ============================================================================
// CLIENT
// ============================================================================

struct ClientInner {
    context: RenderContext,
    config: SyncConfig,
    cache: QueryCache,
    backend: Arc<dyn Backend>,
    tokens: Option<Arc<dyn TokenProvider>>,
    session: RwLock<Option<SessionCredential>>,
    identity: IdentityCache,
    hydration: HydrationBridge,
    multiplexer: SubscriptionMultiplexer,
    deferred: Mutex<Vec<Weak<ChannelSlot>>>,
}

/// Entry point for queries, paginated queries and mutations.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("context", &self.inner.context)
            .field("cache", &self.inner.cache)
            .field("multiplexer", &self.inner.multiplexer)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn builder(backend: Arc<dyn Backend>) -> ClientBuilder {
        ClientBuilder::new(backend)
    }

    /// Client for one server render.
    pub fn server(backend: Arc<dyn Backend>, request_id: impl Into<String>) -> TetherResult<Self> {
        ClientBuilder::new(backend)
            .with_context(RenderContext::server(request_id))
            .build()
    }

    /// Client for an interactive session with no hydrated state.
    pub fn interactive(backend: Arc<dyn Backend>) -> TetherResult<Self> {
        ClientBuilder::new(backend).build()
    }

    pub fn context(&self) -> &RenderContext {
        &self.inner.context
    }

    pub fn is_server(&self) -> bool {
        self.inner.context.is_server()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &QueryCache {
        &self.inner.cache
    }

    pub fn identity(&self) -> &IdentityCache {
        &self.inner.identity
    }

    pub fn hydration(&self) -> &HydrationBridge {
        &self.inner.hydration
    }

    pub fn multiplexer(&self) -> &SubscriptionMultiplexer {
        &self.inner.multiplexer
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    // ========================================================================
    // SURFACE
    // ========================================================================

    /// Subscribe to a query. Unless `lazy`, waits for the first result.
    pub async fn query(
        &self,
        function: &str,
        args: impl Into<QueryArgs>,
        options: QueryOptions,
    ) -> TetherResult<Query> {
        let function = FunctionName::new(function)?;
        Query::open(self.clone(), function, args.into(), options).await
    }

    /// Subscribe to a cursor-paginated query. Unless `lazy`, waits for the
    /// first page.
    pub async fn paginated_query(
        &self,
        function: &str,
        args: Value,
        options: PaginatedQueryOptions,
    ) -> TetherResult<PaginatedQuery> {
        let function = FunctionName::new(function)?;
        PaginatedQuery::open(self.clone(), function, args, options).await
    }

    pub fn mutation(&self, function: &str, options: MutationOptions) -> TetherResult<Mutation> {
        let function = FunctionName::new(function)?;
        Ok(Mutation::new(self.clone(), function, options))
    }

    // ========================================================================
    // HYDRATION
    // ========================================================================

    /// Results recorded so far by a server client. `None` for interactive
    /// clients.
    pub fn hydration_payload(&self) -> Option<HydrationPayload> {
        let request_id = self.inner.context.request_id()?;
        Some(self.inner.hydration.to_payload(request_id))
    }

    pub fn into_hydration_payload(self) -> Option<HydrationPayload> {
        self.hydration_payload()
    }

    /// End the hydration window: discard unclaimed results and open the live
    /// channels that hydrated consumers deferred. Returns how many recorded
    /// results went unclaimed.
    pub async fn take_over(&self) -> usize {
        let discarded = self.inner.hydration.close();
        let deferred: Vec<Arc<ChannelSlot>> = lock(&self.inner.deferred)
            .drain(..)
            .filter_map(|slot| slot.upgrade())
            .collect();
        info!(discarded, deferred = deferred.len(), "interactive session took over");
        for slot in deferred {
            if let Err(err) = self.open_channel(&slot).await {
                warn!(key = %slot.key, error = %err, "deferred channel not opened");
            }
        }
        discarded
    }

    pub(crate) fn defer(&self, slot: &Arc<ChannelSlot>) {
        lock(&self.inner.deferred).push(Arc::downgrade(slot));
    }

    // ========================================================================
    // IDENTITY
    // ========================================================================

    pub fn session(&self) -> Option<SessionCredential> {
        self.inner
            .session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the session. A different previous session is invalidated.
    pub fn set_session(&self, session: SessionCredential) {
        let previous = {
            let mut slot = self
                .inner
                .session
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            slot.replace(session.clone())
        };
        if let Some(previous) = previous {
            let fingerprint = previous.fingerprint();
            if fingerprint != session.fingerprint() {
                self.inner.identity.invalidate(&fingerprint);
            }
        }
    }

    /// Forget the session and its cached token.
    pub fn sign_out(&self) {
        let previous = self
            .inner
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(previous) = previous {
            let fingerprint = previous.fingerprint();
            self.inner.identity.invalidate(&fingerprint);
            info!(fingerprint = %fingerprint, "signed out");
        }
    }

    /// Token for an authenticated call. Public calls, clients without a
    /// token provider and signed-out clients get `None`.
    pub async fn resolve_auth(&self, public: bool) -> TetherResult<Option<AuthToken>> {
        if public {
            return Ok(None);
        }
        let provider = match &self.inner.tokens {
            Some(provider) => provider.clone(),
            None => return Ok(None),
        };
        let session = match self.session() {
            Some(session) => session,
            None => return Ok(None),
        };
        let fingerprint = session.fingerprint();
        self.inner
            .identity
            .get_or_fetch(&fingerprint, move || {
                let provider = provider.clone();
                let session = session.clone();
                async move { provider.get_token(&session).await }
            })
            .await
    }

    // ========================================================================
    // PLUMBING
    // ========================================================================

    /// One-shot fetch through the cache. Server clients record the result
    /// for hydration.
    pub(crate) async fn fetch_and_record(
        &self,
        key: &CacheKey,
        call: FunctionCall,
        public: bool,
    ) -> TetherResult<EntrySnapshot> {
        let client = self.clone();
        let snapshot = self
            .inner
            .cache
            .fetch(key, DataSource::Fetch, move || async move {
                let auth = client.resolve_auth(public).await?;
                client
                    .backend()
                    .invoke(FunctionKind::Query, &call, auth.as_ref())
                    .await
            })
            .await?;
        self.record(key, &snapshot);
        Ok(snapshot)
    }

    /// Record a settled entry for hydration when rendering on the server.
    pub(crate) fn record(&self, key: &CacheKey, snapshot: &EntrySnapshot) {
        if !self.is_server() {
            return;
        }
        if let Some(value) = snapshot.authoritative() {
            if self.inner.hydration.record(key, value.clone()) {
                debug!(key = %key, "recorded for hydration");
            }
        }
    }

    /// Serve the slot's key from hydration when possible, otherwise open its
    /// channel. A hydrated entry opens no channel until take-over, whichever
    /// consumer claimed it. Returns whether the key is served from hydration.
    pub(crate) async fn hydrate_or_open(
        &self,
        slot: &Arc<ChannelSlot>,
        existing: &EntrySnapshot,
    ) -> TetherResult<bool> {
        let settled = existing.status().is_settled() && existing.error().is_none();
        let hydrated = match self.inner.hydration.claim(&slot.key) {
            Some(value) if !settled => {
                self.inner
                    .cache
                    .set_success(&slot.key, value, DataSource::Hydrated)?;
                true
            }
            _ => {
                existing.data_source() == Some(DataSource::Hydrated)
                    && !self.inner.hydration.is_closed()
            }
        };
        if hydrated {
            self.defer(slot);
        } else {
            // Failures are recorded on the entry.
            let _ = self.open_channel(slot).await;
        }
        Ok(hydrated)
    }

    /// Open the live channel behind `slot` if it is not open yet.
    ///
    /// Token failures land on the entry as errors and no channel is opened.
    pub(crate) async fn open_channel(&self, slot: &Arc<ChannelSlot>) -> TetherResult<()> {
        if slot.is_open() {
            return Ok(());
        }
        let auth = match self.resolve_auth(slot.public).await {
            Ok(auth) => auth,
            Err(err) => {
                if let Err(apply) = self.inner.cache.set_error(&slot.key, err.clone()) {
                    warn!(key = %slot.key, error = %apply, "token failure not recorded");
                }
                return Err(err);
            }
        };
        let mut handle = lock(&slot.handle);
        if handle.is_none() {
            *handle = Some(
                self.inner
                    .multiplexer
                    .acquire(&slot.key, slot.call.clone(), auth),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SubscriptionStream;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tether_core::{TetherError, TransportError};

    struct Refusing;

    #[async_trait]
    impl Backend for Refusing {
        async fn invoke(
            &self,
            _kind: FunctionKind,
            _call: &FunctionCall,
            _auth: Option<&AuthToken>,
        ) -> TetherResult<Value> {
            Err(TransportError::Send {
                reason: "offline".to_string(),
            }
            .into())
        }

        async fn subscribe(
            &self,
            _call: &FunctionCall,
            _auth: Option<&AuthToken>,
        ) -> TetherResult<SubscriptionStream> {
            Err(TransportError::Send {
                reason: "offline".to_string(),
            }
            .into())
        }
    }

    #[derive(Default)]
    struct CountingTokens {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenProvider for CountingTokens {
        async fn get_token(&self, session: &SessionCredential) -> TetherResult<Option<AuthToken>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(AuthToken::new(format!("token-for-{}", session.expose()))))
        }
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = SyncConfig::default().with_token_ttl_ms(0);
        let err = Client::builder(Arc::new(Refusing))
            .with_config(config)
            .build()
            .unwrap_err();
        assert!(matches!(err, TetherError::Config(_)));
    }

    #[test]
    fn test_server_client_exposes_payload() {
        let server = Client::server(Arc::new(Refusing), "req-1").unwrap();
        assert_eq!(server.hydration_payload().map(|p| p.request_id), Some("req-1".to_string()));
        let interactive = Client::interactive(Arc::new(Refusing)).unwrap();
        assert!(interactive.hydration_payload().is_none());
    }

    #[tokio::test]
    async fn test_public_calls_never_touch_identity() {
        let tokens = Arc::new(CountingTokens::default());
        let client = Client::builder(Arc::new(Refusing))
            .with_token_provider(tokens.clone())
            .with_session(SessionCredential::new("s1"))
            .build()
            .unwrap();
        assert_eq!(client.resolve_auth(true).await.unwrap(), None);
        assert_eq!(tokens.calls.load(Ordering::SeqCst), 0);

        let token = client.resolve_auth(false).await.unwrap();
        assert_eq!(token, Some(AuthToken::new("token-for-s1")));
        client.resolve_auth(false).await.unwrap();
        assert_eq!(tokens.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sign_out_drops_token() {
        let tokens = Arc::new(CountingTokens::default());
        let client = Client::builder(Arc::new(Refusing))
            .with_token_provider(tokens.clone())
            .with_session(SessionCredential::new("s1"))
            .build()
            .unwrap();
        client.resolve_auth(false).await.unwrap();
        client.sign_out();
        assert!(client.identity().is_empty());
        assert_eq!(client.resolve_auth(false).await.unwrap(), None);

        client.set_session(SessionCredential::new("s2"));
        client.resolve_auth(false).await.unwrap();
        assert_eq!(tokens.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_transport_failure_leaves_fetch_error_on_entry() {
        let client = Client::interactive(Arc::new(Refusing)).unwrap();
        let function = FunctionName::new("posts:get").unwrap();
        let key = CacheKey::query(&function, &serde_json::json!({}));
        let call = FunctionCall::new(function, serde_json::json!({}));
        let err = client.fetch_and_record(&key, call, true).await.unwrap_err();
        assert!(err.is_transport());
        assert!(client.cache().snapshot(&key).unwrap().error().is_some());
    }
}
