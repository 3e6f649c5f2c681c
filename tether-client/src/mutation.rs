//! Mutations with optional optimistic overlays.

use crate::backend::CallOutcome;
use crate::client::Client;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tether_cache::{OverlayApi, QueryCache};
use tether_core::{
    new_overlay_id, FunctionCall, FunctionName, OverlayError, OverlayId, ServerVersion,
    TetherResult,
};
use tracing::{debug, warn};

/// Callback that stages overlay edits from the mutation's arguments.
pub type OptimisticUpdate = Arc<dyn Fn(&mut OverlayApi<'_>, &Value) + Send + Sync>;

#[derive(Clone, Default)]
pub struct MutationOptions {
    pub optimistic_update: Option<OptimisticUpdate>,
    pub public: bool,
    pub verbose: bool,
}

impl std::fmt::Debug for MutationOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationOptions")
            .field("optimistic_update", &self.optimistic_update.is_some())
            .field("public", &self.public)
            .field("verbose", &self.verbose)
            .finish()
    }
}

impl MutationOptions {
    pub fn with_optimistic_update(
        mut self,
        update: impl Fn(&mut OverlayApi<'_>, &Value) + Send + Sync + 'static,
    ) -> Self {
        self.optimistic_update = Some(Arc::new(update));
        self
    }

    pub fn with_public(mut self, public: bool) -> Self {
        self.public = public;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handle for calling one mutation function. Cheap to clone; clones share
/// the in-flight count.
#[derive(Clone)]
pub struct Mutation {
    client: Client,
    function: FunctionName,
    options: MutationOptions,
    in_flight: Arc<AtomicUsize>,
}

impl std::fmt::Debug for Mutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutation")
            .field("function", &self.function)
            .field("pending", &self.pending())
            .finish()
    }
}

impl Mutation {
    pub(crate) fn new(client: Client, function: FunctionName, options: MutationOptions) -> Self {
        Self {
            client,
            function,
            options,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn function(&self) -> &FunctionName {
        &self.function
    }

    /// Whether a call through this handle is in flight.
    pub fn pending(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    /// Run the mutation.
    ///
    /// The optimistic overlay, if any, is visible before the remote call
    /// starts. On failure it is removed and the error comes back wrapped in
    /// [`OverlayError::RolledBack`]; without an overlay the error is returned
    /// as-is.
    pub async fn mutate(&self, args: Value) -> TetherResult<Value> {
        let call = FunctionCall::new(self.function.clone(), args);
        let cache = self.client.cache();
        let overlay = self.install(cache, &call.args);
        let _guard = InFlightGuard::enter(&self.in_flight);

        let result = self.invoke(&call).await;
        match result {
            Ok(outcome) => {
                if let Some(id) = overlay {
                    self.settle(cache, id, outcome.version);
                }
                lifecycle!(self.options.verbose, function = %self.function, "mutation confirmed");
                Ok(outcome.value)
            }
            Err(err) => match overlay {
                Some(id) => {
                    cache.remove_overlay(id);
                    warn!(function = %self.function, overlay = %id, error = %err, "mutation failed, overlay rolled back");
                    Err(OverlayError::RolledBack {
                        function: self.function.to_string(),
                        cause: Box::new(err),
                    }
                    .into())
                }
                None => {
                    warn!(function = %self.function, error = %err, "mutation failed");
                    Err(err)
                }
            },
        }
    }

    async fn invoke(&self, call: &FunctionCall) -> TetherResult<CallOutcome> {
        let auth = self.client.resolve_auth(self.options.public).await?;
        self.client.backend().mutate(call, auth.as_ref()).await
    }

    fn install(&self, cache: &QueryCache, args: &Value) -> Option<OverlayId> {
        let update = self.options.optimistic_update.as_ref()?;
        let mut api = OverlayApi::new(cache);
        update(&mut api, args);
        if api.is_empty() {
            return None;
        }
        let id = new_overlay_id();
        let targets = cache.install_overlay(id, api.into_patches());
        if targets.is_empty() {
            return None;
        }
        debug!(function = %self.function, overlay = %id, targets = targets.len(), "optimistic update applied");
        Some(id)
    }

    /// Hand the overlay to the cache to retire once authoritative data
    /// reflects the write at `version`, with a timeout fallback for targets
    /// that never get there.
    fn settle(&self, cache: &QueryCache, id: OverlayId, version: Option<ServerVersion>) {
        let waiting = cache.settle_overlay(id, version);
        if waiting.is_empty() {
            return;
        }
        let cache = cache.clone();
        let timeout = self.client.config().overlay_settle_timeout();
        let function = self.function.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if cache.remove_overlay(id) {
                debug!(function = %function, overlay = %id, "settle timeout, overlay dropped");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, SubscriptionStream};
    use async_trait::async_trait;
    use serde_json::json;
    use tether_core::{AuthToken, CacheKey, DataSource, FunctionKind, TetherError, TransportError};
    use tokio::sync::Notify;

    /// Mutations block until released; `fail` picks the outcome.
    struct Gated {
        gate: Notify,
        fail: bool,
    }

    #[async_trait]
    impl Backend for Gated {
        async fn invoke(
            &self,
            _kind: FunctionKind,
            call: &FunctionCall,
            _auth: Option<&AuthToken>,
        ) -> TetherResult<Value> {
            self.gate.notified().await;
            if self.fail {
                Err(TetherError::function(call.function.as_str(), "rejected"))
            } else {
                Ok(json!({ "_id": "real" }))
            }
        }

        async fn subscribe(
            &self,
            _call: &FunctionCall,
            _auth: Option<&AuthToken>,
        ) -> TetherResult<SubscriptionStream> {
            Err(TransportError::Send {
                reason: "unused".to_string(),
            }
            .into())
        }
    }

    fn setup(fail: bool) -> (Client, Arc<Gated>, CacheKey) {
        let backend = Arc::new(Gated {
            gate: Notify::new(),
            fail,
        });
        let client = Client::interactive(backend.clone()).unwrap();
        let key = CacheKey::query(&FunctionName::new("todos:list").unwrap(), &json!({}));
        client.cache().get_or_create(&key);
        client
            .cache()
            .set_success(&key, json!([{ "_id": "a" }]), DataSource::Fetch)
            .unwrap();
        (client, backend, key)
    }

    fn options(key: &CacheKey) -> MutationOptions {
        let target = key.clone();
        MutationOptions::default().with_public(true).with_optimistic_update(
            move |api, args| {
                let mut list = api.get_query(&target).unwrap_or_else(|| json!([]));
                if let Some(items) = list.as_array_mut() {
                    items.push(json!({ "_id": "tmp", "text": args["text"].clone() }));
                }
                api.set_query(&target, list);
            },
        )
    }

    #[tokio::test]
    async fn test_overlay_visible_while_pending_and_dropped_on_success() {
        let (client, backend, key) = setup(false);
        let mutation = client.mutation("todos:add", options(&key)).unwrap();
        let task = {
            let mutation = mutation.clone();
            tokio::spawn(async move { mutation.mutate(json!({ "text": "hi" })).await })
        };
        while !mutation.pending() {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            client.cache().visible(&key),
            Some(json!([{ "_id": "a" }, { "_id": "tmp", "text": "hi" }]))
        );

        backend.gate.notify_one();
        let value = task.await.unwrap().unwrap();
        assert_eq!(value, json!({ "_id": "real" }));
        assert!(!mutation.pending());
        // No live channel feeds the key, so the overlay goes at once.
        assert_eq!(client.cache().visible(&key), Some(json!([{ "_id": "a" }])));
    }

    #[tokio::test]
    async fn test_failure_rolls_back_and_wraps_cause() {
        let (client, backend, key) = setup(true);
        let mutation = client.mutation("todos:add", options(&key)).unwrap();
        let task = {
            let mutation = mutation.clone();
            tokio::spawn(async move { mutation.mutate(json!({ "text": "hi" })).await })
        };
        while !mutation.pending() {
            tokio::task::yield_now().await;
        }
        backend.gate.notify_one();
        let err = task.await.unwrap().unwrap_err();
        match &err {
            TetherError::Overlay(OverlayError::RolledBack { function, cause }) => {
                assert_eq!(function, "todos:add");
                assert!(cause.is_function());
            }
            other => panic!("expected rollback, got {:?}", other),
        }
        assert_eq!(err.message(), "rejected");
        assert_eq!(client.cache().visible(&key), Some(json!([{ "_id": "a" }])));
        assert!(client.cache().patches_for(&key).is_empty());
    }

    #[tokio::test]
    async fn test_failure_without_overlay_returns_raw_error() {
        let (client, backend, _) = setup(true);
        let mutation = client
            .mutation("todos:add", MutationOptions::default().with_public(true))
            .unwrap();
        backend.gate.notify_one();
        let err = mutation.mutate(json!({})).await.unwrap_err();
        assert!(err.is_function());
    }
}
