//! Single-value live query handle.

use crate::client::{ChannelSlot, Client};
use serde_json::Value;
use std::sync::Arc;
use tether_cache::{ChangeSubscription, EntrySnapshot, QueryCache};
use tether_core::{
    CacheError, CacheKey, ConnectionState, DataSource, FunctionCall, FunctionName, QueryArgs,
    QueryOptions, QueryStatus, TetherError, TetherResult, Timestamp,
};
use tokio::sync::watch;

/// A consumer's hold on one key: counted in the entry's subscriber count,
/// listening for its changes and sharing its live channel.
struct Attachment {
    cache: QueryCache,
    key: CacheKey,
    slot: Arc<ChannelSlot>,
    _listener: ChangeSubscription,
    /// Left behind by new arguments rather than by the consumer going away.
    superseded: bool,
}

impl Attachment {
    fn supersede(mut self) {
        self.superseded = true;
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        if self.superseded {
            self.slot.close();
            self.cache.discard(&self.key);
        } else {
            self.cache.release(&self.key);
        }
    }
}

/// Live handle on `(function, args)`.
///
/// Reads are snapshots of the shared cache entry with overlays and the
/// optional transform applied. Dropping the handle releases the entry and
/// its channel share.
pub struct Query {
    client: Client,
    function: FunctionName,
    args: QueryArgs,
    options: QueryOptions,
    key: CacheKey,
    version: Arc<watch::Sender<u64>>,
    changes: watch::Receiver<u64>,
    attachment: Option<Attachment>,
    /// `last_updated` of an entry another consumer had already populated.
    reused_at: Option<Timestamp>,
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.key)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Query {
    pub(crate) async fn open(
        client: Client,
        function: FunctionName,
        args: QueryArgs,
        options: QueryOptions,
    ) -> TetherResult<Self> {
        let (version, changes) = watch::channel(0u64);
        let mut query = Self {
            client,
            function,
            args,
            options,
            key: CacheKey::Skip,
            version: Arc::new(version),
            changes,
            attachment: None,
            reused_at: None,
        };
        query.attach().await?;
        Ok(query)
    }

    async fn attach(&mut self) -> TetherResult<()> {
        if let Some(previous) = self.attachment.take() {
            previous.supersede();
        }
        self.reused_at = None;
        self.key = CacheKey::from_args(&self.function, &self.args);
        self.bump();
        let value = match &self.args {
            QueryArgs::Skip => {
                lifecycle!(self.options.verbose, function = %self.function, "query skipped");
                return Ok(());
            }
            QueryArgs::Args(value) => value.clone(),
        };

        let client = self.client.clone();
        let cache = client.cache().clone();
        let key = self.key.clone();
        cache.retain(&key);
        let version = self.version.clone();
        let listener = cache.subscribe_change(&key, move |_| {
            version.send_modify(|v| *v = v.wrapping_add(1));
        });
        let call = FunctionCall::new(self.function.clone(), value);
        let slot = ChannelSlot::new(key.clone(), call.clone(), self.options.public);
        self.attachment = Some(Attachment {
            cache: cache.clone(),
            key: key.clone(),
            slot: slot.clone(),
            _listener: listener,
            superseded: false,
        });

        let existing = cache.get_or_create(&key);
        if existing.status().is_settled() && existing.error().is_none() {
            self.reused_at = Some(existing.last_updated());
        }

        if client.is_server() {
            if !self.options.server {
                lifecycle!(self.options.verbose, key = %key, "query excluded from server render");
                return Ok(());
            }
            if self.reused_at.is_some() {
                client.record(&key, &existing);
                return Ok(());
            }
            lifecycle!(self.options.verbose, key = %key, "server fetch");
            if self.options.lazy {
                let public = self.options.public;
                tokio::spawn(async move {
                    let _ = client.fetch_and_record(&key, call, public).await;
                });
            } else {
                // Failures stay on the entry; the handle reports them.
                let _ = client.fetch_and_record(&key, call, self.options.public).await;
            }
            return Ok(());
        }

        if client.hydrate_or_open(&slot, &existing).await? {
            lifecycle!(self.options.verbose, key = %key, "served from hydration");
        } else {
            lifecycle!(self.options.verbose, key = %key, reused = self.reused_at.is_some(), "query attached");
        }
        if !self.options.lazy {
            let _ = self.wait_settled().await;
        }
        Ok(())
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn function(&self) -> &FunctionName {
        &self.function
    }

    pub fn args(&self) -> &QueryArgs {
        &self.args
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        self.client
            .cache()
            .snapshot(&self.key)
            .unwrap_or_else(EntrySnapshot::idle)
    }

    pub fn status(&self) -> QueryStatus {
        self.snapshot().status()
    }

    /// Visible value. Hidden while the entry holds a function-level error;
    /// kept through transport errors.
    pub fn data(&self) -> Option<Value> {
        let snapshot = self.snapshot();
        snapshot.data().cloned().map(|v| self.transform(v))
    }

    pub fn error(&self) -> Option<TetherError> {
        self.snapshot().error().cloned()
    }

    pub fn result(&self) -> TetherResult<Option<Value>> {
        Ok(self.snapshot().result()?.map(|v| self.transform(v)))
    }

    pub fn data_source(&self) -> Option<DataSource> {
        let snapshot = self.snapshot();
        match self.reused_at {
            Some(at) if snapshot.last_updated() == at => Some(DataSource::CacheReuse),
            _ => snapshot.data_source(),
        }
    }

    pub fn connection(&self) -> ConnectionState {
        self.snapshot().connection()
    }

    /// Whether the value is shown while its channel reconnects.
    pub fn is_stale(&self) -> bool {
        let snapshot = self.snapshot();
        snapshot.connection() == ConnectionState::Reconnecting && snapshot.data().is_some()
    }

    fn transform(&self, value: Value) -> Value {
        match &self.options.transform {
            Some(transform) => transform.apply(value),
            None => value,
        }
    }

    /// Wait for the next change to this query's entry or overlays.
    pub async fn changed(&mut self) {
        // The sender lives in `self`, so the channel never closes.
        let _ = self.changes.changed().await;
    }

    /// Wait until the entry holds a result or an error.
    pub async fn wait_settled(&mut self) -> TetherResult<Option<Value>> {
        loop {
            self.changes.borrow_and_update();
            let status = self.status();
            if status == QueryStatus::Idle {
                return Ok(None);
            }
            if status.is_settled() {
                return self.result();
            }
            self.changed().await;
        }
    }

    /// Fetch the current value again.
    ///
    /// Re-attempts after a function error and reopens a channel that gave
    /// up or was deferred by hydration.
    pub async fn refresh(&mut self) -> TetherResult<Option<Value>> {
        let (slot, call) = match (&self.attachment, &self.args) {
            (Some(attachment), QueryArgs::Args(value)) => (
                attachment.slot.clone(),
                FunctionCall::new(self.function.clone(), value.clone()),
            ),
            _ => return Err(CacheError::SkipKey { operation: "refresh" }.into()),
        };
        lifecycle!(self.options.verbose, key = %self.key, "refresh");
        let snapshot = self
            .client
            .fetch_and_record(&self.key, call, self.options.public)
            .await?;
        self.reused_at = None;
        if !self.client.is_server() {
            if slot.is_open() {
                self.client.multiplexer().revive(slot.key());
            } else {
                let _ = self.client.open_channel(&slot).await;
            }
        }
        Ok(snapshot.data().cloned().map(|v| self.transform(v)))
    }

    /// Point the handle at new arguments. The previous key is discarded
    /// unless another consumer still holds it; its late results never reach
    /// this handle.
    pub async fn set_args(&mut self, args: impl Into<QueryArgs>) -> TetherResult<()> {
        let args = args.into();
        if CacheKey::from_args(&self.function, &args) == self.key {
            return Ok(());
        }
        self.args = args;
        self.attach().await
    }
}
