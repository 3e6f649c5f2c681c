//! Seams to the remote backend and the token source.
//!
//! The runtime never talks to the network directly: one-shot calls go through
//! [`Backend::invoke`], live queries through [`Backend::subscribe`], and
//! authenticated calls obtain their token from a [`TokenProvider`].

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;
use tether_core::{
    AuthToken, FunctionCall, FunctionKind, ServerVersion, SessionCredential, TetherResult,
};

/// One message on a live subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// A new authoritative value for the subscribed query, with the server
    /// version it reflects when the backend reports one.
    Update {
        value: Value,
        version: Option<ServerVersion>,
    },
    /// The function failed while re-evaluating.
    FunctionError {
        message: String,
        data: Option<Value>,
    },
    /// The transport dropped. The stream ends after this event.
    Disconnected { reason: String },
}

impl SubscriptionEvent {
    /// An update without a server version.
    pub fn update(value: Value) -> Self {
        SubscriptionEvent::Update {
            value,
            version: None,
        }
    }
}

/// Result of a one-shot call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    pub value: Value,
    /// Server version at which a mutation's write became visible.
    pub version: Option<ServerVersion>,
}

/// Push stream for one subscription. Dropping it unsubscribes.
///
/// A stream that ends without a `Disconnected` event is treated as one.
pub type SubscriptionStream = BoxStream<'static, SubscriptionEvent>;

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Run a query or mutation once.
    async fn invoke(
        &self,
        kind: FunctionKind,
        call: &FunctionCall,
        auth: Option<&AuthToken>,
    ) -> TetherResult<Value>;

    /// Run a mutation once, reporting the server version of its write.
    ///
    /// Backends that do not track versions can rely on the default, which
    /// reports none; overlays then settle on the next authoritative update.
    async fn mutate(
        &self,
        call: &FunctionCall,
        auth: Option<&AuthToken>,
    ) -> TetherResult<CallOutcome> {
        let value = self.invoke(FunctionKind::Mutation, call, auth).await?;
        Ok(CallOutcome {
            value,
            version: None,
        })
    }

    /// Open a live subscription to a query. The first event carries the
    /// current value.
    async fn subscribe(
        &self,
        call: &FunctionCall,
        auth: Option<&AuthToken>,
    ) -> TetherResult<SubscriptionStream>;
}

#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    /// Token for the session, or `None` when the session is signed out.
    async fn get_token(&self, session: &SessionCredential) -> TetherResult<Option<AuthToken>>;
}
