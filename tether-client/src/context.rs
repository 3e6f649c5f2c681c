//! Execution environment a [`Client`](crate::Client) is built for.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One-shot server render or long-lived interactive session.
///
/// A server client fetches once per query and records results for
/// hydration. An interactive client claims hydrated results and keeps live
/// subscriptions open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RenderContext {
    Server { request_id: String },
    #[default]
    Interactive,
}

impl RenderContext {
    pub fn server(request_id: impl Into<String>) -> Self {
        RenderContext::Server {
            request_id: request_id.into(),
        }
    }

    pub fn is_server(&self) -> bool {
        matches!(self, RenderContext::Server { .. })
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            RenderContext::Server { request_id } => Some(request_id),
            RenderContext::Interactive => None,
        }
    }
}

impl fmt::Display for RenderContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderContext::Server { request_id } => write!(f, "server({})", request_id),
            RenderContext::Interactive => write!(f, "interactive"),
        }
    }
}
