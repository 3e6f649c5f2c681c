//! HTTP and WebSocket adapters for [`Backend`] and [`TokenProvider`].
//!
//! Wire format:
//!
//! * `POST {http_endpoint}/api/{query|mutation}` with `{ "path", "args" }`,
//!   answered by `{ "status": "success", "value", "ts"? }` or
//!   `{ "status": "error", "errorMessage", "errorData" }`.
//! * The WebSocket client sends `{ "type": "subscribe", "path", "args",
//!   "token" }` and receives `{ "type": "update", "value", "ts"? }` or
//!   `{ "type": "error", "errorMessage", "errorData" }` frames.
//! * `ts` is the server version: on a mutation answer, the version of its
//!   write; on an update, the version the value reflects.
//! * `POST {auth_endpoint}` with `{ "session" }`, answered by
//!   `{ "token": string | null }`.

use crate::backend::{Backend, CallOutcome, SubscriptionEvent, SubscriptionStream, TokenProvider};
use crate::config::ClientConfig;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tether_core::{
    AuthToken, FunctionCall, FunctionError, FunctionKind, IdentityError, ServerVersion,
    SessionCredential, TetherError, TetherResult, TransportError,
};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

// ============================================================================
// WIRE TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct CallBody<'a> {
    path: &'a str,
    args: &'a Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum CallEnvelope {
    Success {
        #[serde(default)]
        value: Value,
        #[serde(default)]
        ts: Option<ServerVersion>,
    },
    Error {
        #[serde(rename = "errorMessage")]
        error_message: String,
        #[serde(rename = "errorData", default)]
        error_data: Option<Value>,
    },
}

#[derive(Debug, Serialize)]
struct SubscribeFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    path: &'a str,
    args: &'a Value,
    token: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame {
    Update {
        #[serde(default)]
        value: Value,
        #[serde(default)]
        ts: Option<ServerVersion>,
    },
    Error {
        #[serde(rename = "errorMessage")]
        error_message: String,
        #[serde(rename = "errorData", default)]
        error_data: Option<Value>,
    },
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    session: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
}

fn decode_envelope(function: &str, text: &str) -> TetherResult<CallOutcome> {
    let envelope: CallEnvelope =
        serde_json::from_str(text).map_err(|e| TransportError::Decode {
            reason: e.to_string(),
        })?;
    match envelope {
        CallEnvelope::Success { value, ts } => Ok(CallOutcome { value, version: ts }),
        CallEnvelope::Error {
            error_message,
            error_data,
        } => Err(FunctionError::Failed {
            function: function.to_string(),
            message: error_message,
            data: error_data,
        }
        .into()),
    }
}

fn decode_frame(text: &str) -> Result<SubscriptionEvent, serde_json::Error> {
    Ok(match serde_json::from_str::<ServerFrame>(text)? {
        ServerFrame::Update { value, ts } => SubscriptionEvent::Update { value, version: ts },
        ServerFrame::Error {
            error_message,
            error_data,
        } => SubscriptionEvent::FunctionError {
            message: error_message,
            data: error_data,
        },
    })
}

fn bearer(token: &AuthToken) -> TetherResult<HeaderValue> {
    HeaderValue::from_str(&format!("Bearer {}", token.as_str())).map_err(|e| {
        IdentityError::Rejected {
            reason: format!("token is not a valid header value: {}", e),
        }
        .into()
    })
}

// ============================================================================
// HTTP
// ============================================================================

/// One-shot calls over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration) -> TetherResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Connect {
                endpoint: base_url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &ClientConfig) -> TetherResult<Self> {
        Self::new(&config.http_endpoint, config.request_timeout())
    }

    pub async fn call(
        &self,
        kind: FunctionKind,
        call: &FunctionCall,
        auth: Option<&AuthToken>,
    ) -> TetherResult<CallOutcome> {
        let url = format!("{}/api/{}", self.base_url, kind.as_path());
        let mut request = self.client.post(&url).json(&CallBody {
            path: call.function.as_str(),
            args: &call.args,
        });
        if let Some(token) = auth {
            request = request.header(AUTHORIZATION, bearer(token)?);
        }
        let response = request.send().await.map_err(|e| TransportError::Connect {
            endpoint: url.clone(),
            reason: e.to_string(),
        })?;
        let status = response.status();
        let text = response.text().await.map_err(|e| TransportError::Decode {
            reason: e.to_string(),
        })?;
        if !status.is_success() {
            return Err(TransportError::Http {
                status: status.as_u16(),
                body: text,
            }
            .into());
        }
        debug!(function = %call.function, kind = kind.as_path(), "remote call answered");
        decode_envelope(call.function.as_str(), &text)
    }
}

// ============================================================================
// WEBSOCKET
// ============================================================================

/// Live subscriptions, one socket per subscription.
#[derive(Debug, Clone)]
pub struct WsBackend {
    endpoint: String,
}

impl WsBackend {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.ws_endpoint.clone())
    }

    pub async fn open(
        &self,
        call: &FunctionCall,
        auth: Option<&AuthToken>,
    ) -> TetherResult<SubscriptionStream> {
        let connect_error = |reason: String| TransportError::Connect {
            endpoint: self.endpoint.clone(),
            reason,
        };
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| connect_error(e.to_string()))?;
        if let Some(token) = auth {
            request.headers_mut().insert(AUTHORIZATION, bearer(token)?);
        }
        let (mut socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| connect_error(e.to_string()))?;

        let frame = serde_json::to_string(&SubscribeFrame {
            kind: "subscribe",
            path: call.function.as_str(),
            args: &call.args,
            token: auth.map(AuthToken::as_str),
        })
        .map_err(|e| TransportError::Send {
            reason: e.to_string(),
        })?;
        socket
            .send(Message::Text(frame))
            .await
            .map_err(|e| TransportError::Send {
                reason: e.to_string(),
            })?;
        info!(function = %call.function, endpoint = %self.endpoint, "socket subscribed");

        let function = call.function.clone();
        let stream = futures_util::stream::unfold(Some(socket), move |state| {
            let function = function.clone();
            async move {
                let mut socket = state?;
                loop {
                    let reason = match socket.next().await {
                        Some(Ok(Message::Text(text))) => match decode_frame(&text) {
                            Ok(event) => return Some((event, Some(socket))),
                            Err(err) => {
                                warn!(function = %function, error = %err, "undecodable frame skipped");
                                continue;
                            }
                        },
                        Some(Ok(Message::Close(frame))) => frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed by server".to_string()),
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => err.to_string(),
                        None => "socket ended".to_string(),
                    };
                    return Some((SubscriptionEvent::Disconnected { reason }, None));
                }
            }
        });
        Ok(stream.boxed())
    }
}

// ============================================================================
// COMBINED
// ============================================================================

/// HTTP for calls, WebSocket for subscriptions.
#[derive(Debug, Clone)]
pub struct RemoteBackend {
    http: HttpBackend,
    ws: WsBackend,
}

impl RemoteBackend {
    pub fn new(http: HttpBackend, ws: WsBackend) -> Self {
        Self { http, ws }
    }

    pub fn from_config(config: &ClientConfig) -> TetherResult<Self> {
        Ok(Self::new(
            HttpBackend::from_config(config)?,
            WsBackend::from_config(config),
        ))
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    async fn invoke(
        &self,
        kind: FunctionKind,
        call: &FunctionCall,
        auth: Option<&AuthToken>,
    ) -> TetherResult<Value> {
        Ok(self.http.call(kind, call, auth).await?.value)
    }

    async fn mutate(
        &self,
        call: &FunctionCall,
        auth: Option<&AuthToken>,
    ) -> TetherResult<CallOutcome> {
        self.http.call(FunctionKind::Mutation, call, auth).await
    }

    async fn subscribe(
        &self,
        call: &FunctionCall,
        auth: Option<&AuthToken>,
    ) -> TetherResult<SubscriptionStream> {
        self.ws.open(call, auth).await
    }
}

// ============================================================================
// TOKENS
// ============================================================================

/// Exchanges the session credential for a token at an auth endpoint.
#[derive(Debug, Clone)]
pub struct HttpTokenProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTokenProvider {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> TetherResult<Self> {
        let endpoint = endpoint.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Connect {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self { client, endpoint })
    }

    pub fn from_config(config: &ClientConfig) -> TetherResult<Self> {
        Self::new(config.auth_endpoint.clone(), config.request_timeout())
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn get_token(&self, session: &SessionCredential) -> TetherResult<Option<AuthToken>> {
        let lookup_failed = |reason: String| -> TetherError {
            IdentityError::LookupFailed { reason }.into()
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&TokenRequest {
                session: session.expose(),
            })
            .send()
            .await
            .map_err(|e| lookup_failed(e.to_string()))?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(IdentityError::Rejected {
                reason: format!("auth endpoint answered {}", status.as_u16()),
            }
            .into());
        }
        if !status.is_success() {
            return Err(lookup_failed(format!("auth endpoint answered {}", status.as_u16())));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| lookup_failed(e.to_string()))?;
        Ok(body.token.map(AuthToken::new))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_success_envelope_yields_value() {
        let outcome = decode_envelope("posts:get", r#"{"status":"success","value":{"n":1}}"#);
        assert_eq!(
            outcome.unwrap(),
            CallOutcome {
                value: json!({ "n": 1 }),
                version: None,
            }
        );
        let outcome = decode_envelope("posts:add", r#"{"status":"success","value":"p1","ts":42}"#);
        assert_eq!(outcome.unwrap().version, Some(ServerVersion(42)));
    }

    #[test]
    fn test_error_envelope_is_function_error() {
        let err = decode_envelope(
            "posts:get",
            r#"{"status":"error","errorMessage":"not found","errorData":{"code":404}}"#,
        )
        .unwrap_err();
        match err {
            TetherError::Function(FunctionError::Failed {
                function,
                message,
                data,
            }) => {
                assert_eq!(function, "posts:get");
                assert_eq!(message, "not found");
                assert_eq!(data, Some(json!({ "code": 404 })));
            }
            other => panic!("expected function error, got {:?}", other),
        }
    }

    #[test]
    fn test_garbage_envelope_is_transport_error() {
        let err = decode_envelope("posts:get", "<html>").unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn test_frames_decode() {
        assert_eq!(
            decode_frame(r#"{"type":"update","value":[1,2]}"#).unwrap(),
            SubscriptionEvent::update(json!([1, 2]))
        );
        assert_eq!(
            decode_frame(r#"{"type":"update","value":[],"ts":7}"#).unwrap(),
            SubscriptionEvent::Update {
                value: json!([]),
                version: Some(ServerVersion(7)),
            }
        );
        assert_eq!(
            decode_frame(r#"{"type":"error","errorMessage":"boom"}"#).unwrap(),
            SubscriptionEvent::FunctionError {
                message: "boom".to_string(),
                data: None,
            }
        );
        assert!(decode_frame(r#"{"type":"pong"}"#).is_err());
    }

    #[test]
    fn test_subscribe_frame_shape() {
        let args = json!({ "channel": "general" });
        let frame = serde_json::to_value(SubscribeFrame {
            kind: "subscribe",
            path: "messages:list",
            args: &args,
            token: None,
        })
        .unwrap();
        assert_eq!(
            frame,
            json!({ "type": "subscribe", "path": "messages:list", "args": { "channel": "general" }, "token": null })
        );
    }

    #[test]
    fn test_bearer_header() {
        let header = bearer(&AuthToken::new("abc")).unwrap();
        assert_eq!(header.to_str().unwrap(), "Bearer abc");
        assert!(bearer(&AuthToken::new("bad\ntoken")).is_err());
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let backend = HttpBackend::new("http://localhost:3210/", Duration::from_secs(1)).unwrap();
        assert_eq!(backend.base_url, "http://localhost:3210");
    }
}
