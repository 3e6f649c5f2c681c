#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tether_client::{Client, ClientBuilder};
use tether_core::{ReconnectConfig, SyncConfig};
use tether_test_utils::{MockBackend, MockTokenProvider};

pub fn fast_config(max_attempts: u32) -> SyncConfig {
    SyncConfig::default()
        .with_reconnect(ReconnectConfig {
            initial_ms: 5,
            max_ms: 20,
            multiplier: 2.0,
            jitter_ms: 0,
            max_attempts,
        })
        .with_overlay_settle_timeout_ms(200)
}

pub fn builder(backend: &MockBackend) -> ClientBuilder {
    Client::builder(Arc::new(backend.clone())).with_config(fast_config(50))
}

pub fn interactive(backend: &MockBackend) -> Client {
    builder(backend).build().unwrap()
}

pub fn with_tokens(backend: &MockBackend, tokens: &Arc<MockTokenProvider>) -> Client {
    builder(backend)
        .with_token_provider(tokens.clone())
        .with_session(tether_core::SessionCredential::new("alice"))
        .build()
        .unwrap()
}

/// Poll `check` until it holds, failing the test after two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
