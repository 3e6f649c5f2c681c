mod support;

use serde_json::json;
use std::sync::Arc;
use support::{builder, eventually};
use tether_cache::HydrationPayload;
use tether_client::Client;
use tether_core::{DataSource, PaginatedQueryOptions, PaginationStatus, QueryOptions, QueryStatus};
use tether_test_utils::{numbered_items, paginate, MockBackend};

fn public() -> QueryOptions {
    QueryOptions::default().with_public(true)
}

async fn render(backend: &MockBackend) -> HydrationPayload {
    let server = Client::server(Arc::new(backend.clone()), "req-1").unwrap();
    let posts = server.query("posts:list", json!({}), public()).await.unwrap();
    assert_eq!(posts.data(), Some(json!(["a"])));
    assert_eq!(posts.data_source(), Some(DataSource::Fetch));
    let payload = server.into_hydration_payload().unwrap();
    // Crosses the render boundary as JSON.
    HydrationPayload::from_json(&payload.to_json().unwrap()).unwrap()
}

#[tokio::test]
async fn hydrated_query_makes_no_remote_call() {
    let backend = MockBackend::new();
    backend.with_value("posts:list", json!(["a"]));
    let payload = render(&backend).await;
    assert_eq!(payload.request_id, "req-1");
    assert_eq!(payload.entries.len(), 1);
    assert_eq!(backend.invoke_count("posts:list"), 1);
    assert_eq!(backend.subscribe_count("posts:list"), 0);

    let client = builder(&backend).with_hydration(payload).build().unwrap();
    let first = client.query("posts:list", json!({}), public()).await.unwrap();
    assert_eq!(first.data(), Some(json!(["a"])));
    assert_eq!(first.data_source(), Some(DataSource::Hydrated));
    let second = client.query("posts:list", json!({}), public()).await.unwrap();
    assert_eq!(second.data(), Some(json!(["a"])));

    assert_eq!(backend.total_calls("posts:list"), 1);
    assert_eq!(client.multiplexer().active_channels(), 0);

    assert_eq!(client.take_over().await, 0);
    eventually(|| backend.subscribe_count("posts:list") == 1).await;
    assert_eq!(client.multiplexer().subscriber_count(first.key()), 2);

    backend.with_value("posts:list", json!(["a", "b"]));
    backend.notify("posts:list");
    eventually(|| second.data() == Some(json!(["a", "b"]))).await;
    assert_eq!(first.data_source(), Some(DataSource::Subscription));
}

#[tokio::test]
async fn take_over_discards_unclaimed_results() {
    let backend = MockBackend::new();
    backend.with_value("posts:list", json!(["a"]));
    backend.with_value("users:me", json!({ "name": "alice" }));

    let server = Client::server(Arc::new(backend.clone()), "req-2").unwrap();
    let _posts = server.query("posts:list", json!({}), public()).await.unwrap();
    let _me = server.query("users:me", json!({}), public()).await.unwrap();
    let payload = server.hydration_payload().unwrap();
    assert_eq!(payload.entries.len(), 2);

    let client = builder(&backend).with_hydration(payload).build().unwrap();
    let _posts = client.query("posts:list", json!({}), public()).await.unwrap();
    assert_eq!(client.take_over().await, 1);
    assert!(client.hydration().is_closed());

    // The unclaimed key is fetched live like any other.
    let me = client.query("users:me", json!({}), public()).await.unwrap();
    assert_eq!(me.data_source(), Some(DataSource::Subscription));
    assert_eq!(backend.subscribe_count("users:me"), 1);
}

#[tokio::test]
async fn server_render_skips_client_only_queries() {
    let backend = MockBackend::new();
    backend.with_value("posts:list", json!(["a"]));
    let server = Client::server(Arc::new(backend.clone()), "req-3").unwrap();
    let query = server
        .query("posts:list", json!({}), public().with_server(false))
        .await
        .unwrap();
    assert_eq!(query.status(), QueryStatus::Pending);
    assert_eq!(backend.total_calls("posts:list"), 0);
    assert!(server.hydration_payload().unwrap().entries.is_empty());
}

#[tokio::test]
async fn interactive_client_records_nothing() {
    let backend = MockBackend::new();
    backend.with_value("posts:list", json!(["a"]));
    let client = builder(&backend).build().unwrap();
    let _query = client.query("posts:list", json!({}), public()).await.unwrap();
    assert!(client.hydration_payload().is_none());
    assert!(client.hydration().is_empty());
}

#[tokio::test]
async fn hydrated_first_page_makes_no_remote_call() {
    let backend = MockBackend::new();
    let items = numbered_items("m", 5);
    backend.on_query("messages:list", move |args| paginate(&items, args));
    let options = PaginatedQueryOptions::default()
        .with_initial_num_items(2)
        .with_public(true);

    let server = Client::server(Arc::new(backend.clone()), "req-4").unwrap();
    let rendered = server
        .paginated_query("messages:list", json!({}), options.clone())
        .await
        .unwrap();
    assert_eq!(rendered.results().len(), 2);
    let payload = server.hydration_payload().unwrap();
    assert_eq!(backend.invoke_count("messages:list"), 1);

    let client = builder(&backend).with_hydration(payload).build().unwrap();
    let list = client
        .paginated_query("messages:list", json!({}), options)
        .await
        .unwrap();
    assert_eq!(list.status(), PaginationStatus::CanLoadMore);
    let ids: Vec<_> = list.results().iter().map(|m| m["_id"].clone()).collect();
    assert_eq!(ids, vec![json!("m0"), json!("m1")]);
    assert_eq!(backend.total_calls("messages:list"), 1);

    client.take_over().await;
    eventually(|| backend.subscribe_count("messages:list") == 1).await;
}
