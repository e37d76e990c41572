use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use parley_config::Config;
use parley_llm::testing::MockProvider;
use parley_llm::LLMError;
use parley_server::{create_router, AppState};
use parley_store::{
    ChatStore, JsonFileStore, JsonFileStoreConfig, MemoryChatStore, NewChat, NewMessage,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

struct Api {
    router: Router,
    provider: Arc<MockProvider>,
    store: Arc<MemoryChatStore>,
    _shutdown: tokio_util::sync::DropGuard,
}

fn api(provider: MockProvider) -> Api {
    let provider = Arc::new(provider);
    let store = Arc::new(MemoryChatStore::new());
    let shutdown = CancellationToken::new();
    let (state, _task) = AppState::build(
        &Config::default(),
        provider.clone(),
        store.clone(),
        shutdown.clone(),
    );
    Api {
        router: create_router(state, true),
        provider,
        store,
        _shutdown: shutdown.drop_guard(),
    }
}

async fn file_router(dir: &TempDir) -> (Router, tokio_util::sync::DropGuard) {
    let store = JsonFileStore::open(JsonFileStoreConfig::new(dir.path()).without_sync())
        .await
        .unwrap();
    let shutdown = CancellationToken::new();
    let (state, _task) = AppState::build(
        &Config::default(),
        Arc::new(MockProvider::new()),
        Arc::new(store),
        shutdown.clone(),
    );
    (create_router(state, false), shutdown.drop_guard())
}

async fn call(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn put_json(uri: &str, body: Value) -> Request<Body> {
    Request::put(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::delete(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health_reports_connections() {
    let api = api(MockProvider::new());
    let (status, body) = call(&api.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["connections"], 0);
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_list_and_get_chats() {
    let api = api(MockProvider::new());
    for title in ["first", "second"] {
        let chat = api
            .store
            .create_chat(NewChat {
                title: title.into(),
                user_id: "alice".into(),
            })
            .await
            .unwrap();
        api.store
            .create_message(NewMessage::user(chat.id, format!("hi from {}", title)))
            .await
            .unwrap();
    }
    api.store
        .create_chat(NewChat {
            title: "other".into(),
            user_id: "bob".into(),
        })
        .await
        .unwrap();

    let (status, body) = call(&api.router, get("/api/v1/chats?userId=alice&page=1&pageSize=1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 2);
    assert_eq!(body["chats"].as_array().unwrap().len(), 1);
    assert_eq!(body["chats"][0]["title"], "second");

    let (status, body) = call(&api.router, get("/api/v1/chats/1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["title"], "first");
    assert_eq!(body["messages"][0]["content"], "hi from first");

    let (status, body) = call(&api.router, get("/api/v1/chats/99")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test(start_paused = true)]
async fn test_send_message_retries_then_replies() {
    let api = api(
        MockProvider::new()
            .with_completion(Err(LLMError::Network("reset".into())))
            .with_completion(Err(LLMError::Api {
                status: 503,
                message: "busy".into(),
            }))
            .with_completion(Ok("third time lucky".into())),
    );

    let started = tokio::time::Instant::now();
    let (status, body) = call(
        &api.router,
        post_json("/api/v1/chats/0/messages", json!({ "content": "hello", "userId": "alice" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"]["content"], "third time lucky");
    assert_eq!(body["message"]["role"], "assistant");
    assert_eq!(api.provider.complete_calls(), 3);
    assert!(started.elapsed() >= Duration::from_secs(4));

    let chat_id = body["chatId"].as_u64().unwrap();
    let chat = api.store.get_chat(chat_id).await.unwrap();
    assert_eq!(chat.title, "hello");
    assert_eq!(chat.messages.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_send_message_surfaces_upstream_failure() {
    let api = api(MockProvider::new());
    let (status, body) = call(
        &api.router,
        post_json("/api/v1/chats/0/messages", json!({ "content": "hello" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["code"], "UPSTREAM_REQUEST_FAILED");

    // the user turn was stored before generation
    let chats = api
        .store
        .list_chats("anonymous", parley_store::Page::new(1, 20))
        .await
        .unwrap();
    assert_eq!(chats.chats[0].message_count, 1);
}

#[tokio::test]
async fn test_send_message_rejects_empty_content() {
    let api = api(MockProvider::new());
    let (status, body) = call(
        &api.router,
        post_json("/api/v1/chats/0/messages", json!({ "content": "   " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");
    assert_eq!(api.store.chat_count().await, 0);
}

#[tokio::test]
async fn test_broadcast_is_accepted() {
    let api = api(MockProvider::new());
    let (status, body) = call(
        &api.router,
        post_json("/api/v1/broadcast", json!({ "message": "hello everyone" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["recipients"], 0);
}

#[tokio::test]
async fn test_chat_lifecycle_on_disk() {
    let dir = TempDir::new().unwrap();
    let (router, _guard) = file_router(&dir).await;

    let (status, created) = call(
        &router,
        post_json("/api/v1/chats", json!({ "title": " Trip plans ", "userId": "alice" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["title"], "Trip plans");
    assert_eq!(created["message_count"], 0);
    let chat_id = created["id"].as_u64().unwrap();

    let (status, renamed) = call(
        &router,
        put_json(&format!("/api/v1/chats/{}", chat_id), json!({ "title": "Lisbon" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(renamed["title"], "Lisbon");

    let (status, _) = call(&router, delete(&format!("/api/v1/chats/{}", chat_id))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(!dir
        .path()
        .join("chats")
        .join(format!("{}.json", chat_id))
        .exists());

    let (status, body) = call(&router, delete(&format!("/api/v1/chats/{}", chat_id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_create_and_rename_reject_blank_titles() {
    let api = api(MockProvider::new());
    let (status, body) = call(&api.router, post_json("/api/v1/chats", json!({ "title": "  " }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_REQUEST");
    assert_eq!(api.store.chat_count().await, 0);

    let (status, _) = call(&api.router, put_json("/api/v1/chats/1", json!({ "title": "x" }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_messages_is_paginated() {
    let api = api(MockProvider::new());
    let chat = api
        .store
        .create_chat(NewChat {
            title: "long".into(),
            user_id: "alice".into(),
        })
        .await
        .unwrap();
    for i in 1..=5 {
        api.store
            .create_message(NewMessage::user(chat.id, format!("turn {}", i)))
            .await
            .unwrap();
    }

    let (status, body) = call(
        &api.router,
        get(&format!("/api/v1/chats/{}/messages?page=2&pageSize=2", chat.id)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 5);
    assert_eq!(body["page"], 2);
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["content"], "turn 3");
    assert_eq!(messages[1]["content"], "turn 4");

    let (status, _) = call(&api.router, get("/api/v1/chats/99/messages")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
