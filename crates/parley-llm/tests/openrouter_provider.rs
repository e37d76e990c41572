use futures::StreamExt;
use mockito::Matcher;
use parley_core::{CompletionRequest, PromptMessage};
use parley_llm::{CompletionProvider, LLMError, OpenRouterProvider, ProviderConfig};
use serde_json::json;
use std::time::Duration;

fn provider_for(server: &mockito::ServerGuard) -> OpenRouterProvider {
    let config = ProviderConfig::openrouter("Parley Chat", "http://localhost:8080")
        .with_base_url(server.url())
        .with_api_key("test-key")
        .with_timeout(Duration::from_secs(5));
    OpenRouterProvider::new(config).unwrap()
}

fn request() -> CompletionRequest {
    CompletionRequest::new("google/gemini-2.0-flash-001")
        .with_message(PromptMessage::user("hello"))
        .temperature(0.7)
        .max_tokens(1000)
}

#[tokio::test]
async fn complete_returns_first_choice() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/chat/completions")
        .match_header("authorization", "Bearer test-key")
        .match_header("x-title", "Parley Chat")
        .match_header("http-referer", "http://localhost:8080")
        .match_body(Matcher::PartialJson(json!({
            "model": "google/gemini-2.0-flash-001",
            "stream": false,
            "max_tokens": 1000,
            "messages": [{"role": "user", "content": "hello"}]
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id":"gen-1","choices":[{"message":{"role":"assistant","content":"Hi!"}}]}"#)
        .create_async()
        .await;

    let provider = provider_for(&server);
    let reply = tokio_test::assert_ok!(provider.complete(request()).await);

    assert_eq!(reply, "Hi!");
    mock.assert_async().await;
}

#[tokio::test]
async fn non_success_status_is_retryable_api_error() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/chat/completions")
        .with_status(502)
        .with_body("upstream unavailable")
        .expect(1)
        .create_async()
        .await;

    let provider = provider_for(&server);
    let err = provider.complete(request()).await.unwrap_err();

    match &err {
        LLMError::Api { status, message } => {
            assert_eq!(*status, 502);
            assert_eq!(message, "upstream unavailable");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(err.is_retryable());
    mock.assert_async().await;
}

#[tokio::test]
async fn undecodable_body_is_not_retryable() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_body(r#"{"error":{"message":"overloaded"}}"#)
        .create_async()
        .await;

    let provider = provider_for(&server);
    let err = provider.complete(request()).await.unwrap_err();

    assert!(matches!(err, LLMError::Decode(_)));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn stream_yields_deltas_until_done() {
    let body = concat!(
        ": OPENROUTER PROCESSING\n\n",
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n",
        "data: not-json\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\" world\"}}]}\n\n",
        "data: [DONE]\n\n",
    );

    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/chat/completions")
        .match_header("accept", "text/event-stream")
        .match_body(Matcher::PartialJson(json!({"stream": true})))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body)
        .create_async()
        .await;

    let provider = provider_for(&server);
    let stream = provider.stream(request().stream()).await.unwrap();
    let deltas: Vec<String> = stream.map(|d| d.unwrap()).collect().await;

    assert_eq!(deltas, vec!["Hello".to_string(), " world".to_string()]);
    mock.assert_async().await;
}

#[tokio::test]
async fn stream_open_failure_reports_status() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/chat/completions")
        .with_status(429)
        .with_body("slow down")
        .create_async()
        .await;

    let provider = provider_for(&server);
    let result = provider.stream(request()).await;

    assert!(matches!(result, Err(LLMError::Api { status: 429, .. })));
}
