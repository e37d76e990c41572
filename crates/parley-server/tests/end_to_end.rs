//! Full relay: inbound loop, registry, orchestrator, bridge, memory store and a
//! scripted provider, with a channel standing in for the socket.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use futures::stream::{self, BoxStream, StreamExt};
use parley_config::Config;
use parley_core::Role;
use parley_gateway::{serve_connection, ChannelSink, Connection, ExitReason, Frame};
use parley_llm::testing::{MockProvider, ScriptedStream};
use parley_llm::LLMError;
use parley_server::AppState;
use parley_store::{ChatStore, MemoryChatStore, NewChat};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Relay {
    state: AppState,
    provider: Arc<MockProvider>,
    store: Arc<MemoryChatStore>,
    shutdown: CancellationToken,
}

impl Relay {
    fn start(provider: MockProvider) -> Self {
        let provider = Arc::new(provider);
        let store = Arc::new(MemoryChatStore::new());
        let shutdown = CancellationToken::new();
        let mut config = Config::default();
        config.llm.model = "test-model".to_string();

        let (state, _registry_task) =
            AppState::build(&config, provider.clone(), store.clone(), shutdown.clone());
        Self {
            state,
            provider,
            store,
            shutdown,
        }
    }

    fn connect(&self, user_id: &str) -> Client {
        let (sink, frames) = ChannelSink::new();
        let connection = Arc::new(Connection::new(user_id, sink));
        let (input, rx) = mpsc::unbounded_channel::<Result<Message, axum::Error>>();
        let incoming: BoxStream<'static, Result<Message, axum::Error>> =
            stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
                .boxed();

        let registry = self.state.registry.clone();
        let dispatcher = self.state.dispatcher.clone();
        let inbound = self.state.inbound.clone();
        let conn = connection.clone();
        let task = tokio::spawn(async move {
            serve_connection(conn, incoming, &registry, &dispatcher, &inbound).await
        });

        Client {
            connection,
            frames,
            input,
            task,
        }
    }

    async fn wait_for_members(&self, expected: usize) {
        tokio::time::timeout(Duration::from_secs(30), async {
            while self.state.registry.connection_count().await != expected {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("registry never reached the expected size");
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Client {
    connection: Arc<Connection>,
    frames: mpsc::UnboundedReceiver<Frame>,
    input: mpsc::UnboundedSender<Result<Message, axum::Error>>,
    task: JoinHandle<ExitReason>,
}

impl Client {
    fn send(&self, envelope: Value) {
        self.input
            .send(Ok(Message::Text(envelope.to_string())))
            .expect("read loop stopped");
    }

    fn send_chat(&self, chat_id: Value, content: &str) {
        self.send(json!({
            "type": "chat_message",
            "content": { "chatId": chat_id, "content": content, "role": "user" }
        }));
    }

    async fn next_json(&mut self) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(30), self.frames.recv())
                .await
                .expect("timed out waiting for a frame")
                .expect("connection sink closed");
            if let Frame::Text(text) = frame {
                return serde_json::from_str(&text).expect("frame is not JSON");
            }
        }
    }

    /// Frames up to and including the terminal or error frame
    async fn reply(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        loop {
            let frame = self.next_json().await;
            let done = frame["type"] == "error" || frame["content"]["metadata"]["complete"] == true;
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }
}

fn text_of(frames: &[Value]) -> String {
    frames
        .iter()
        .filter_map(|f| f["content"]["content"].as_str())
        .collect()
}

#[tokio::test]
async fn test_hello_creates_chat_and_streams_reply() {
    let relay = Relay::start(
        MockProvider::new().with_stream(ScriptedStream::text(&["Hi", " there", "!"])),
    );
    let mut client = relay.connect("alice");

    client.send_chat(json!(0), "hello");
    let frames = client.reply().await;

    assert_eq!(frames[0]["type"], "typing");
    assert_eq!(text_of(&frames), "Hi there!");
    let terminal = frames.last().unwrap();
    assert_eq!(terminal["type"], "chat_message");
    assert_eq!(terminal["content"]["metadata"]["complete"], true);
    assert!(terminal["content"]["metadata"]["processingTime"].is_u64());

    let chat_id = terminal["content"]["metadata"]["chatId"].as_u64().unwrap();
    let chat = relay.store.get_chat(chat_id).await.unwrap();
    assert_eq!(chat.title, "hello");
    assert_eq!(chat.user_id, "alice");
    assert_eq!(chat.messages.len(), 2);
    assert_eq!(chat.messages[0].role, Role::User);
    assert_eq!(chat.messages[0].content, "hello");
    assert_eq!(chat.messages[1].role, Role::Assistant);
    assert_eq!(chat.messages[1].content, "Hi there!");
    assert_eq!(chat.messages[1].metadata.token_count, Some(2));
}

#[tokio::test]
async fn test_numeric_and_string_chat_ids_reach_same_chat() {
    let relay = Relay::start(
        MockProvider::new()
            .with_stream(ScriptedStream::text(&["first"]))
            .with_stream(ScriptedStream::text(&["second"])),
    );
    let mut last = 0;
    for i in 0..42 {
        last = relay
            .store
            .create_chat(NewChat {
                title: format!("chat {}", i),
                user_id: "alice".into(),
            })
            .await
            .unwrap()
            .id;
    }
    assert_eq!(last, 42);

    let mut client = relay.connect("alice");
    client.send_chat(json!(42), "as number");
    let first = client.reply().await;
    client.send_chat(json!("42"), "as string");
    let second = client.reply().await;

    assert_eq!(first.last().unwrap()["content"]["metadata"]["chatId"], 42);
    assert_eq!(second.last().unwrap()["content"]["metadata"]["chatId"], 42);

    let chat = relay.store.get_chat(42).await.unwrap();
    let contents: Vec<_> = chat.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["as number", "first", "as string", "second"]);
    assert_eq!(relay.store.chat_count().await, 42);

    // the second request carried the first exchange as history
    let requests = relay.provider.requests();
    assert_eq!(requests[1].messages.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_stream_stores_prefix_once() {
    // the fallback exhausts its attempts on unscripted completions
    let relay = Relay::start(MockProvider::new().with_stream(ScriptedStream::Items(vec![
        Ok("The answer ".into()),
        Ok("is".into()),
        Err(LLMError::Stream("upstream reset".into())),
    ])));
    let mut client = relay.connect("alice");

    client.send_chat(json!(null), "question");
    let frames = client.reply().await;
    let error = frames.last().unwrap();
    assert_eq!(error["type"], "error");
    assert_eq!(error["content"]["code"], "UPSTREAM_REQUEST_FAILED");
    assert_eq!(relay.provider.complete_calls(), 3);

    let chats = relay
        .store
        .list_chats("alice", parley_store::Page::new(1, 20))
        .await
        .unwrap();
    assert_eq!(chats.total, 1);
    let chat = relay.store.get_chat(chats.chats[0].id).await.unwrap();
    let assistant: Vec<_> = chat
        .messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .collect();
    assert_eq!(assistant.len(), 1);
    assert_eq!(assistant[0].content, "The answer is");
    assert!(assistant[0].metadata.partial);

    // the connection survives a failed request
    assert!(client.connection.is_connected());
}

#[tokio::test]
async fn test_fallback_replies_in_one_frame() {
    let relay = Relay::start(
        MockProvider::new()
            .with_stream(ScriptedStream::Fail(LLMError::Api {
                status: 500,
                message: "stream unavailable".into(),
            }))
            .with_completion(Ok("complete reply".into())),
    );
    let mut client = relay.connect("alice");

    client.send_chat(json!(0), "hello");
    let frames = client.reply().await;
    let last = frames.last().unwrap();
    assert_eq!(last["content"]["content"], "complete reply");
    assert_eq!(last["content"]["metadata"]["complete"], true);

    let chat_id = last["content"]["metadata"]["chatId"].as_u64().unwrap();
    let chat = relay.store.get_chat(chat_id).await.unwrap();
    assert_eq!(chat.messages[1].content, "complete reply");
    assert!(!chat.messages[1].metadata.partial);
}

#[tokio::test]
async fn test_unknown_type_keeps_client_registered() {
    let relay = Relay::start(MockProvider::new());
    let mut client = relay.connect("alice");
    relay.wait_for_members(1).await;

    client.send(json!({ "type": "teleport" }));
    let frame = client.next_json().await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["content"]["code"], "UNKNOWN_MESSAGE_TYPE");

    client.send(json!({ "type": "ping" }));
    assert_eq!(client.next_json().await["type"], "pong");
    assert_eq!(relay.state.registry.connection_count().await, 1);

    drop(client.input);
    assert_eq!(client.task.await.unwrap(), ExitReason::PeerClosed);
    relay.wait_for_members(0).await;
}

#[tokio::test]
async fn test_invalid_chat_id_is_rejected() {
    let relay = Relay::start(MockProvider::new());
    let mut client = relay.connect("alice");

    client.send_chat(json!("forty-two"), "hello");
    let frame = client.next_json().await;
    assert_eq!(frame["content"]["code"], "INVALID_CHAT_ID");
    assert_eq!(relay.provider.stream_calls(), 0);
    assert_eq!(relay.store.chat_count().await, 0);
}

#[tokio::test]
async fn test_broadcast_reaches_every_client() {
    let relay = Relay::start(MockProvider::new());
    let mut clients: Vec<_> = ["a", "b", "c"].iter().map(|u| relay.connect(u)).collect();
    relay.wait_for_members(3).await;

    relay
        .state
        .registry
        .broadcast_envelope(&parley_gateway::ServerEnvelope::system("restarting soon"))
        .await
        .unwrap();

    for client in clients.iter_mut() {
        let frame = client.next_json().await;
        assert_eq!(frame["type"], "system");
        assert_eq!(frame["content"]["message"], "restarting soon");
    }
    assert_eq!(relay.state.registry.connection_count().await, 3);
}
