//! Scripted in-process provider for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use parley_core::CompletionRequest;

use crate::error::{LLMError, Result};
use crate::provider::{CompletionProvider, DeltaStream};

/// What one `stream` call yields.
#[derive(Debug)]
pub enum ScriptedStream {
    /// Yield each item, then end.
    Items(Vec<Result<String>>),
    /// Yield the deltas, then never produce another item.
    Stall(Vec<String>),
    /// Fail before any delta is produced.
    Fail(LLMError),
}

impl ScriptedStream {
    pub fn text(deltas: &[&str]) -> Self {
        Self::Items(deltas.iter().map(|d| Ok(d.to_string())).collect())
    }
}

/// Mock provider that replays scripted replies in order
#[derive(Debug, Default)]
pub struct MockProvider {
    completions: Mutex<VecDeque<Result<String>>>,
    streams: Mutex<VecDeque<ScriptedStream>>,
    requests: Mutex<Vec<CompletionRequest>>,
    complete_calls: AtomicUsize,
    stream_calls: AtomicUsize,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next `complete` call
    pub fn with_completion(self, result: Result<String>) -> Self {
        self.completions.lock().push_back(result);
        self
    }

    /// Queue the behaviour of the next `stream` call
    pub fn with_stream(self, script: ScriptedStream) -> Self {
        self.streams.lock().push_back(script);
        self
    }

    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    /// Every request seen so far, in call order
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }
}

fn unscripted() -> LLMError {
    LLMError::Api {
        status: 503,
        message: "no scripted response".to_string(),
    }
}

#[async_trait]
impl CompletionProvider for MockProvider {
    fn provider_id(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request);
        self.completions
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(unscripted()))
    }

    async fn stream(&self, request: CompletionRequest) -> Result<DeltaStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request);
        let script = self
            .streams
            .lock()
            .pop_front()
            .unwrap_or_else(|| ScriptedStream::Fail(unscripted()));

        match script {
            ScriptedStream::Items(items) => Ok(Box::pin(stream::iter(items))),
            ScriptedStream::Stall(deltas) => Ok(Box::pin(
                stream::iter(deltas.into_iter().map(Ok)).chain(stream::pending::<Result<String>>()),
            )),
            ScriptedStream::Fail(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replays_in_order() {
        let provider = MockProvider::new()
            .with_completion(Err(LLMError::Network("down".into())))
            .with_completion(Ok("second".into()))
            .with_stream(ScriptedStream::text(&["a", "b"]));

        assert!(provider.complete(CompletionRequest::new("m")).await.is_err());
        assert_eq!(provider.complete(CompletionRequest::new("m")).await.unwrap(), "second");
        assert!(provider.complete(CompletionRequest::new("m")).await.is_err());
        assert_eq!(provider.complete_calls(), 3);

        let deltas: Vec<_> = provider
            .stream(CompletionRequest::new("m"))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(deltas.len(), 2);
        assert_eq!(provider.stream_calls(), 1);
        assert_eq!(provider.requests().len(), 4);
    }
}
