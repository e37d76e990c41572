pub mod config;

pub use config::ProviderConfig;

use async_trait::async_trait;
use futures::Stream;
use parley_core::CompletionRequest;
use std::pin::Pin;

use crate::error::Result;

/// Ordered text deltas of one streaming completion.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Completion provider trait
///
/// Both calls make exactly one upstream attempt; retry policy belongs to the caller.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Get the provider ID
    fn provider_id(&self) -> &str;

    /// Send a request and return the full reply text
    async fn complete(&self, request: CompletionRequest) -> Result<String>;

    /// Send a request and stream the reply as text deltas
    async fn stream(&self, request: CompletionRequest) -> Result<DeltaStream>;
}
