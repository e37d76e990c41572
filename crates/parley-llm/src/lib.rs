pub mod error;
pub mod provider;
pub mod providers;
pub mod sse;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transformer;

// Re-export core types
pub use error::{ConversionError, LLMError, Result};
pub use provider::{CompletionProvider, DeltaStream, ProviderConfig};
pub use providers::OpenRouterProvider;
pub use sse::{delta_stream, DONE_SENTINEL};
pub use transformer::OpenAiTransformer;
