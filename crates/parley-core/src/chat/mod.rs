pub mod request;

pub use request::{CompletionOptions, CompletionRequest, PromptMessage};
