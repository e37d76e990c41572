pub mod openai;

pub use openai::{CompletionBody, OpenAiTransformer};
