//! Server-sent-event decoding for streaming completions.

use eventsource_stream::Eventsource;
use futures::{future, Stream, TryStreamExt};

use crate::error::LLMError;
use crate::provider::DeltaStream;
use crate::transformer::OpenAiTransformer;

/// Payload that marks the end of a completion stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Turn a raw SSE byte stream into text deltas.
///
/// Comment lines and non-`data` fields are dropped by the event parser. The stream
/// ends at the first `[DONE]` payload; undecodable payloads are skipped.
pub fn delta_stream<S, B, E>(bytes: S) -> DeltaStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let transformer = OpenAiTransformer::new();
    let stream = bytes
        .eventsource()
        .map_err(|e| LLMError::Stream(e.to_string()))
        .try_take_while(|event| future::ready(Ok::<_, LLMError>(event.data.trim() != DONE_SENTINEL)))
        .try_filter_map(move |event| {
            future::ready(Ok::<_, LLMError>(transformer.parse_stream_chunk(&event.data)))
        });
    Box::pin(stream)
}
