pub mod openai;

pub use openai::OpenAIClient;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ChatError;
use crate::sse::StreamChunk;

/// One event from an in-flight completion stream.
///
/// A stream ends with a terminal chunk, a `Failed` event, or the channel
/// simply closing when the transport closes.
#[derive(Debug)]
pub enum StreamEvent {
    Chunk(StreamChunk),
    Failed(ChatError),
}

/// Anything that can turn a prompt into a stream of completion chunks.
///
/// The stream runs in the background and must stop emitting once `cancel`
/// fires.
pub trait CompletionSource: Send + Sync {
    fn stream(&self, prompt: &str, cancel: CancellationToken) -> mpsc::Receiver<StreamEvent>;
}
