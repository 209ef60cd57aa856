pub mod ai;
pub mod config;
pub mod controller;
pub mod error;
pub mod markdown;
pub mod sse;
pub mod state;
pub mod store;
pub mod transcript;

// Re-export main types for convenience
pub use ai::{CompletionSource, OpenAIClient, StreamEvent};
pub use config::{Config, StreamErrorPolicy};
pub use controller::{ChatSessionController, RenderedMessage, SessionUpdate};
pub use error::ChatError;
pub use markdown::{render_markdown, render_plain, SpanStyle, StyledLine, StyledSpan};
pub use sse::{SseParser, StreamChunk};
pub use state::{ChatMessage, ChatRole};
pub use store::{MemoryStore, SqliteStore, TranscriptStore};
pub use transcript::ChatTranscript;
pub use tokio_util::sync::CancellationToken;
