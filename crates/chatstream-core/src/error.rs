use thiserror::Error;

/// Everything that can go wrong between a submitted prompt and a persisted reply.
///
/// None of these are fatal to the process. Transport and protocol failures end
/// the current stream, parse failures only skip a single SSE line, and
/// persistence failures leave the transcript running in memory.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Completions API error {status}: {body}")]
    Protocol { status: u16, body: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid input: {0}")]
    Validation(String),
}

impl ChatError {
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// True for errors that are handled locally without ending a stream.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Parse(_) | Self::Persistence(_) | Self::Validation(_))
    }
}

impl From<rusqlite::Error> for ChatError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
