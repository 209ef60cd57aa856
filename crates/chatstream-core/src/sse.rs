//! Server-sent event framing for streamed chat completions
//!
//! The transport hands over byte blocks with arbitrary boundaries. A line (and
//! even a multi-byte character) can be split across two blocks, so the parser
//! keeps the unterminated tail and only interprets complete lines.

use serde::Deserialize;
use tracing::debug;

const DATA_PREFIX: &str = "data:";
const DONE_SENTINEL: &str = "[DONE]";

/// One `data:` event from the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub raw_line: String,
    pub is_terminal: bool,
    /// Empty for role-only chunks and for payloads that failed to parse
    pub delta_text: String,
}

impl StreamChunk {
    fn terminal(raw_line: String) -> Self {
        Self {
            raw_line,
            is_terminal: true,
            delta_text: String::new(),
        }
    }

    pub fn has_delta(&self) -> bool {
        !self.is_terminal && !self.delta_text.is_empty()
    }
}

#[derive(Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Extract `choices[0].delta.content` from one event payload.
pub fn parse_delta(payload: &str) -> Option<String> {
    match serde_json::from_str::<ChunkPayload>(payload) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content),
        Err(e) => {
            debug!(error = %e, "skipping malformed stream payload");
            None
        }
    }
}

/// Line-buffered SSE parser carried across transport callbacks
#[derive(Debug, Default)]
pub struct SseParser {
    pending: Vec<u8>,
    finished: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the `[DONE]` sentinel has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed one delivered byte block and return the chunks it completed.
    ///
    /// Nothing is returned after the terminal chunk.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamChunk> {
        if self.finished {
            return Vec::new();
        }
        self.pending.extend_from_slice(bytes);

        let mut chunks = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(chunk) = self.parse_line(&line[..pos]) {
                let terminal = chunk.is_terminal;
                chunks.push(chunk);
                if terminal {
                    self.pending.clear();
                    break;
                }
            }
        }
        chunks
    }

    /// Flush a trailing line that arrived without a newline before the
    /// transport closed.
    pub fn finish(&mut self) -> Option<StreamChunk> {
        if self.finished || self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        self.parse_line(&line)
    }

    fn parse_line(&mut self, raw: &[u8]) -> Option<StreamChunk> {
        let line = String::from_utf8_lossy(raw);
        let line = line.strip_suffix('\r').unwrap_or(&line);

        let payload = line.strip_prefix(DATA_PREFIX)?;
        let payload = payload.strip_prefix(' ').unwrap_or(payload);

        if payload.trim() == DONE_SENTINEL {
            self.finished = true;
            return Some(StreamChunk::terminal(line.to_string()));
        }

        Some(StreamChunk {
            raw_line: line.to_string(),
            is_terminal: false,
            delta_text: parse_delta(payload).unwrap_or_default(),
        })
    }
}
