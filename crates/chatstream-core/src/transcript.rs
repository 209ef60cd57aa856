//! Ordered, persisted chat log
//!
//! Every mutation rewrites the whole transcript under a single key. Writes go
//! to a background thread that owns the store, so a slow disk never holds up
//! the task applying deltas. Pending blobs are coalesced: only the newest one
//! is written. A failed write is logged and the next mutation tries again.

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{ChatError, Result};
use crate::state::{ChatMessage, ChatRole};
use crate::store::TranscriptStore;

pub const HISTORY_KEY: &str = "chat_history";

const SCHEMA_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct PersistedTranscript {
    version: u32,
    messages: Vec<ChatMessage>,
}

enum WriteRequest {
    Save(String),
    Flush(std_mpsc::Sender<Result<()>>),
}

/// Background thread that owns the store and applies queued writes.
struct HistoryWriter {
    tx: Option<mpsc::UnboundedSender<WriteRequest>>,
    handle: Option<JoinHandle<()>>,
}

impl HistoryWriter {
    fn spawn(store: Box<dyn TranscriptStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = std::thread::spawn(move || {
            let mut last_error: Option<String> = None;

            while let Some(request) = rx.blocking_recv() {
                let mut latest = None;
                let mut waiters = Vec::new();

                let mut next = Some(request);
                while let Some(request) = next {
                    match request {
                        WriteRequest::Save(blob) => latest = Some(blob),
                        WriteRequest::Flush(waiter) => waiters.push(waiter),
                    }
                    next = rx.try_recv().ok();
                }

                if let Some(blob) = latest {
                    last_error = match store.save(HISTORY_KEY, &blob) {
                        Ok(()) => None,
                        Err(e) => {
                            warn!(error = %e, "failed to save chat history");
                            Some(e.to_string())
                        }
                    };
                }

                for waiter in waiters {
                    let result = match &last_error {
                        Some(msg) => Err(ChatError::persistence(msg.clone())),
                        None => Ok(()),
                    };
                    let _ = waiter.send(result);
                }
            }
        });

        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    fn send(&self, request: WriteRequest) -> bool {
        self.tx
            .as_ref()
            .is_some_and(|tx| tx.send(request).is_ok())
    }
}

impl Drop for HistoryWriter {
    fn drop(&mut self) {
        // Closing the channel lets the thread write what is queued and exit
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("chat history writer panicked");
            }
        }
    }
}

pub struct ChatTranscript {
    messages: Vec<ChatMessage>,
    writer: HistoryWriter,
}

impl ChatTranscript {
    /// Start an empty transcript without reading the store.
    pub fn new(store: Box<dyn TranscriptStore>) -> Self {
        Self {
            messages: Vec::new(),
            writer: HistoryWriter::spawn(store),
        }
    }

    /// Load the persisted transcript, falling back to an empty one when the
    /// stored blob is missing or unreadable.
    pub fn load(store: Box<dyn TranscriptStore>) -> Self {
        let messages = match read_persisted(store.as_ref()) {
            Ok(messages) => {
                debug!(count = messages.len(), "loaded chat history");
                messages
            }
            Err(e) => {
                warn!(error = %e, "could not load chat history, starting empty");
                Vec::new()
            }
        };
        Self {
            messages,
            writer: HistoryWriter::spawn(store),
        }
    }

    /// Queue the full transcript for writing. Returns without waiting on the store.
    pub fn save(&self) {
        let blob = serde_json::to_string(&PersistedTranscript {
            version: SCHEMA_VERSION,
            messages: self.messages.clone(),
        });
        match blob {
            Ok(blob) => {
                if !self.writer.send(WriteRequest::Save(blob)) {
                    warn!("chat history writer is gone, change not saved");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize chat history"),
        }
    }

    /// Block until every queued write has reached the store.
    ///
    /// Returns the error of the most recent write, if it failed.
    pub fn flush(&self) -> Result<()> {
        let (tx, rx) = std_mpsc::channel();
        if !self.writer.send(WriteRequest::Flush(tx)) {
            return Err(ChatError::persistence("chat history writer is gone"));
        }
        rx.recv()
            .map_err(|_| ChatError::persistence("chat history writer is gone"))?
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Add a message to the end and return its index.
    pub fn append(&mut self, message: ChatMessage) -> usize {
        self.messages.push(message);
        self.save();
        self.messages.len() - 1
    }

    /// Index of the assistant entry following the most recent user entry.
    pub fn trailing_assistant(&self) -> Option<usize> {
        let after_user = self
            .messages
            .iter()
            .rposition(|m| m.role == ChatRole::User)
            .map_or(0, |i| i + 1);

        self.messages[after_user..]
            .iter()
            .rposition(|m| m.role == ChatRole::Assistant)
            .map(|i| after_user + i)
    }

    /// Replace the trailing assistant entry's content, appending a new
    /// assistant entry if there is none. Returns the entry's index.
    pub fn replace_trailing_assistant(&mut self, content: &str) -> usize {
        if let Some(index) = self.trailing_assistant() {
            if self.replace_at(index, content) {
                return index;
            }
        }
        self.append(ChatMessage::assistant(content))
    }

    /// Replace the content of the assistant entry at `index`.
    ///
    /// Returns false, changing nothing, if `index` is not an assistant entry.
    pub fn replace_at(&mut self, index: usize, content: &str) -> bool {
        let Some(message) = self.messages.get_mut(index) else {
            return false;
        };
        if message.role != ChatRole::Assistant {
            return false;
        }
        message.content.clear();
        message.content.push_str(content);
        self.save();
        true
    }

    /// Remove the assistant entry at `index`.
    pub fn remove_assistant(&mut self, index: usize) -> Option<ChatMessage> {
        if self.messages.get(index)?.role != ChatRole::Assistant {
            return None;
        }
        let removed = self.messages.remove(index);
        self.save();
        Some(removed)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.save();
    }
}

fn read_persisted(store: &dyn TranscriptStore) -> Result<Vec<ChatMessage>> {
    let Some(blob) = store.load(HISTORY_KEY)? else {
        return Ok(Vec::new());
    };
    let persisted: PersistedTranscript = serde_json::from_str(&blob)?;
    if persisted.version != SCHEMA_VERSION {
        return Err(ChatError::persistence(format!(
            "unsupported history version {}",
            persisted.version
        )));
    }
    Ok(persisted.messages)
}
