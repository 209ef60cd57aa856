//! Prompt submission and live reconciliation of streamed replies
//!
//! The controller is the only writer of the transcript. The network side runs
//! in a background task, but every delta is applied here, on whichever task
//! drives [`ChatSessionController::next_update`], so transcript writes are
//! never interleaved. At most one stream is active: submitting a prompt
//! cancels the previous session and drops its receiver, so late deltas from a
//! superseded stream can't reach the transcript.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ai::{CompletionSource, StreamEvent};
use crate::config::StreamErrorPolicy;
use crate::error::{ChatError, Result};
use crate::markdown::{render_markdown, StyledLine};
use crate::state::{ChatMessage, ChatRole};
use crate::transcript::ChatTranscript;

/// What changed after applying one stream event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    /// The trailing assistant entry has new content; re-render.
    TranscriptChanged,
    /// A chunk arrived that carried no text.
    Unchanged,
    /// The stream ended normally and the controller is idle again.
    Finished,
    /// The stream failed and the controller is idle again.
    Failed(String),
}

/// A transcript entry rendered for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub role: ChatRole,
    pub lines: Vec<StyledLine>,
}

/// Transient state of one in-flight request
struct StreamingSession {
    id: u64,
    accumulated: String,
    cancel: CancellationToken,
    events: mpsc::Receiver<StreamEvent>,
    assistant_index: Option<usize>,
}

pub struct ChatSessionController {
    transcript: ChatTranscript,
    source: Arc<dyn CompletionSource>,
    policy: StreamErrorPolicy,
    session: Option<StreamingSession>,
    next_session_id: u64,
    last_error: Option<String>,
}

impl ChatSessionController {
    pub fn new(
        transcript: ChatTranscript,
        source: Arc<dyn CompletionSource>,
        policy: StreamErrorPolicy,
    ) -> Self {
        Self {
            transcript,
            source,
            policy,
            session: None,
            next_session_id: 1,
            last_error: None,
        }
    }

    pub fn transcript(&self) -> &ChatTranscript {
        &self.transcript
    }

    pub fn is_streaming(&self) -> bool {
        self.session.is_some()
    }

    /// Text received so far by the active session.
    pub fn accumulated_text(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.accumulated.as_str())
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Submit a prompt. Returns false, touching nothing, for a blank prompt.
    pub fn send_prompt(&mut self, text: &str) -> bool {
        let prompt = match validate_prompt(text) {
            Ok(prompt) => prompt,
            Err(e) => {
                debug!(error = %e, "ignoring prompt");
                return false;
            }
        };

        self.cancel();
        self.last_error = None;
        self.transcript.append(ChatMessage::user(prompt));

        let cancel = CancellationToken::new();
        let events = self.source.stream(prompt, cancel.clone());
        let id = self.next_session_id;
        self.next_session_id += 1;
        info!(session = id, "prompt submitted");

        self.session = Some(StreamingSession {
            id,
            accumulated: String::new(),
            cancel,
            events,
            assistant_index: None,
        });
        true
    }

    /// Abort the active stream, keeping any partial reply.
    pub fn cancel(&mut self) -> bool {
        match self.session.take() {
            Some(session) => {
                session.cancel.cancel();
                debug!(
                    session = session.id,
                    received = session.accumulated.len(),
                    "cancelled streaming session"
                );
                true
            }
            None => false,
        }
    }

    /// Cancel any stream and wipe the persisted history.
    pub fn clear_history(&mut self) {
        self.cancel();
        self.last_error = None;
        self.transcript.clear();
    }

    /// Wait for the next event of the active stream and apply it.
    ///
    /// Returns `None` right away when no stream is active. Cancel-safe, so it
    /// can sit in a `select!` next to UI events.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        let session = self.session.as_mut()?;
        let event = session.events.recv().await;
        Some(self.apply(event))
    }

    /// Drive the active stream until it finishes, fails or is cancelled.
    pub async fn run_to_completion(&mut self) -> Option<SessionUpdate> {
        let mut last = None;
        while let Some(update) = self.next_update().await {
            let done = matches!(update, SessionUpdate::Finished | SessionUpdate::Failed(_));
            last = Some(update);
            if done {
                break;
            }
        }
        last
    }

    fn apply(&mut self, event: Option<StreamEvent>) -> SessionUpdate {
        match event {
            Some(StreamEvent::Chunk(chunk)) if chunk.is_terminal => self.finish(),
            Some(StreamEvent::Chunk(chunk)) => {
                if !chunk.has_delta() {
                    return SessionUpdate::Unchanged;
                }
                let Some(session) = self.session.as_mut() else {
                    return SessionUpdate::Unchanged;
                };
                session.accumulated.push_str(&chunk.delta_text);
                // First delta creates the entry, later ones rewrite it in place
                let replaced = session
                    .assistant_index
                    .is_some_and(|index| self.transcript.replace_at(index, &session.accumulated));
                if !replaced {
                    let index = self.transcript.replace_trailing_assistant(&session.accumulated);
                    session.assistant_index = Some(index);
                }
                SessionUpdate::TranscriptChanged
            }
            Some(StreamEvent::Failed(e)) if e.is_recoverable() => {
                debug!(error = %e, "skipping recoverable stream error");
                SessionUpdate::Unchanged
            }
            Some(StreamEvent::Failed(e)) => {
                let reason = e.to_string();
                self.fail(reason.clone());
                SessionUpdate::Failed(reason)
            }
            // Transport closed without a done marker
            None => self.finish(),
        }
    }

    fn finish(&mut self) -> SessionUpdate {
        // The transcript already holds the full text from the last delta.
        if let Some(session) = self.session.take() {
            info!(
                session = session.id,
                chars = session.accumulated.chars().count(),
                "stream finished"
            );
        }
        SessionUpdate::Finished
    }

    fn fail(&mut self, reason: String) {
        if let Some(session) = self.session.take() {
            warn!(session = session.id, error = %reason, "stream failed");
            if self.policy == StreamErrorPolicy::Rollback {
                if let Some(index) = session.assistant_index {
                    self.transcript.remove_assistant(index);
                }
            }
        }
        self.last_error = Some(reason);
    }

    /// Render every entry, prompts and replies alike, as Markdown.
    pub fn rendered_transcript(&self) -> Vec<RenderedMessage> {
        self.transcript
            .messages()
            .iter()
            .map(|message| RenderedMessage {
                role: message.role,
                lines: render_markdown(&message.content),
            })
            .collect()
    }
}

fn validate_prompt(text: &str) -> Result<&str> {
    let prompt = text.trim();
    if prompt.is_empty() {
        return Err(ChatError::validation("prompt is empty"));
    }
    Ok(prompt)
}

impl Drop for ChatSessionController {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::StreamChunk;
    use crate::store::{MemoryStore, TranscriptStore};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    /// Hands out pre-made channels in order and records what it was asked.
    #[derive(Default)]
    struct ScriptedSource {
        streams: Mutex<VecDeque<mpsc::Receiver<StreamEvent>>>,
        prompts: Mutex<Vec<String>>,
        tokens: Mutex<Vec<CancellationToken>>,
    }

    impl ScriptedSource {
        fn script(&self) -> mpsc::Sender<StreamEvent> {
            let (tx, rx) = mpsc::channel(16);
            self.streams.lock().unwrap().push_back(rx);
            tx
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    impl CompletionSource for ScriptedSource {
        fn stream(&self, prompt: &str, cancel: CancellationToken) -> mpsc::Receiver<StreamEvent> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.tokens.lock().unwrap().push(cancel);
            self.streams
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| mpsc::channel(1).1)
        }
    }

    fn delta(text: &str) -> StreamEvent {
        StreamEvent::Chunk(StreamChunk {
            raw_line: String::new(),
            is_terminal: false,
            delta_text: text.to_string(),
        })
    }

    fn done() -> StreamEvent {
        StreamEvent::Chunk(StreamChunk {
            raw_line: "data: [DONE]".to_string(),
            is_terminal: true,
            delta_text: String::new(),
        })
    }

    fn controller(source: Arc<ScriptedSource>, policy: StreamErrorPolicy) -> ChatSessionController {
        let transcript = ChatTranscript::new(Box::new(MemoryStore::new()));
        ChatSessionController::new(transcript, source, policy)
    }

    fn pairs(controller: &ChatSessionController) -> Vec<(ChatRole, String)> {
        controller
            .transcript()
            .messages()
            .iter()
            .map(|m| (m.role, m.content.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_hello_example() {
        let source = Arc::new(ScriptedSource::default());
        let tx = source.script();
        let mut controller = controller(source.clone(), StreamErrorPolicy::Retain);

        assert!(controller.send_prompt("Hello"));
        assert_eq!(pairs(&controller), vec![(ChatRole::User, "Hello".to_string())]);

        let mut expected = String::new();
        for part in ["Hi", " there", "!"] {
            tx.send(delta(part)).await.unwrap();
            expected.push_str(part);
            assert_eq!(controller.next_update().await, Some(SessionUpdate::TranscriptChanged));
            assert_eq!(controller.transcript().len(), 2);
            assert_eq!(controller.transcript().messages()[1].content, expected);
        }

        tx.send(done()).await.unwrap();
        assert_eq!(controller.next_update().await, Some(SessionUpdate::Finished));
        assert!(!controller.is_streaming());
        assert_eq!(
            pairs(&controller),
            vec![
                (ChatRole::User, "Hello".to_string()),
                (ChatRole::Assistant, "Hi there!".to_string()),
            ]
        );
        assert_eq!(source.prompts(), vec!["Hello".to_string()]);
    }

    #[tokio::test]
    async fn test_terminal_chunk_does_not_mutate() {
        let source = Arc::new(ScriptedSource::default());
        let tx = source.script();
        let mut controller = controller(source, StreamErrorPolicy::Retain);

        controller.send_prompt("Q");
        tx.send(delta("answer")).await.unwrap();
        controller.next_update().await;
        let before = controller.transcript().messages().to_vec();

        tx.send(done()).await.unwrap();
        tx.send(delta("after done")).await.unwrap();
        assert_eq!(controller.next_update().await, Some(SessionUpdate::Finished));
        assert_eq!(controller.next_update().await, None);
        assert_eq!(controller.transcript().messages(), before.as_slice());
    }

    #[tokio::test]
    async fn test_blank_prompt_is_ignored() {
        let source = Arc::new(ScriptedSource::default());
        let mut controller = controller(source.clone(), StreamErrorPolicy::Retain);

        assert!(!controller.send_prompt("   "));
        assert!(!controller.send_prompt("\n\t"));
        assert!(controller.transcript().is_empty());
        assert!(source.prompts().is_empty());
        assert!(!controller.is_streaming());
    }

    #[test]
    fn test_validate_prompt() {
        assert_eq!(validate_prompt("  hi \n").unwrap(), "hi");
        assert!(matches!(validate_prompt(" \t"), Err(ChatError::Validation(_))));
    }

    #[tokio::test]
    async fn test_prompt_is_trimmed() {
        let source = Arc::new(ScriptedSource::default());
        let mut controller = controller(source.clone(), StreamErrorPolicy::Retain);

        controller.send_prompt("  Hello \n");
        assert_eq!(controller.transcript().messages()[0], ChatMessage::user("Hello"));
        assert_eq!(source.prompts(), vec!["Hello".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_deltas_leave_transcript_alone() {
        let source = Arc::new(ScriptedSource::default());
        let tx = source.script();
        let mut controller = controller(source, StreamErrorPolicy::Retain);

        controller.send_prompt("Q");
        tx.send(delta("")).await.unwrap();
        assert_eq!(controller.next_update().await, Some(SessionUpdate::Unchanged));
        assert_eq!(controller.transcript().len(), 1);

        tx.send(delta("x")).await.unwrap();
        assert_eq!(controller.next_update().await, Some(SessionUpdate::TranscriptChanged));
        assert_eq!(controller.accumulated_text(), Some("x"));
    }

    #[tokio::test]
    async fn test_new_prompt_supersedes_active_stream() {
        let source = Arc::new(ScriptedSource::default());
        let first = source.script();
        let second = source.script();
        let mut controller = controller(source.clone(), StreamErrorPolicy::Retain);

        controller.send_prompt("A");
        first.send(delta("par")).await.unwrap();
        controller.next_update().await;

        controller.send_prompt("B");
        assert!(source.tokens.lock().unwrap()[0].is_cancelled());
        // The superseded receiver is gone, so late deltas go nowhere.
        assert!(first.send(delta("LATE")).await.is_err());

        second.send(delta("b1")).await.unwrap();
        second.send(delta(" b2")).await.unwrap();
        second.send(done()).await.unwrap();
        assert_eq!(controller.run_to_completion().await, Some(SessionUpdate::Finished));

        assert_eq!(
            pairs(&controller),
            vec![
                (ChatRole::User, "A".to_string()),
                (ChatRole::Assistant, "par".to_string()),
                (ChatRole::User, "B".to_string()),
                (ChatRole::Assistant, "b1 b2".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_error_retains_partial_text() {
        let source = Arc::new(ScriptedSource::default());
        let tx = source.script();
        let mut controller = controller(source, StreamErrorPolicy::Retain);

        controller.send_prompt("Q");
        tx.send(delta("partial")).await.unwrap();
        tx.send(StreamEvent::Failed(ChatError::Protocol {
            status: 500,
            body: "boom".to_string(),
        }))
        .await
        .unwrap();

        let update = controller.run_to_completion().await;
        assert!(matches!(update, Some(SessionUpdate::Failed(ref reason)) if reason.contains("500")));
        assert!(!controller.is_streaming());
        assert!(controller.last_error().is_some());
        assert_eq!(
            pairs(&controller),
            vec![
                (ChatRole::User, "Q".to_string()),
                (ChatRole::Assistant, "partial".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_error_rollback_policy() {
        let source = Arc::new(ScriptedSource::default());
        let failing = source.script();
        let next = source.script();
        let mut controller = controller(source, StreamErrorPolicy::Rollback);

        controller.send_prompt("Q");
        failing.send(delta("partial")).await.unwrap();
        failing
            .send(StreamEvent::Failed(ChatError::Protocol {
                status: 502,
                body: "stream broke".to_string(),
            }))
            .await
            .unwrap();
        controller.run_to_completion().await;

        assert_eq!(pairs(&controller), vec![(ChatRole::User, "Q".to_string())]);
        assert_eq!(
            controller.last_error(),
            Some("Completions API error 502: stream broke")
        );

        // Ready for the next prompt
        controller.send_prompt("again");
        next.send(delta("ok")).await.unwrap();
        assert_eq!(controller.next_update().await, Some(SessionUpdate::TranscriptChanged));
        assert!(controller.last_error().is_none());
    }

    #[tokio::test]
    async fn test_rollback_without_deltas_keeps_earlier_reply() {
        let source = Arc::new(ScriptedSource::default());
        let first = source.script();
        let second = source.script();
        let mut controller = controller(source, StreamErrorPolicy::Rollback);

        controller.send_prompt("A");
        first.send(delta("kept")).await.unwrap();
        first.send(done()).await.unwrap();
        controller.run_to_completion().await;

        controller.send_prompt("B");
        second
            .send(StreamEvent::Failed(ChatError::Protocol {
                status: 429,
                body: "refused".to_string(),
            }))
            .await
            .unwrap();
        controller.run_to_completion().await;

        assert_eq!(
            pairs(&controller),
            vec![
                (ChatRole::User, "A".to_string()),
                (ChatRole::Assistant, "kept".to_string()),
                (ChatRole::User, "B".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_closed_stream_finishes() {
        let source = Arc::new(ScriptedSource::default());
        let tx = source.script();
        let mut controller = controller(source, StreamErrorPolicy::Retain);

        controller.send_prompt("Q");
        tx.send(delta("cut")).await.unwrap();
        drop(tx);

        assert_eq!(controller.run_to_completion().await, Some(SessionUpdate::Finished));
        assert_eq!(controller.transcript().messages()[1].content, "cut");
    }

    #[tokio::test]
    async fn test_cancel_keeps_partial_text() {
        let source = Arc::new(ScriptedSource::default());
        let tx = source.script();
        let mut controller = controller(source.clone(), StreamErrorPolicy::Retain);

        controller.send_prompt("Q");
        tx.send(delta("half")).await.unwrap();
        controller.next_update().await;

        assert!(controller.cancel());
        assert!(!controller.cancel());
        assert!(source.tokens.lock().unwrap()[0].is_cancelled());
        assert_eq!(controller.next_update().await, None);
        assert_eq!(controller.transcript().messages()[1].content, "half");
    }

    #[tokio::test]
    async fn test_clear_history() {
        let source = Arc::new(ScriptedSource::default());
        let _tx = source.script();
        let mut controller = controller(source, StreamErrorPolicy::Retain);

        controller.send_prompt("Q");
        controller.clear_history();
        assert!(controller.transcript().is_empty());
        assert!(!controller.is_streaming());
    }

    #[tokio::test]
    async fn test_rendered_transcript() {
        let source = Arc::new(ScriptedSource::default());
        let tx = source.script();
        let mut controller = controller(source, StreamErrorPolicy::Retain);

        controller.send_prompt("**prompt**");
        tx.send(delta("**bold**")).await.unwrap();
        controller.next_update().await;

        let rendered = controller.rendered_transcript();
        assert_eq!(rendered.len(), 2);
        assert_eq!(rendered[0].role, ChatRole::User);
        assert_eq!(rendered[0].lines[0].plain_text(), "prompt");
        assert!(rendered[0].lines[0].spans[0].style.bold);
        assert_eq!(rendered[1].lines[0].plain_text(), "bold");
        assert!(rendered[1].lines[0].spans[0].style.bold);
    }

    #[tokio::test]
    async fn test_recoverable_error_keeps_streaming() {
        let source = Arc::new(ScriptedSource::default());
        let tx = source.script();
        let mut controller = controller(source, StreamErrorPolicy::Rollback);

        controller.send_prompt("Q");
        tx.send(delta("one")).await.unwrap();
        tx.send(StreamEvent::Failed(ChatError::parse("bad line"))).await.unwrap();
        tx.send(delta(" two")).await.unwrap();
        tx.send(done()).await.unwrap();

        controller.next_update().await;
        assert_eq!(controller.next_update().await, Some(SessionUpdate::Unchanged));
        assert!(controller.is_streaming());
        assert_eq!(controller.run_to_completion().await, Some(SessionUpdate::Finished));
        assert!(controller.last_error().is_none());
        assert_eq!(controller.transcript().messages()[1].content, "one two");
    }

    #[tokio::test]
    async fn test_deltas_reuse_held_index() {
        let source = Arc::new(ScriptedSource::default());
        let tx = source.script();
        let mut controller = controller(source, StreamErrorPolicy::Retain);

        controller.send_prompt("Q");
        for part in ["a", "b", "c"] {
            tx.send(delta(part)).await.unwrap();
            controller.next_update().await;
            let held = controller.session.as_ref().and_then(|s| s.assistant_index);
            assert_eq!(held, Some(1));
        }
        assert_eq!(controller.transcript().len(), 2);
        assert_eq!(controller.transcript().messages()[1].content, "abc");
    }

    #[tokio::test]
    async fn test_slow_store_does_not_delay_deltas() {
        struct SlowStore;

        impl TranscriptStore for SlowStore {
            fn load(&self, _key: &str) -> Result<Option<String>> {
                Ok(None)
            }

            fn save(&self, _key: &str, _value: &str) -> Result<()> {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            }
        }

        let source = Arc::new(ScriptedSource::default());
        let tx = source.script();
        let transcript = ChatTranscript::new(Box::new(SlowStore));
        let mut controller =
            ChatSessionController::new(transcript, source, StreamErrorPolicy::Retain);

        let started = Instant::now();
        controller.send_prompt("Q");
        for part in ["1", "2", "3", "4", "5"] {
            tx.send(delta(part)).await.unwrap();
            assert_eq!(controller.next_update().await, Some(SessionUpdate::TranscriptChanged));
        }
        assert!(started.elapsed() < Duration::from_millis(150));
        assert_eq!(controller.transcript().messages()[1].content, "12345");
    }
}
