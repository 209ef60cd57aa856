use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CompletionSource, StreamEvent};
use crate::error::{ChatError, Result};
use crate::sse::SseParser;
use crate::state::ChatRole;

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

const STREAM_BUFFER: usize = 100;

#[derive(Debug, Serialize)]
pub struct OpenAIMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct OpenAIRequest {
    pub model: String,
    pub messages: Vec<OpenAIMessage>,
    pub stream: bool,
}

/// Streaming client for an OpenAI-compatible chat completions endpoint.
///
/// Only the latest prompt is sent; earlier turns are not replayed as context.
#[derive(Clone)]
pub struct OpenAIClient {
    client: Client,
    api_key: String,
    model: String,
    endpoint: String,
}

impl OpenAIClient {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn build_request(&self, prompt: &str) -> OpenAIRequest {
        OpenAIRequest {
            model: self.model.clone(),
            messages: vec![OpenAIMessage {
                role: ChatRole::User.as_str().to_string(),
                content: prompt.to_string(),
            }],
            stream: true,
        }
    }

    async fn pump(&self, request: OpenAIRequest, tx: &mpsc::Sender<StreamEvent>) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header(ACCEPT, "text/event-stream")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::Protocol {
                status: status.as_u16(),
                body,
            });
        }

        let mut parser = SseParser::new();
        let mut bytes = response.bytes_stream();

        while let Some(block) = bytes.next().await {
            let block = block?;
            for chunk in parser.push(&block) {
                if tx.send(StreamEvent::Chunk(chunk)).await.is_err() {
                    // Receiver dropped, nobody is listening anymore
                    return Ok(());
                }
            }
            if parser.is_finished() {
                return Ok(());
            }
        }

        if let Some(chunk) = parser.finish() {
            let _ = tx.send(StreamEvent::Chunk(chunk)).await;
        }
        debug!("completion stream closed without a done marker");
        Ok(())
    }
}

impl CompletionSource for OpenAIClient {
    fn stream(&self, prompt: &str, cancel: CancellationToken) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let request = self.build_request(prompt);
        let client = self.clone();

        info!(model = %self.model, endpoint = %self.endpoint, "opening completion stream");

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("completion stream cancelled");
                }
                result = client.pump(request, &tx) => {
                    if let Err(e) = result {
                        warn!(error = %e, "completion stream failed");
                        let _ = tx.send(StreamEvent::Failed(e)).await;
                    }
                }
            }
        });

        rx
    }
}
