//! UI-agnostic chat state types
//!
//! These are shared between the core pipeline and whatever front end renders
//! the conversation, and don't depend on any specific UI framework.

use serde::{Deserialize, Serialize};

/// A single transcript entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// The role of a chat message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

impl ChatRole {
    /// Wire name used by the completions API
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }

    /// Header shown above a message in the chat view
    pub fn display_name(&self) -> &'static str {
        match self {
            ChatRole::User => "You:",
            ChatRole::Assistant => "Assistant:",
        }
    }
}
