//! Message types
//!
//! Defines chat message structures, roles and the aggregated chat response.

use serde::{Deserialize, Serialize};

use crate::inference::session::StopReason;
use crate::inference::telemetry::TokenUsage;

/// Role of a message sender
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// System prompt
    System,
    /// Message from the user
    #[default]
    User,
    /// Message from the assistant
    Assistant,
}

impl ChatRole {
    /// Name used both by the chat template and by the native `role` field
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of the message sender
    pub role: ChatRole,
    /// The content of the message
    pub content: String,
}

impl ChatMessage {
    /// Create a new message
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }
}

/// Final result of a drained generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// The assistant message built from every text increment
    pub message: ChatMessage,
    /// Prompt/completion token counts, unknown when the run never finished
    #[serde(default)]
    pub usage: TokenUsage,
    /// Why generation ended
    pub stop_reason: StopReason,
}

impl ChatResponse {
    /// Assistant content with any reasoning block removed
    pub fn answer(&self) -> String {
        strip_thinking(&self.message.content)
    }
}

/// Remove `<think>...</think>` reasoning blocks from generated content.
///
/// An unterminated block swallows the rest of the content.
pub fn strip_thinking(content: &str) -> String {
    const OPEN: &str = "<think>";
    const CLOSE: &str = "</think>";

    let mut result = String::with_capacity(content.len());
    let mut rest = content;

    while let Some(start) = rest.find(OPEN) {
        result.push_str(&rest[..start]);
        let after_open = &rest[start + OPEN.len()..];
        match after_open.find(CLOSE) {
            Some(end) => rest = &after_open[end + CLOSE.len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    result.push_str(rest);

    // Stray closing tags show up when the template opened the block for us
    result.replace(CLOSE, "").trim().to_string()
}
