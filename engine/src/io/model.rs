//! Boundary to the model-invocation client.
//!
//! The engine never talks to a provider directly. A [`ModelClient`] turns a
//! conversation into a stream of text chunks; tests use scripted clients that
//! replay predetermined responses.

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Conversation sent to the model, oldest message first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub messages: Vec<ChatMessage>,
}

impl ModelRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self { messages }
    }

    /// A copy of this request with `messages` appended.
    pub fn followed_by(&self, messages: impl IntoIterator<Item = ChatMessage>) -> Self {
        let mut next = self.clone();
        next.messages.extend(messages);
        next
    }
}

/// Text chunks in arrival order. An `Err` item ends the stream.
pub type ChunkStream<'a> = Box<dyn Iterator<Item = Result<String>> + Send + 'a>;

pub trait ModelClient: Send + Sync {
    fn stream(&self, request: &ModelRequest) -> Result<ChunkStream<'_>>;
}

/// Sent after a response that stopped inside a write tag.
pub const CONTINUE_PROMPT: &str = "Continue exactly where you left off without any preamble. Do not repeat content you have already written.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn followed_by_appends_without_mutating() {
        let base = ModelRequest::new(vec![ChatMessage::user("hi")]);
        let next = base.followed_by([ChatMessage::assistant("partial"), ChatMessage::user(CONTINUE_PROMPT)]);
        assert_eq!(base.messages.len(), 1);
        assert_eq!(next.messages.len(), 3);
        assert_eq!(next.messages[1].role, Role::Assistant);
    }

    #[test]
    fn roles_serialize_lowercase() {
        let json = serde_json::to_string(&ChatMessage::user("x")).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"x"}"#);
    }
}
