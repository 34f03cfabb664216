use serde::{Deserialize, Serialize};

/// The author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// Behavioral instructions, collapsed into the first user turn when the
    /// backend does not accept a dedicated system role.
    System,
    /// A message authored by the end user.
    User,
    /// A message previously produced by the model.
    Assistant,
}

/// A single turn in a conversation, in the order it was spoken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who authored this turn.
    pub role: ChatRole,
    /// The raw text content of the turn.
    pub content: String,
}

impl ChatMessage {
    /// Convenience constructor for a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    /// Convenience constructor for a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    /// Convenience constructor for an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}
