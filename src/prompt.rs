//! Prompt assembly for the commentary generator. The persona is configuration,
//! not logic: it arrives from `AppConfig` and is embedded as the system turn.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Build the two-turn exchange sent upstream: persona as system turn, then the
/// fixed user template with the event embedded verbatim.
pub fn build_messages(persona: &str, event: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(persona),
        ChatMessage::user(format!(
            "Acontecimento: {}\n\nExplica como isto beneficia André Ventura.",
            event
        )),
    ]
}
