//! Chat request shape

use relay_transport::Capability;
use serde::{Deserialize, Serialize};

/// Who spoke a history turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnRole {
    User,
    Assistant,
}

/// One prior exchange in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
        }
    }
}

/// A chat request as handed to the dispatcher.
///
/// Immutable once built; retry bookkeeping lives in the supervisor's
/// attempt loop, not here.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub capability: Capability,
    pub prompt: String,
    pub history: Vec<Turn>,
}

impl ChatRequest {
    pub fn new(capability: Capability, prompt: impl Into<String>) -> Self {
        Self {
            capability,
            prompt: prompt.into(),
            history: Vec::new(),
        }
    }

    pub fn with_history(mut self, history: Vec<Turn>) -> Self {
        self.history = history;
        self
    }
}
