//! Conversations and messages

use serde::{Deserialize, Serialize};

/// Title given to new conversations
pub const DEFAULT_TITLE: &str = "New Chat";

/// Who wrote a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Get the role as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Lifecycle of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    /// Still being streamed in
    Pending,
    /// Reply ended cleanly
    Complete,
    /// Reply failed or was cancelled; content holds what arrived
    Failed,
}

/// How a pending message ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Complete,
    Failed,
}

impl From<Outcome> for MessageState {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Complete => MessageState::Complete,
            Outcome::Failed => MessageState::Failed,
        }
    }
}

/// A single message in a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    /// Creation time in milliseconds since the epoch
    pub created_at: i64,
    pub state: MessageState,
}

impl Message {
    /// Create a complete user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            role: Role::User,
            content: content.into(),
            created_at: now_millis(),
            state: MessageState::Complete,
        }
    }

    /// Create an empty assistant message awaiting its reply
    pub fn assistant_pending() -> Self {
        Self {
            id: new_message_id(),
            role: Role::Assistant,
            content: String::new(),
            created_at: now_millis(),
            state: MessageState::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == MessageState::Pending
    }
}

/// A titled, ordered sequence of messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    /// Last modification time in milliseconds since the epoch
    pub updated_at: i64,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Conversation {
    /// Create an empty conversation with the default title
    pub fn new() -> Self {
        Self {
            id: new_conversation_id(),
            title: DEFAULT_TITLE.to_string(),
            updated_at: now_millis(),
            messages: Vec::new(),
        }
    }

    /// The message currently streaming in, if any
    pub fn pending_message(&self) -> Option<&Message> {
        self.messages.iter().find(|m| m.is_pending())
    }

    pub fn pending_count(&self) -> usize {
        self.messages.iter().filter(|m| m.is_pending()).count()
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub(crate) fn message_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = now_millis().max(self.updated_at);
    }

    /// Mark every pending message as failed. Returns how many changed.
    pub(crate) fn fail_pending(&mut self) -> usize {
        let mut changed = 0;
        for message in self.messages.iter_mut().filter(|m| m.is_pending()) {
            message.state = MessageState::Failed;
            changed += 1;
        }
        changed
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

/// Current time in milliseconds since the epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn new_conversation_id() -> String {
    format!("chat-{}", uuid::Uuid::new_v4())
}

fn new_message_id() -> String {
    format!("msg-{}", uuid::Uuid::new_v4())
}

/// The first `max` characters of `s`, used as a conversation title
pub fn title_prefix(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
