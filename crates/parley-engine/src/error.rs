//! Error types for parley-engine

use thiserror::Error;

/// Result type alias using parley-engine Error
pub type Result<T> = std::result::Result<T, Error>;

/// Rejected operations. These are local no-ops, never crashes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Input was empty or whitespace only
    #[error("Message is empty")]
    EmptyInput,

    /// No conversation with this id
    #[error("Unknown conversation: {0}")]
    UnknownConversation(String),

    /// No message with this id in the conversation
    #[error("Unknown message {message_id} in conversation {conversation_id}")]
    UnknownMessage {
        conversation_id: String,
        message_id: String,
    },

    /// The message exists but is not the conversation's pending message
    #[error("Message {message_id} is not pending in conversation {conversation_id}")]
    NotPending {
        conversation_id: String,
        message_id: String,
    },

    /// The conversation already has a pending message
    #[error("Conversation {0} already has a pending message")]
    PendingExists(String),

    /// A reply is already streaming into this conversation
    #[error("Conversation {0} is already streaming")]
    AlreadyStreaming(String),

    /// Nothing is streaming into this conversation
    #[error("Conversation {0} is not streaming")]
    NotStreaming(String),

    /// No conversation is selected
    #[error("No active conversation")]
    NoActiveConversation,
}

/// Errors that can occur during engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// The operation was rejected
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Durable storage could not be read or written
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl Error {
    /// Check if this error is a rejected operation
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    pub(crate) fn persistence(e: impl std::fmt::Display) -> Self {
        Error::Persistence(e.to_string())
    }
}
