//! Store event types

use serde::{Deserialize, Serialize};

use crate::types::{Message, MessageState};

/// Events broadcast after every committed store mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    /// A conversation was created
    ConversationCreated { conversation_id: String },

    /// A conversation was removed
    ConversationDeleted { conversation_id: String },

    /// A conversation got a new title
    ConversationRenamed {
        conversation_id: String,
        title: String,
    },

    /// The active selection changed
    SelectionChanged { conversation_id: Option<String> },

    /// A message was appended
    MessageAppended {
        conversation_id: String,
        message: Message,
    },

    /// A streamed fragment was appended to a pending message
    MessageDelta {
        conversation_id: String,
        message_id: String,
        delta: String,
    },

    /// Pending message content was replaced
    MessageUpdated {
        conversation_id: String,
        message_id: String,
        content: String,
    },

    /// A pending message left the pending state
    MessageFinalized {
        conversation_id: String,
        message_id: String,
        state: MessageState,
    },

    /// The detailed-replies setting changed
    DetailedModeChanged { enabled: bool },

    /// A reply session started or ended for a conversation
    StreamingChanged {
        conversation_id: String,
        streaming: bool,
    },

    /// All conversations were cleared
    Reset,

    /// A snapshot write failed; in-memory state is still authoritative
    PersistenceFailed { message: String },
}

impl StoreEvent {
    /// The conversation this event concerns, if any
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            StoreEvent::ConversationCreated { conversation_id }
            | StoreEvent::ConversationDeleted { conversation_id }
            | StoreEvent::ConversationRenamed {
                conversation_id, ..
            }
            | StoreEvent::MessageAppended {
                conversation_id, ..
            }
            | StoreEvent::MessageDelta {
                conversation_id, ..
            }
            | StoreEvent::MessageUpdated {
                conversation_id, ..
            }
            | StoreEvent::MessageFinalized {
                conversation_id, ..
            }
            | StoreEvent::StreamingChanged {
                conversation_id, ..
            } => Some(conversation_id),
            StoreEvent::SelectionChanged { conversation_id } => conversation_id.as_deref(),
            StoreEvent::Reset
            | StoreEvent::DetailedModeChanged { .. }
            | StoreEvent::PersistenceFailed { .. } => None,
        }
    }
}
