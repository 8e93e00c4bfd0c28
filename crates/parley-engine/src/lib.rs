//! parley-engine: conversation state and reply streaming
//!
//! The [`ConversationStore`] owns every conversation and message, broadcasts
//! a [`StoreEvent`] for each change and keeps a snapshot on durable storage.
//! The [`StreamingCoordinator`] turns a user send into a streamed assistant
//! reply through a [`parley_wire::ReplyService`].

pub mod coordinator;
pub mod error;
pub mod events;
pub mod persist;
pub mod store;
pub mod types;
pub mod usage;

pub use coordinator::{CoordinatorConfig, SendOutcome, SessionState, StreamingCoordinator};
pub use error::{Error, Result, ValidationError};
pub use events::StoreEvent;
pub use persist::{FileStore, KeyValueStore, MemoryStore, STORAGE_KEY, Snapshot};
pub use store::{ConversationStore, StoreConfig};
pub use types::{Conversation, DEFAULT_TITLE, Message, MessageState, Outcome, Role};
pub use usage::{UsageStats, estimate_tokens};
