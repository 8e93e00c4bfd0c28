//! The authoritative conversation table
//!
//! All mutations go through [`ConversationStore`], which serializes them
//! behind one lock, broadcasts a [`StoreEvent`] for each committed change and
//! schedules a debounced snapshot write.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use crate::{
    error::{Result, ValidationError},
    events::StoreEvent,
    persist::{self, KeyValueStore, Persister, Snapshot},
    types::{Conversation, Message, MessageState, Outcome},
    usage::UsageStats,
};

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Quiet period before a snapshot is written
    pub save_debounce: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            save_debounce: Duration::from_millis(250),
        }
    }
}

/// Conversations plus selection, shared with the persister
#[derive(Debug, Default)]
pub(crate) struct Table {
    /// Listing order, newest first
    pub(crate) conversations: Vec<Conversation>,
    pub(crate) active: Option<String>,
    pub(crate) usage: UsageStats,
    /// Ask the reply service for detailed replies
    pub(crate) detailed_mode: bool,
    /// Bumped on every committed mutation
    pub(crate) revision: u64,
}

impl Table {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            conversations: snapshot.conversations,
            active: snapshot.active_conversation_id,
            usage: snapshot.usage.unwrap_or_default(),
            detailed_mode: snapshot.detailed_mode,
            revision: 0,
        }
    }

    fn conversation_mut(
        &mut self,
        id: &str,
    ) -> std::result::Result<&mut Conversation, ValidationError> {
        self.conversations
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| ValidationError::UnknownConversation(id.to_string()))
    }

    /// Most recently updated conversation; ties go to the one listed first
    fn most_recent(&self) -> Option<&Conversation> {
        let mut best: Option<&Conversation> = None;
        for c in &self.conversations {
            if best.is_none_or(|b| c.updated_at > b.updated_at) {
                best = Some(c);
            }
        }
        best
    }
}

/// Owner of all conversations and messages
pub struct ConversationStore {
    table: Arc<Mutex<Table>>,
    events: broadcast::Sender<StoreEvent>,
    revisions: watch::Sender<u64>,
    persister: Option<Arc<Persister>>,
}

impl ConversationStore {
    /// Create an empty store that keeps nothing on disk
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self::with_table(Table::default()).0)
    }

    /// Load the stored snapshot from `backend` and keep it updated.
    ///
    /// Messages left pending by an earlier run are marked failed. An
    /// unreadable document is moved aside and the store starts empty. Must be
    /// called inside a Tokio runtime; the snapshot writer runs as a task.
    pub async fn open(backend: Arc<dyn KeyValueStore>, config: StoreConfig) -> Result<Arc<Self>> {
        let table = match persist::load_or_recover(backend.as_ref()).await? {
            Some(snapshot) => {
                tracing::info!(
                    "Loaded {} conversation(s) from storage",
                    snapshot.conversations.len()
                );
                Table::from_snapshot(snapshot)
            }
            None => Table::default(),
        };

        let (mut store, changes) = Self::with_table(table);
        let persister = Arc::new(Persister::new(
            backend,
            Arc::clone(&store.table),
            store.events.clone(),
        ));
        tokio::spawn(Arc::clone(&persister).run(changes, config.save_debounce));
        store.persister = Some(persister);
        Ok(Arc::new(store))
    }

    fn with_table(table: Table) -> (Self, watch::Receiver<u64>) {
        let (events, _) = broadcast::channel(1024);
        let (revisions, changes) = watch::channel(table.revision);
        (
            Self {
                table: Arc::new(Mutex::new(table)),
                events,
                revisions,
                persister: None,
            },
            changes,
        )
    }

    /// Subscribe to store events
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Record a committed mutation: bump the revision, broadcast its events
    /// and wake the snapshot writer. Runs under the table lock so event order
    /// matches mutation order.
    fn commit(&self, table: &mut Table, events: Vec<StoreEvent>) {
        table.revision += 1;
        self.revisions.send_replace(table.revision);
        for event in events {
            let _ = self.events.send(event);
        }
    }

    /// Broadcast an event that does not change the table
    pub(crate) fn notify(&self, event: StoreEvent) {
        let _ = self.events.send(event);
    }

    // ---- Conversations ----

    /// Create an empty conversation at the head of the list and select it
    pub fn create_conversation(&self) -> String {
        let conversation = Conversation::new();
        let id = conversation.id.clone();

        let mut table = self.table.lock();
        table.conversations.insert(0, conversation);
        table.active = Some(id.clone());
        self.commit(
            &mut table,
            vec![
                StoreEvent::ConversationCreated {
                    conversation_id: id.clone(),
                },
                StoreEvent::SelectionChanged {
                    conversation_id: Some(id.clone()),
                },
            ],
        );
        tracing::debug!("Created conversation {}", id);
        id
    }

    /// Remove a conversation. Returns `false` if the id is unknown.
    ///
    /// Deleting the active conversation selects the most recently updated
    /// remaining one, or nothing when the store is empty.
    pub fn delete_conversation(&self, id: &str) -> bool {
        let mut table = self.table.lock();
        let Some(index) = table.conversations.iter().position(|c| c.id == id) else {
            return false;
        };
        table.conversations.remove(index);

        let mut events = vec![StoreEvent::ConversationDeleted {
            conversation_id: id.to_string(),
        }];
        if table.active.as_deref() == Some(id) {
            table.active = table.most_recent().map(|c| c.id.clone());
            events.push(StoreEvent::SelectionChanged {
                conversation_id: table.active.clone(),
            });
        }
        self.commit(&mut table, events);
        true
    }

    /// Retitle a conversation. Blank titles and unknown ids are ignored.
    pub fn rename_conversation(&self, id: &str, title: &str) -> bool {
        let title = title.trim();
        if title.is_empty() {
            return false;
        }

        let mut table = self.table.lock();
        let Ok(conversation) = table.conversation_mut(id) else {
            return false;
        };
        conversation.title = title.to_string();
        self.commit(
            &mut table,
            vec![StoreEvent::ConversationRenamed {
                conversation_id: id.to_string(),
                title: title.to_string(),
            }],
        );
        true
    }

    /// Make a conversation the active one. Unknown ids are ignored.
    pub fn select_conversation(&self, id: &str) -> bool {
        let mut table = self.table.lock();
        if !table.conversations.iter().any(|c| c.id == id) {
            return false;
        }
        if table.active.as_deref() == Some(id) {
            return true;
        }
        table.active = Some(id.to_string());
        self.commit(
            &mut table,
            vec![StoreEvent::SelectionChanged {
                conversation_id: Some(id.to_string()),
            }],
        );
        true
    }

    /// Drop every conversation and the selection
    pub fn reset_all(&self) {
        let mut table = self.table.lock();
        table.conversations.clear();
        table.active = None;
        table.usage = UsageStats::default();
        table.detailed_mode = false;
        self.commit(&mut table, vec![StoreEvent::Reset]);
    }

    /// Switch between detailed and concise replies
    pub fn set_detailed_mode(&self, enabled: bool) {
        let mut table = self.table.lock();
        if table.detailed_mode == enabled {
            return;
        }
        table.detailed_mode = enabled;
        self.commit(&mut table, vec![StoreEvent::DetailedModeChanged { enabled }]);
    }

    // ---- Messages ----

    /// Append a message and return its position in the conversation.
    ///
    /// A pending message is refused while another one is still pending.
    pub fn append_message(
        &self,
        conversation_id: &str,
        message: Message,
    ) -> std::result::Result<usize, ValidationError> {
        let mut table = self.table.lock();
        let conversation = table.conversation_mut(conversation_id)?;
        if message.is_pending() && conversation.pending_message().is_some() {
            return Err(ValidationError::PendingExists(conversation_id.to_string()));
        }

        conversation.messages.push(message.clone());
        conversation.touch();
        let index = conversation.messages.len() - 1;
        self.commit(
            &mut table,
            vec![StoreEvent::MessageAppended {
                conversation_id: conversation_id.to_string(),
                message,
            }],
        );
        Ok(index)
    }

    /// Replace the content of the conversation's pending message.
    ///
    /// Fails without changing anything when `message_id` is not the pending
    /// message, which rejects stale or duplicate updates.
    pub fn mutate_pending_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        new_content: String,
    ) -> std::result::Result<(), ValidationError> {
        let mut table = self.table.lock();
        let conversation = table.conversation_mut(conversation_id)?;
        let message = pending_target(conversation, conversation_id, message_id)?;
        message.content = new_content.clone();
        conversation.touch();
        self.commit(
            &mut table,
            vec![StoreEvent::MessageUpdated {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.to_string(),
                content: new_content,
            }],
        );
        Ok(())
    }

    /// Append a streamed fragment to the pending message.
    ///
    /// Subscribers get only the fragment; the full text is in the table.
    pub fn append_to_pending(
        &self,
        conversation_id: &str,
        message_id: &str,
        delta: &str,
    ) -> std::result::Result<(), ValidationError> {
        let mut table = self.table.lock();
        let conversation = table.conversation_mut(conversation_id)?;
        let message = pending_target(conversation, conversation_id, message_id)?;
        message.content.push_str(delta);
        conversation.touch();
        self.commit(
            &mut table,
            vec![StoreEvent::MessageDelta {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.to_string(),
                delta: delta.to_string(),
            }],
        );
        Ok(())
    }

    /// Move a pending message to its final state.
    ///
    /// Returns `true` if the message changed state. Finalizing a message that
    /// is already final, or unknown, changes nothing.
    pub fn finalize_message(&self, conversation_id: &str, message_id: &str, outcome: Outcome) -> bool {
        let mut table = self.table.lock();
        let Ok(conversation) = table.conversation_mut(conversation_id) else {
            return false;
        };
        let Some(message) = conversation.message_mut(message_id) else {
            return false;
        };
        if !message.is_pending() {
            return false;
        }

        let state = MessageState::from(outcome);
        message.state = state;
        conversation.touch();
        self.commit(
            &mut table,
            vec![StoreEvent::MessageFinalized {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.to_string(),
                state,
            }],
        );
        true
    }

    /// Count one outgoing request in the usage counters
    pub fn record_usage(&self, message_len: usize) {
        let mut table = self.table.lock();
        table.usage.record(message_len, chrono::Utc::now());
        self.commit(&mut table, vec![]);
    }

    // ---- Reads ----

    /// All conversations in listing order
    pub fn conversations(&self) -> Vec<Conversation> {
        self.table.lock().conversations.clone()
    }

    /// All conversations, most recently updated first
    pub fn recent_conversations(&self) -> Vec<Conversation> {
        let mut conversations = self.conversations();
        // Stable, so equal timestamps keep listing order.
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        conversations
    }

    /// Conversations whose title contains `query`, ignoring case, most
    /// recently updated first. A blank query matches everything.
    pub fn search_conversations(&self, query: &str) -> Vec<Conversation> {
        let query = query.trim().to_lowercase();
        self.recent_conversations()
            .into_iter()
            .filter(|c| c.title.to_lowercase().contains(&query))
            .collect()
    }

    pub fn conversation(&self, id: &str) -> Option<Conversation> {
        self.table
            .lock()
            .conversations
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.table.lock().conversations.iter().any(|c| c.id == id)
    }

    pub fn active_conversation_id(&self) -> Option<String> {
        self.table.lock().active.clone()
    }

    pub fn active_conversation(&self) -> Option<Conversation> {
        let table = self.table.lock();
        let active = table.active.as_deref()?;
        table.conversations.iter().find(|c| c.id == active).cloned()
    }

    pub fn usage(&self) -> UsageStats {
        self.table.lock().usage.clone()
    }

    pub fn detailed_mode(&self) -> bool {
        self.table.lock().detailed_mode
    }

    /// The table as it would be persisted right now
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::capture(&self.table.lock())
    }

    /// Write the newest state to storage now, bypassing the debounce.
    ///
    /// Does nothing for in-memory stores.
    pub async fn flush(&self) -> Result<()> {
        match &self.persister {
            Some(persister) => persister.write_latest().await,
            None => Ok(()),
        }
    }
}

fn pending_target<'a>(
    conversation: &'a mut Conversation,
    conversation_id: &str,
    message_id: &str,
) -> std::result::Result<&'a mut Message, ValidationError> {
    match conversation.message_mut(message_id) {
        Some(message) if message.is_pending() => Ok(message),
        Some(_) => Err(ValidationError::NotPending {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
        }),
        None => Err(ValidationError::UnknownMessage {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
        }),
    }
}
