//! Drives one reply at a time per conversation
//!
//! A send appends the user message and an empty pending assistant message,
//! opens a reply session and applies each delta to the pending message until
//! the session ends. Every path out of a send finalizes the pending message.

use std::{collections::HashMap, sync::Arc};

use futures::StreamExt;
use parking_lot::Mutex;
use parley_wire::{ContextMessage, ReplyEvent, ReplyEventStream, ReplyRequest, ReplyService};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Result, ValidationError},
    events::StoreEvent,
    store::ConversationStore,
    types::{Message, MessageState, Outcome, title_prefix},
};

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Titles derived from a first message are cut to this many characters
    pub title_max_chars: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            title_max_chars: 50,
        }
    }
}

/// Where a conversation is in its reply cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No reply in flight
    Idle,
    /// Request sent, waiting for the reply stream to open
    Sending,
    /// Deltas are being applied
    Streaming,
}

/// How a send ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The reply finished with the terminal marker
    Completed { message_id: String },
    /// The reply failed; partial content is kept on the failed message
    Failed { message_id: String, reason: String },
    /// The reply was cancelled
    Cancelled { message_id: String },
}

impl SendOutcome {
    /// Id of the assistant message the reply was written to
    pub fn message_id(&self) -> &str {
        match self {
            SendOutcome::Completed { message_id }
            | SendOutcome::Failed { message_id, .. }
            | SendOutcome::Cancelled { message_id } => message_id,
        }
    }
}

struct ActiveSession {
    cancel: CancellationToken,
    /// Set once the pending assistant message exists
    message_id: Option<String>,
    state: SessionState,
}

type Sessions = Arc<Mutex<HashMap<String, ActiveSession>>>;

/// Releases a conversation's session slot when a send ends, however it ends.
///
/// If the send is dropped mid-flight the pending message is failed here, so
/// a session never outlives its message.
struct SessionGuard {
    sessions: Sessions,
    store: Arc<ConversationStore>,
    conversation_id: String,
}

impl SessionGuard {
    fn set_message(&self, message_id: &str) {
        if let Some(session) = self.sessions.lock().get_mut(&self.conversation_id) {
            session.message_id = Some(message_id.to_string());
        }
    }

    fn set_state(&self, state: SessionState) {
        if let Some(session) = self.sessions.lock().get_mut(&self.conversation_id) {
            session.state = state;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let session = self.sessions.lock().remove(&self.conversation_id);
        if let Some(session) = session {
            session.cancel.cancel();
            if let Some(message_id) = session.message_id {
                if self
                    .store
                    .finalize_message(&self.conversation_id, &message_id, Outcome::Failed)
                {
                    tracing::debug!("Abandoned reply {} marked failed", message_id);
                }
            }
        }
        self.store.notify(StoreEvent::StreamingChanged {
            conversation_id: self.conversation_id.clone(),
            streaming: false,
        });
    }
}

/// Runs sends against a [`ReplyService`] and records them in a store
pub struct StreamingCoordinator {
    store: Arc<ConversationStore>,
    service: Arc<dyn ReplyService>,
    sessions: Sessions,
    config: CoordinatorConfig,
}

impl StreamingCoordinator {
    pub fn new(store: Arc<ConversationStore>, service: Arc<dyn ReplyService>) -> Self {
        Self::with_config(store, service, CoordinatorConfig::default())
    }

    pub fn with_config(
        store: Arc<ConversationStore>,
        service: Arc<dyn ReplyService>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            service,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// The store this coordinator writes to
    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Send `text` to a conversation and stream the reply into it.
    ///
    /// Returns once the reply has ended. Empty input, an unknown
    /// conversation, or a reply already in flight for the conversation are
    /// rejected without changing anything. Transport failures are not
    /// errors: they end the send with [`SendOutcome::Failed`].
    pub async fn send_message(&self, conversation_id: &str, text: &str) -> Result<SendOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ValidationError::EmptyInput.into());
        }
        let conversation = self
            .store
            .conversation(conversation_id)
            .ok_or_else(|| ValidationError::UnknownConversation(conversation_id.to_string()))?;

        let cancel = CancellationToken::new();
        let guard = self.begin(conversation_id, cancel.clone())?;

        let context: Vec<ContextMessage> = conversation
            .messages
            .iter()
            .filter(|m| m.state == MessageState::Complete)
            .map(|m| ContextMessage {
                role: m.role.as_str().to_string(),
                content: m.content.clone(),
            })
            .collect();

        self.store
            .append_message(conversation_id, Message::user(text))?;
        if conversation.messages.is_empty() {
            self.store.rename_conversation(
                conversation_id,
                &title_prefix(text, self.config.title_max_chars),
            );
        }
        self.store.record_usage(text.chars().count());

        let reply = Message::assistant_pending();
        let message_id = reply.id.clone();
        self.store.append_message(conversation_id, reply)?;
        guard.set_message(&message_id);
        if cancel.is_cancelled() {
            self.finish(conversation_id, &message_id, Outcome::Failed);
            return Ok(SendOutcome::Cancelled { message_id });
        }

        let request = ReplyRequest {
            conversation_id: conversation_id.to_string(),
            messages: context,
            prompt: text.to_string(),
            detailed: self.store.detailed_mode(),
        };

        tracing::info!(
            "Sending message to conversation {} ({} context messages)",
            conversation_id,
            request.messages.len()
        );

        let stream = match self.service.open(&request, cancel.clone()).await {
            Ok(stream) => stream,
            Err(_) if cancel.is_cancelled() => {
                self.finish(conversation_id, &message_id, Outcome::Failed);
                return Ok(SendOutcome::Cancelled { message_id });
            }
            Err(e) => {
                tracing::warn!("Reply request for {} failed: {}", conversation_id, e);
                self.finish(conversation_id, &message_id, Outcome::Failed);
                return Ok(SendOutcome::Failed {
                    message_id,
                    reason: e.to_string(),
                });
            }
        };

        guard.set_state(SessionState::Streaming);
        let outcome = self
            .apply_stream(stream, conversation_id, &message_id, &cancel)
            .await;
        drop(guard);
        Ok(outcome)
    }

    /// Send `text` to the active conversation
    pub async fn send_to_active(&self, text: &str) -> Result<SendOutcome> {
        let conversation_id = self
            .store
            .active_conversation_id()
            .ok_or(ValidationError::NoActiveConversation)?;
        self.send_message(&conversation_id, text).await
    }

    /// Claim the conversation's session slot
    fn begin(&self, conversation_id: &str, cancel: CancellationToken) -> Result<SessionGuard> {
        {
            let mut sessions = self.sessions.lock();
            if sessions.contains_key(conversation_id) {
                tracing::warn!(
                    "Rejected send: conversation {} is already streaming",
                    conversation_id
                );
                return Err(ValidationError::AlreadyStreaming(conversation_id.to_string()).into());
            }
            sessions.insert(
                conversation_id.to_string(),
                ActiveSession {
                    cancel,
                    message_id: None,
                    state: SessionState::Sending,
                },
            );
        }

        self.store.notify(StoreEvent::StreamingChanged {
            conversation_id: conversation_id.to_string(),
            streaming: true,
        });
        Ok(SessionGuard {
            sessions: Arc::clone(&self.sessions),
            store: Arc::clone(&self.store),
            conversation_id: conversation_id.to_string(),
        })
    }

    async fn apply_stream(
        &self,
        mut stream: ReplyEventStream,
        conversation_id: &str,
        message_id: &str,
        cancel: &CancellationToken,
    ) -> SendOutcome {
        let message_id_owned = message_id.to_string();

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.finish(conversation_id, message_id, Outcome::Failed);
                    return SendOutcome::Cancelled { message_id: message_id_owned };
                }
                event = stream.next() => event,
            };

            match event {
                Some(ReplyEvent::Delta { text }) => {
                    if let Err(e) = self.store.append_to_pending(conversation_id, message_id, &text) {
                        // Cancelled or deleted underneath us.
                        tracing::debug!("Dropping delta for {}: {}", message_id, e);
                        if cancel.is_cancelled() || !self.store.contains(conversation_id) {
                            return SendOutcome::Cancelled {
                                message_id: message_id_owned,
                            };
                        }
                        self.finish(conversation_id, message_id, Outcome::Failed);
                        return SendOutcome::Failed {
                            message_id: message_id_owned,
                            reason: e.to_string(),
                        };
                    }
                }
                Some(ReplyEvent::Done) => {
                    self.finish(conversation_id, message_id, Outcome::Complete);
                    tracing::info!("Reply {} complete", message_id);
                    return SendOutcome::Completed {
                        message_id: message_id_owned,
                    };
                }
                Some(ReplyEvent::Error { message }) => {
                    tracing::warn!("Reply {} failed: {}", message_id, message);
                    self.finish(conversation_id, message_id, Outcome::Failed);
                    return SendOutcome::Failed {
                        message_id: message_id_owned,
                        reason: message,
                    };
                }
                None => {
                    if cancel.is_cancelled() {
                        self.finish(conversation_id, message_id, Outcome::Failed);
                        return SendOutcome::Cancelled {
                            message_id: message_id_owned,
                        };
                    }
                    tracing::warn!("Reply {} ended without terminal marker", message_id);
                    self.finish(conversation_id, message_id, Outcome::Failed);
                    return SendOutcome::Failed {
                        message_id: message_id_owned,
                        reason: "reply ended before completion".to_string(),
                    };
                }
            }
        }
    }

    fn finish(&self, conversation_id: &str, message_id: &str, outcome: Outcome) {
        self.store
            .finalize_message(conversation_id, message_id, outcome);
    }

    /// Cancel the reply streaming into a conversation.
    ///
    /// The pending message is failed immediately with whatever content has
    /// arrived. Returns `false` if no reply is in flight.
    pub fn cancel(&self, conversation_id: &str) -> bool {
        let target = {
            let sessions = self.sessions.lock();
            match sessions.get(conversation_id) {
                Some(session) => {
                    session.cancel.cancel();
                    session.message_id.clone()
                }
                None => return false,
            }
        };

        tracing::info!("Cancelled reply in conversation {}", conversation_id);
        if let Some(message_id) = target {
            self.finish(conversation_id, &message_id, Outcome::Failed);
        }
        true
    }

    /// Cancel the reply streaming into the active conversation, if any
    pub fn cancel_active(&self) -> bool {
        match self.store.active_conversation_id() {
            Some(id) => self.cancel(&id),
            None => false,
        }
    }

    pub fn state(&self, conversation_id: &str) -> SessionState {
        self.sessions
            .lock()
            .get(conversation_id)
            .map(|s| s.state)
            .unwrap_or(SessionState::Idle)
    }

    /// Whether a reply is in flight for the conversation
    pub fn is_streaming(&self, conversation_id: &str) -> bool {
        self.sessions.lock().contains_key(conversation_id)
    }

    /// Whether a reply is in flight for the active conversation
    pub fn is_active_streaming(&self) -> bool {
        self.store
            .active_conversation_id()
            .is_some_and(|id| self.is_streaming(&id))
    }

    /// Delete a conversation, cancelling its reply first
    pub fn delete_conversation(&self, conversation_id: &str) -> bool {
        self.cancel(conversation_id);
        self.store.delete_conversation(conversation_id)
    }

    /// Cancel every reply and clear the store
    pub fn reset_all(&self) {
        let ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        for id in ids {
            self.cancel(&id);
        }
        self.store.reset_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DEFAULT_TITLE, Role};
    use async_stream::stream;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::mpsc;

    enum Script {
        /// Replay these events, then end
        Events(Vec<ReplyEvent>),
        /// Forward events from the test until the sender is dropped
        Channel(mpsc::UnboundedReceiver<ReplyEvent>),
        /// Fail to open
        Refuse,
    }

    #[derive(Default)]
    struct ScriptedReplyService {
        scripts: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<ReplyRequest>>,
    }

    impl ScriptedReplyService {
        fn push(&self, script: Script) {
            self.scripts.lock().push_back(script);
        }

        fn channel(&self) -> mpsc::UnboundedSender<ReplyEvent> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.push(Script::Channel(rx));
            tx
        }

        fn requests(&self) -> Vec<ReplyRequest> {
            self.requests.lock().clone()
        }
    }

    #[async_trait]
    impl ReplyService for ScriptedReplyService {
        async fn open(
            &self,
            request: &ReplyRequest,
            cancel: CancellationToken,
        ) -> parley_wire::Result<ReplyEventStream> {
            self.requests.lock().push(request.clone());
            let script = self
                .scripts
                .lock()
                .pop_front()
                .unwrap_or(Script::Events(vec![ReplyEvent::Done]));

            match script {
                Script::Refuse => Err(parley_wire::Error::Transport("connection refused".into())),
                Script::Events(events) => Ok(Box::pin(futures::stream::iter(events))),
                Script::Channel(mut rx) => Ok(Box::pin(stream! {
                    loop {
                        let next = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return,
                            next = rx.recv() => next,
                        };
                        match next {
                            Some(event) => {
                                let terminal = event.is_terminal();
                                yield event;
                                if terminal {
                                    return;
                                }
                            }
                            None => return,
                        }
                    }
                })),
            }
        }
    }

    fn setup() -> (Arc<StreamingCoordinator>, Arc<ScriptedReplyService>) {
        let store = ConversationStore::in_memory();
        let service = Arc::new(ScriptedReplyService::default());
        let coordinator = Arc::new(StreamingCoordinator::new(store, service.clone()));
        (coordinator, service)
    }

    fn delta(text: &str) -> ReplyEvent {
        ReplyEvent::Delta { text: text.into() }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }

    fn last_message(coordinator: &StreamingCoordinator, id: &str) -> Message {
        coordinator
            .store()
            .conversation(id)
            .unwrap()
            .messages
            .last()
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn test_send_completes_reply() {
        let (coordinator, service) = setup();
        service.push(Script::Events(vec![delta("Hi"), delta(" there"), ReplyEvent::Done]));
        let id = coordinator.store().create_conversation();

        let outcome = coordinator.send_message(&id, "hello").await.unwrap();
        assert!(matches!(outcome, SendOutcome::Completed { .. }));

        let conversation = coordinator.store().conversation(&id).unwrap();
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[0].role, Role::User);
        assert_eq!(conversation.messages[0].content, "hello");
        let reply = &conversation.messages[1];
        assert_eq!(reply.id, outcome.message_id());
        assert_eq!(reply.content, "Hi there");
        assert_eq!(reply.state, MessageState::Complete);
        assert_eq!(conversation.title, "hello");
        assert_eq!(coordinator.state(&id), SessionState::Idle);

        let requests = service.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].prompt, "hello");
        assert_eq!(requests[0].conversation_id, id);
        assert!(requests[0].messages.is_empty());
    }

    #[tokio::test]
    async fn test_drop_without_terminal_fails_reply() {
        let (coordinator, service) = setup();
        service.push(Script::Events(vec![delta("Work")]));
        let id = coordinator.store().create_conversation();

        let outcome = coordinator.send_message(&id, "go").await.unwrap();
        assert!(matches!(outcome, SendOutcome::Failed { .. }));
        let reply = last_message(&coordinator, &id);
        assert_eq!(reply.content, "Work");
        assert_eq!(reply.state, MessageState::Failed);
    }

    #[tokio::test]
    async fn test_error_event_fails_reply() {
        let (coordinator, service) = setup();
        service.push(Script::Events(vec![
            delta("Work"),
            ReplyEvent::Error {
                message: "connection lost: reset".into(),
            },
        ]));
        let id = coordinator.store().create_conversation();

        let outcome = coordinator.send_message(&id, "go").await.unwrap();
        assert_eq!(
            outcome,
            SendOutcome::Failed {
                message_id: outcome.message_id().to_string(),
                reason: "connection lost: reset".into()
            }
        );
        assert_eq!(last_message(&coordinator, &id).content, "Work");
    }

    #[tokio::test]
    async fn test_open_failure_fails_reply() {
        let (coordinator, service) = setup();
        service.push(Script::Refuse);
        let id = coordinator.store().create_conversation();

        let outcome = coordinator.send_message(&id, "hello").await.unwrap();
        assert!(matches!(outcome, SendOutcome::Failed { ref reason, .. } if reason.contains("refused")));
        let reply = last_message(&coordinator, &id);
        assert_eq!(reply.state, MessageState::Failed);
        assert!(reply.content.is_empty());
        assert!(!coordinator.is_streaming(&id));
    }

    #[tokio::test]
    async fn test_cancel_keeps_partial_content() {
        let (coordinator, service) = setup();
        let tx = service.channel();
        let id = coordinator.store().create_conversation();

        let task = {
            let coordinator = coordinator.clone();
            let id = id.clone();
            tokio::spawn(async move { coordinator.send_message(&id, "write a story").await })
        };

        wait_until(|| coordinator.state(&id) == SessionState::Streaming).await;
        tx.send(delta("Once")).unwrap();
        tx.send(delta(" upon")).unwrap();
        wait_until(|| last_message(&coordinator, &id).content == "Once upon").await;

        assert!(coordinator.cancel(&id));
        // Content is frozen from the moment of cancel.
        let _ = tx.send(delta(" a time"));

        let outcome = task.await.unwrap().unwrap();
        assert!(matches!(outcome, SendOutcome::Cancelled { .. }));
        let reply = last_message(&coordinator, &id);
        assert_eq!(reply.content, "Once upon");
        assert_eq!(reply.state, MessageState::Failed);
        assert_eq!(coordinator.state(&id), SessionState::Idle);
    }

    fn pending_count(coordinator: &StreamingCoordinator, id: &str) -> usize {
        coordinator.store().conversation(id).unwrap().pending_count()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_at_most_one_pending_through_every_transition() {
        use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

        let (coordinator, service) = setup();
        let id = coordinator.store().create_conversation();

        // Check the table on every event a subscriber observes.
        let max_seen = Arc::new(AtomicUsize::new(0));
        let finalized = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let watcher = {
            let store = Arc::clone(coordinator.store());
            let mut rx = store.subscribe();
            let (max_seen, finalized, stop) = (max_seen.clone(), finalized.clone(), stop.clone());
            let id = id.clone();
            tokio::spawn(async move {
                while !stop.load(Ordering::Acquire) {
                    let Ok(event) = rx.recv().await else { return };
                    if let Some(c) = store.conversation(&id) {
                        max_seen.fetch_max(c.pending_count(), Ordering::AcqRel);
                    }
                    if matches!(event, StoreEvent::MessageFinalized { .. }) {
                        finalized.fetch_add(1, Ordering::AcqRel);
                    }
                }
            })
        };

        // A cancelled reply.
        let tx = service.channel();
        assert_eq!(pending_count(&coordinator, &id), 0);
        let task = {
            let coordinator = coordinator.clone();
            let id = id.clone();
            tokio::spawn(async move { coordinator.send_message(&id, "first").await })
        };
        wait_until(|| coordinator.state(&id) == SessionState::Streaming).await;
        assert_eq!(pending_count(&coordinator, &id), 1);
        for (i, text) in ["a", "b", "c"].into_iter().enumerate() {
            tx.send(delta(text)).unwrap();
            wait_until(|| last_message(&coordinator, &id).content.len() == i + 1).await;
            assert_eq!(pending_count(&coordinator, &id), 1);
        }
        assert!(coordinator.cancel(&id));
        assert_eq!(pending_count(&coordinator, &id), 0);
        task.await.unwrap().unwrap();

        // A completed reply.
        let tx = service.channel();
        let task = {
            let coordinator = coordinator.clone();
            let id = id.clone();
            tokio::spawn(async move { coordinator.send_message(&id, "second").await })
        };
        wait_until(|| coordinator.state(&id) == SessionState::Streaming).await;
        assert_eq!(pending_count(&coordinator, &id), 1);
        tx.send(delta("done")).unwrap();
        tx.send(ReplyEvent::Done).unwrap();
        let outcome = task.await.unwrap().unwrap();
        assert!(matches!(outcome, SendOutcome::Completed { .. }));
        assert_eq!(pending_count(&coordinator, &id), 0);

        wait_until(|| finalized.load(Ordering::Acquire) >= 2).await;
        stop.store(true, Ordering::Release);
        watcher.abort();
        assert_eq!(max_seen.load(Ordering::Acquire), 1);
        assert_eq!(coordinator.store().conversation(&id).unwrap().messages.len(), 4);
    }

    #[tokio::test]
    async fn test_detailed_mode_sent_with_request() {
        let (coordinator, service) = setup();
        let id = coordinator.store().create_conversation();
        coordinator.send_message(&id, "short").await.unwrap();
        coordinator.store().set_detailed_mode(true);
        coordinator.send_message(&id, "long").await.unwrap();

        let requests = service.requests();
        assert!(!requests[0].detailed);
        assert!(requests[1].detailed);
    }

    #[tokio::test]
    async fn test_cancel_when_idle_is_noop() {
        let (coordinator, _service) = setup();
        let id = coordinator.store().create_conversation();
        assert!(!coordinator.cancel(&id));
        assert!(!coordinator.cancel_active());
    }

    #[tokio::test]
    async fn test_second_send_rejected_while_streaming() {
        let (coordinator, service) = setup();
        let tx = service.channel();
        let id = coordinator.store().create_conversation();

        let task = {
            let coordinator = coordinator.clone();
            let id = id.clone();
            tokio::spawn(async move { coordinator.send_message(&id, "first").await })
        };
        wait_until(|| coordinator.is_streaming(&id)).await;
        assert!(coordinator.is_active_streaming());

        let err = coordinator.send_message(&id, "second").await.unwrap_err();
        assert!(err.is_validation());
        assert_eq!(coordinator.store().conversation(&id).unwrap().messages.len(), 2);

        tx.send(delta("ok")).unwrap();
        tx.send(ReplyEvent::Done).unwrap();
        let outcome = task.await.unwrap().unwrap();
        assert!(matches!(outcome, SendOutcome::Completed { .. }));
        assert!(!coordinator.is_active_streaming());
    }

    #[tokio::test]
    async fn test_empty_input_rejected() {
        let (coordinator, service) = setup();
        let id = coordinator.store().create_conversation();

        for text in ["", "   ", "\n\t"] {
            let err = coordinator.send_message(&id, text).await.unwrap_err();
            assert!(err.is_validation());
        }
        assert!(coordinator.store().conversation(&id).unwrap().messages.is_empty());
        assert!(service.requests().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_conversation_rejected() {
        let (coordinator, _service) = setup();
        let err = coordinator.send_message("chat-missing", "hi").await.unwrap_err();
        assert!(err.is_validation());

        let err = coordinator.send_to_active("hi").await.unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Validation(ValidationError::NoActiveConversation)
        ));
    }

    #[tokio::test]
    async fn test_title_derived_from_first_message_only() {
        let (coordinator, service) = setup();
        service.push(Script::Events(vec![ReplyEvent::Done]));
        service.push(Script::Events(vec![ReplyEvent::Done]));
        let id = coordinator.store().create_conversation();
        assert_eq!(coordinator.store().conversation(&id).unwrap().title, DEFAULT_TITLE);

        let long = "x".repeat(80);
        coordinator.send_message(&id, &long).await.unwrap();
        assert_eq!(coordinator.store().conversation(&id).unwrap().title, "x".repeat(50));

        coordinator.send_message(&id, "another topic").await.unwrap();
        assert_eq!(coordinator.store().conversation(&id).unwrap().title, "x".repeat(50));
    }

    #[tokio::test]
    async fn test_context_contains_prior_complete_messages() {
        let (coordinator, service) = setup();
        service.push(Script::Events(vec![delta("A1"), ReplyEvent::Done]));
        service.push(Script::Events(vec![delta("partial")]));
        service.push(Script::Events(vec![ReplyEvent::Done]));
        let id = coordinator.store().create_conversation();

        coordinator.send_message(&id, "Q1").await.unwrap();
        coordinator.send_message(&id, "Q2").await.unwrap();
        coordinator.send_to_active("Q3").await.unwrap();

        let requests = service.requests();
        let context: Vec<(&str, &str)> = requests[2]
            .messages
            .iter()
            .map(|m| (m.role.as_str(), m.content.as_str()))
            .collect();
        // The failed reply to Q2 is left out.
        assert_eq!(
            context,
            vec![("user", "Q1"), ("assistant", "A1"), ("user", "Q2")]
        );
        assert_eq!(requests[2].prompt, "Q3");
    }

    #[tokio::test]
    async fn test_conversations_stream_independently() {
        let (coordinator, service) = setup();
        let tx_a = service.channel();
        let tx_b = service.channel();
        let a = coordinator.store().create_conversation();
        let b = coordinator.store().create_conversation();

        let task_a = {
            let coordinator = coordinator.clone();
            let a = a.clone();
            tokio::spawn(async move { coordinator.send_message(&a, "to a").await })
        };
        wait_until(|| coordinator.state(&a) == SessionState::Streaming).await;
        let task_b = {
            let coordinator = coordinator.clone();
            let b = b.clone();
            tokio::spawn(async move { coordinator.send_message(&b, "to b").await })
        };
        wait_until(|| coordinator.state(&b) == SessionState::Streaming).await;

        tx_b.send(delta("B")).unwrap();
        tx_a.send(delta("A")).unwrap();
        tx_b.send(ReplyEvent::Done).unwrap();
        tx_a.send(ReplyEvent::Done).unwrap();

        task_a.await.unwrap().unwrap();
        task_b.await.unwrap().unwrap();
        assert_eq!(last_message(&coordinator, &a).content, "A");
        assert_eq!(last_message(&coordinator, &b).content, "B");
    }

    #[tokio::test]
    async fn test_delete_while_streaming_cancels() {
        let (coordinator, service) = setup();
        let tx = service.channel();
        let id = coordinator.store().create_conversation();

        let task = {
            let coordinator = coordinator.clone();
            let id = id.clone();
            tokio::spawn(async move { coordinator.send_message(&id, "hi").await })
        };
        wait_until(|| coordinator.state(&id) == SessionState::Streaming).await;

        assert!(coordinator.delete_conversation(&id));
        let _ = tx.send(delta("late"));
        let outcome = task.await.unwrap().unwrap();
        assert!(matches!(outcome, SendOutcome::Cancelled { .. }));
        assert!(!coordinator.store().contains(&id));
        assert!(!coordinator.is_streaming(&id));
    }

    #[tokio::test]
    async fn test_abandoned_send_fails_pending_message() {
        let (coordinator, service) = setup();
        let _tx = service.channel();
        let id = coordinator.store().create_conversation();

        let result =
            tokio::time::timeout(Duration::from_millis(50), coordinator.send_message(&id, "hi"))
                .await;
        assert!(result.is_err());

        let reply = last_message(&coordinator, &id);
        assert_eq!(reply.state, MessageState::Failed);
        assert_eq!(coordinator.state(&id), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_streaming_changed_events() {
        let (coordinator, service) = setup();
        service.push(Script::Events(vec![ReplyEvent::Done]));
        let id = coordinator.store().create_conversation();
        let mut rx = coordinator.store().subscribe();

        coordinator.send_message(&id, "hi").await.unwrap();

        let mut flags = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let StoreEvent::StreamingChanged { streaming, .. } = event {
                flags.push(streaming);
            }
        }
        assert_eq!(flags, vec![true, false]);
    }

    #[tokio::test]
    async fn test_reset_all_cancels_sessions() {
        let (coordinator, service) = setup();
        let _tx = service.channel();
        let id = coordinator.store().create_conversation();

        let task = {
            let coordinator = coordinator.clone();
            let id = id.clone();
            tokio::spawn(async move { coordinator.send_message(&id, "hi").await })
        };
        wait_until(|| coordinator.is_streaming(&id)).await;

        coordinator.reset_all();
        let outcome = task.await.unwrap().unwrap();
        assert!(matches!(outcome, SendOutcome::Cancelled { .. }));
        assert!(coordinator.store().conversations().is_empty());
    }
}
