//! Conversation management commands

use super::CommandResult;
use crate::utils::{format_timestamp, truncate_chars};
use parley_engine::{Conversation, ConversationStore, MessageState, StreamingCoordinator};

pub struct ConversationCommand;

impl ConversationCommand {
    pub fn new_conversation(coordinator: &StreamingCoordinator) -> CommandResult {
        let id = coordinator.store().create_conversation();
        CommandResult::Message(format!("Started conversation {}", short_id(&id)))
    }

    /// /list [query]: conversations by recency, optionally filtered by title
    pub fn list(store: &ConversationStore, query: &str) -> CommandResult {
        let recent = store.recent_conversations();
        if recent.is_empty() {
            return CommandResult::Message("No conversations yet. Type a message to start one.".into());
        }

        // Numbers always refer to the unfiltered list so /select works after a search.
        let matches = store.search_conversations(query);
        let entries: Vec<(usize, &Conversation)> = matches
            .iter()
            .filter_map(|m| recent.iter().position(|c| c.id == m.id).map(|i| (i + 1, m)))
            .collect();
        if entries.is_empty() {
            return CommandResult::Message(format!("No conversation titles contain '{}'", query.trim()));
        }
        let active = store.active_conversation_id();
        CommandResult::Message(list_text(&entries, active.as_deref()))
    }

    /// /search <query>
    pub fn search(args: &str, store: &ConversationStore) -> CommandResult {
        if args.is_empty() {
            return CommandResult::Message("Usage: /search <text>".into());
        }
        Self::list(store, args)
    }

    /// /select <n|id>
    pub fn select(args: &str, coordinator: &StreamingCoordinator) -> CommandResult {
        if args.is_empty() {
            return CommandResult::Message("Usage: /select <number|id>".into());
        }
        let conversations = coordinator.store().recent_conversations();
        match resolve(args, &conversations) {
            Some(conversation) => {
                coordinator.store().select_conversation(&conversation.id);
                CommandResult::Message(format!(
                    "Switched to \"{}\" ({} messages)",
                    conversation.title,
                    conversation.messages.len()
                ))
            }
            None => CommandResult::Message(format!("No conversation matches '{}'", args)),
        }
    }

    /// /rename <title>, applied to the active conversation
    pub fn rename(args: &str, coordinator: &StreamingCoordinator) -> CommandResult {
        let Some(id) = coordinator.store().active_conversation_id() else {
            return CommandResult::Message("No conversation selected.".into());
        };
        if coordinator.store().rename_conversation(&id, args) {
            CommandResult::Message(format!("Renamed to \"{}\"", args.trim()))
        } else {
            CommandResult::Message("Usage: /rename <title>".into())
        }
    }

    /// /delete [n|id], defaulting to the active conversation
    pub fn delete(args: &str, coordinator: &StreamingCoordinator) -> CommandResult {
        let target = if args.is_empty() {
            coordinator.store().active_conversation()
        } else {
            resolve(args, &coordinator.store().recent_conversations()).cloned()
        };
        let Some(conversation) = target else {
            return CommandResult::Message("No conversation to delete.".into());
        };

        coordinator.delete_conversation(&conversation.id);
        let mut output = format!("Deleted \"{}\"", conversation.title);
        if let Some(active) = coordinator.store().active_conversation() {
            output.push_str(&format!("\nNow in \"{}\"", active.title));
        }
        CommandResult::Message(output)
    }

    /// /history: the messages of the active conversation
    pub fn history(coordinator: &StreamingCoordinator) -> CommandResult {
        let Some(conversation) = coordinator.store().active_conversation() else {
            return CommandResult::Message("No conversation selected.".into());
        };
        if conversation.messages.is_empty() {
            return CommandResult::Message(format!("\"{}\" has no messages.", conversation.title));
        }

        let mut output = format!("{}\n", conversation.title);
        output.push_str(&"-".repeat(40));
        for message in &conversation.messages {
            let marker = match message.state {
                MessageState::Failed => " [failed]",
                MessageState::Pending => " [streaming]",
                MessageState::Complete => "",
            };
            output.push_str(&format!(
                "\n{}{}: {}",
                message.role.as_str(),
                marker,
                message.content
            ));
        }
        CommandResult::Message(output)
    }
}

/// First eight characters after the id prefix
fn short_id(id: &str) -> &str {
    let bare = id.strip_prefix("chat-").unwrap_or(id);
    bare.get(..8).unwrap_or(bare)
}

/// Resolve a 1-based number in the recency-ordered list, or an id prefix
fn resolve<'a>(arg: &str, conversations: &'a [Conversation]) -> Option<&'a Conversation> {
    if let Ok(n) = arg.parse::<usize>() {
        return n.checked_sub(1).and_then(|i| conversations.get(i));
    }
    let matches: Vec<&Conversation> = conversations
        .iter()
        .filter(|c| c.id.starts_with(arg) || short_id(&c.id).starts_with(arg))
        .collect();
    match matches.as_slice() {
        [only] => Some(*only),
        _ => None,
    }
}

fn list_text(entries: &[(usize, &Conversation)], active: Option<&str>) -> String {
    let mut output = String::from("Conversations:\n\n");
    output.push_str(&format!(
        "  {:<4} {:<10} {:<18} {:<6} Title\n",
        "#", "ID", "Updated", "Msgs"
    ));
    output.push_str(&format!("  {}\n", "-".repeat(70)));
    for (number, c) in entries {
        let marker = if Some(c.id.as_str()) == active { "*" } else { " " };
        output.push_str(&format!(
            "{} {:<4} {:<10} {:<18} {:<6} {}\n",
            marker,
            number,
            short_id(&c.id),
            format_timestamp(c.updated_at),
            c.messages.len(),
            truncate_chars(&c.title, 40)
        ));
    }
    output.push_str("\nSwitch with: /select <number>");
    output
}
