//! Slash commands for interactive mode

mod conversation;
mod usage;

pub use conversation::ConversationCommand;
pub use usage::UsageCommand;

use parley_engine::StreamingCoordinator;

/// Result of executing a slash command
#[derive(Debug, PartialEq)]
pub enum CommandResult {
    /// Show a message to the user (not sent to the reply service)
    Message(String),
    /// Exit the application
    Exit,
    /// Unknown command
    Unknown(String),
}

/// Parse and execute a slash command
///
/// Returns `None` when `input` is not a command and should be sent as a
/// message instead.
pub fn execute_command(input: &str, coordinator: &StreamingCoordinator) -> Option<CommandResult> {
    let input = input.trim();
    let rest = input.strip_prefix('/')?;

    let parts: Vec<&str> = rest.splitn(2, ' ').collect();
    let command = parts[0].to_lowercase();
    let args = parts.get(1).map(|s| s.trim()).unwrap_or("");

    Some(match command.as_str() {
        "help" | "h" | "?" => CommandResult::Message(help_message()),

        "quit" | "exit" | "q" => CommandResult::Exit,

        "new" | "n" => ConversationCommand::new_conversation(coordinator),

        "list" | "ls" | "l" => ConversationCommand::list(coordinator.store(), args),

        "search" | "find" => ConversationCommand::search(args, coordinator.store()),

        "select" | "s" => ConversationCommand::select(args, coordinator),

        "rename" | "r" => ConversationCommand::rename(args, coordinator),

        "delete" | "d" => ConversationCommand::delete(args, coordinator),

        "history" => ConversationCommand::history(coordinator),

        "usage" | "u" => UsageCommand::execute(coordinator),

        "detailed" => detailed_mode(args, coordinator),

        "reset" => {
            coordinator.reset_all();
            CommandResult::Message("Cleared all conversations.".to_string())
        }

        _ => CommandResult::Unknown(command),
    })
}

/// /detailed [on|off]: show or switch the reply style
fn detailed_mode(args: &str, coordinator: &StreamingCoordinator) -> CommandResult {
    let store = coordinator.store();
    let enabled = match args.to_lowercase().as_str() {
        "" => {
            return CommandResult::Message(describe_mode(store.detailed_mode()));
        }
        "on" | "true" | "yes" => true,
        "off" | "false" | "no" => false,
        _ => return CommandResult::Message("Usage: /detailed [on|off]".into()),
    };
    store.set_detailed_mode(enabled);
    CommandResult::Message(describe_mode(enabled))
}

fn describe_mode(detailed: bool) -> String {
    if detailed {
        "Detailed responses with comprehensive explanations".to_string()
    } else {
        "Concise responses for quick answers".to_string()
    }
}

fn help_message() -> String {
    r#"Available commands:
  /help, /h, /?          Show this help message
  /new, /n               Start a new conversation
  /list, /ls, /l [text]  List conversations, most recent first, optionally by title
  /search, /find <text>  List conversations whose title contains text
  /select, /s <n|id>     Switch to a conversation by list number or id prefix
  /rename, /r <title>    Rename the current conversation
  /delete, /d [n|id]     Delete a conversation (the current one by default)
  /history               Show the messages of the current conversation
  /usage, /u             Show estimated token usage
  /detailed [on|off]     Show or switch between detailed and concise replies
  /reset                 Delete every conversation
  /quit, /exit, /q       Exit parley

Press Ctrl-C while a reply is streaming to cancel it."#
        .to_string()
}
