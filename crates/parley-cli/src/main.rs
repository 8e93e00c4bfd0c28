//! parley - terminal client for streaming conversations

mod commands;
mod config;
mod status;
mod utils;

use anyhow::{Context, anyhow};
use clap::Parser;
use parley_engine::{
    ConversationStore, CoordinatorConfig, FileStore, MessageState, Role, SendOutcome, StoreConfig,
    StoreEvent, StreamingCoordinator,
};
use parley_wire::{HttpReplyService, SessionConfig};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// parley - chat with a streaming reply service
#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base URL of the reply service (replies come from <url>/ask)
    #[arg(short, long)]
    backend_url: Option<String>,

    /// Directory conversations are stored in
    #[arg(long)]
    data_dir: Option<std::path::PathBuf>,

    /// Send a single message and exit
    #[arg(short = 'c', long)]
    command: Option<String>,

    /// Continue a conversation by id instead of the last active one
    #[arg(long)]
    conversation: Option<String>,

    /// Start a new conversation
    #[arg(short, long)]
    new: bool,

    /// List stored conversations
    #[arg(short, long)]
    list: bool,

    /// Print build and runtime information as JSON
    #[arg(long)]
    status: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Setup tracing
    if args.verbose {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("parley=debug,parley_engine=debug,parley_wire=debug")
        });
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    // Initialize config and exit
    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    // Merge config with CLI args (CLI takes precedence)
    let cfg = config::Config::load();
    let settings = config::Settings::resolve(
        &cfg,
        config::Overrides {
            backend_url: args.backend_url,
            data_dir: args.data_dir,
        },
        config::Config::backend_url_from_env(),
    );
    tracing::debug!("Settings: {:?}", settings);

    if args.status {
        println!("{}", status::Status::collect(settings.backend_url.clone()).to_json()?);
        return Ok(());
    }

    let store = ConversationStore::open(
        Arc::new(FileStore::new(settings.data_dir.clone())),
        StoreConfig {
            save_debounce: settings.save_debounce,
        },
    )
    .await
    .with_context(|| format!("Failed to load conversations from {}", settings.data_dir.display()))?;

    if args.list {
        if let commands::CommandResult::Message(text) = commands::ConversationCommand::list(&store, "") {
            println!("{}", text);
        }
        return Ok(());
    }

    let Some(endpoint) = settings.reply_endpoint() else {
        eprintln!("Error: No reply service configured");
        eprintln!();
        eprintln!("Options:");
        eprintln!("  1. Pass it on the command line: parley --backend-url http://localhost:8000");
        eprintln!("  2. Set it in the environment: export BACKEND_URL=http://localhost:8000");
        eprintln!("  3. Add it to the config file: parley --init-config");
        std::process::exit(1);
    };

    let service = HttpReplyService::new(
        endpoint,
        SessionConfig {
            connect_timeout: settings.connect_timeout,
            idle_timeout: settings.idle_timeout,
        },
    )?;
    let coordinator = Arc::new(StreamingCoordinator::with_config(
        Arc::clone(&store),
        Arc::new(service),
        CoordinatorConfig {
            title_max_chars: settings.title_max_chars,
        },
    ));

    if let Some(ref id) = args.conversation {
        if !store.select_conversation(id) {
            return Err(anyhow!("Unknown conversation: {}", id));
        }
    } else if args.new {
        store.create_conversation();
    }

    let result = match args.command {
        Some(command) => run_command(&coordinator, &command).await,
        None => run_interactive(&coordinator).await,
    };

    if let Err(e) = store.flush().await {
        eprintln!("Warning: Failed to save conversations: {}", e);
    }
    result
}

/// Send to the active conversation, creating one if nothing is selected
fn target_conversation(coordinator: &StreamingCoordinator) -> String {
    let store = coordinator.store();
    match store.active_conversation_id() {
        Some(id) => id,
        None => store.create_conversation(),
    }
}

async fn run_command(coordinator: &Arc<StreamingCoordinator>, command: &str) -> anyhow::Result<()> {
    let id = target_conversation(coordinator);
    match send_and_print(coordinator, &id, command).await? {
        SendOutcome::Completed { .. } => Ok(()),
        SendOutcome::Failed { reason, .. } => Err(anyhow!("Reply failed: {}", reason)),
        SendOutcome::Cancelled { .. } => Err(anyhow!("Reply cancelled")),
    }
}

async fn run_interactive(coordinator: &Arc<StreamingCoordinator>) -> anyhow::Result<()> {
    // Show minimal startup info (only if TTY)
    if std::io::IsTerminal::is_terminal(&std::io::stderr()) {
        match coordinator.store().active_conversation() {
            Some(c) => eprintln!("parley - \"{}\" ({} messages)", c.title, c.messages.len()),
            None => eprintln!("parley"),
        }
        eprintln!("Type /help for commands.");
        eprintln!();
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(input) = lines.next_line().await? else {
            // EOF
            break;
        };
        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        // Handle slash commands
        if let Some(result) = commands::execute_command(input, coordinator) {
            match result {
                commands::CommandResult::Exit => break,
                commands::CommandResult::Message(msg) => println!("{}", msg),
                commands::CommandResult::Unknown(cmd) => {
                    println!("Unknown command: /{}", cmd);
                    println!("Type /help for available commands.");
                }
            }
            println!();
            continue;
        }

        println!();
        let id = target_conversation(coordinator);
        match send_and_print(coordinator, &id, input).await {
            Ok(SendOutcome::Completed { .. }) => {}
            Ok(SendOutcome::Failed { reason, .. }) => eprintln!("[Reply failed: {}]", reason),
            Ok(SendOutcome::Cancelled { .. }) => eprintln!("[Cancelled]"),
            Err(e) => eprintln!("Error: {}", e),
        }
        println!();
    }

    Ok(())
}

/// Send a message, printing the reply as it streams in. Ctrl-C cancels.
async fn send_and_print(
    coordinator: &Arc<StreamingCoordinator>,
    conversation_id: &str,
    text: &str,
) -> anyhow::Result<SendOutcome> {
    let receiver = coordinator.store().subscribe();
    let mut printer = tokio::spawn(print_reply(receiver, conversation_id.to_string()));

    let send = coordinator.send_message(conversation_id, text);
    tokio::pin!(send);
    let outcome = tokio::select! {
        outcome = &mut send => outcome,
        _ = tokio::signal::ctrl_c() => {
            coordinator.cancel(conversation_id);
            send.await
        }
    };

    // The printer stops at the finalize event; rejected sends never produce one.
    let grace = if outcome.is_ok() {
        PRINTER_GRACE
    } else {
        Duration::ZERO
    };
    finish_printer(&mut printer, grace).await;
    Ok(outcome?)
}

const PRINTER_GRACE: Duration = Duration::from_millis(500);

/// Give the printer `grace` to drain, then stop it so it cannot print a later reply
async fn finish_printer(printer: &mut JoinHandle<()>, grace: Duration) {
    if tokio::time::timeout(grace, &mut *printer).await.is_err() {
        tracing::debug!("Printer did not finish within {:?}", grace);
    }
    printer.abort();
}

/// Print the assistant reply of one send from store events
async fn print_reply(mut receiver: broadcast::Receiver<StoreEvent>, conversation_id: String) {
    let mut stdout = std::io::stdout();
    let mut reply_id: Option<String> = None;

    loop {
        let event = match receiver.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!("Printer lagged by {} events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if event.conversation_id() != Some(conversation_id.as_str()) {
            continue;
        }

        match event {
            StoreEvent::MessageAppended { message, .. } if message.role == Role::Assistant => {
                reply_id = Some(message.id);
            }
            StoreEvent::MessageDelta {
                message_id, delta, ..
            } if reply_id.as_deref() == Some(message_id.as_str()) => {
                print!("{}", delta);
                stdout.flush().ok();
            }
            StoreEvent::MessageFinalized {
                message_id, state, ..
            } if reply_id.as_deref() == Some(message_id.as_str()) => {
                println!();
                if state == MessageState::Failed {
                    tracing::debug!("Reply {} ended as failed", message_id);
                }
                return;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_finish_printer_stops_a_stuck_printer() {
        let mut printer = tokio::spawn(std::future::pending::<()>());
        finish_printer(&mut printer, Duration::from_millis(20)).await;
        assert!(printer.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_finish_printer_lets_a_done_printer_finish() {
        let mut printer = tokio::spawn(async {});
        finish_printer(&mut printer, Duration::from_secs(5)).await;
        assert!(printer.is_finished());
    }

    #[tokio::test]
    async fn test_stale_printer_ignores_the_next_reply() {
        let store = ConversationStore::in_memory();
        let id = store.create_conversation();
        let mut printer = tokio::spawn(print_reply(store.subscribe(), id.clone()));
        // No reply ever arrives, so the printer is still waiting after the grace.
        finish_printer(&mut printer, Duration::from_millis(20)).await;

        store
            .append_message(&id, parley_engine::Message::assistant_pending())
            .unwrap();
        assert!(printer.await.unwrap_err().is_cancelled());
    }
}
