//! Terminal chat client.
//!
//! Run with: `cargo run --bin companion-chat`
//!
//! Commands: `/undo`, `/clear`, `/history`, `/quit`. Anything else is sent
//! as a user turn and the reply is printed as it streams.

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use companion_link::chat::{ChatEvent, Conversation, Role, SqliteStorage, Storage};
use companion_link::start_companion;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn print_prompt() {
    print!("  > ");
    let _ = std::io::stdout().flush();
}

/// Print streamed replies as they arrive.
async fn print_events(mut events: tokio::sync::broadcast::Receiver<ChatEvent>) {
    loop {
        match events.recv().await {
            Ok(ChatEvent::AssistantStarted { .. }) => print!("  "),
            Ok(ChatEvent::Delta { text, .. }) => {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            Ok(ChatEvent::Completed { .. }) => println!(),
            Ok(ChatEvent::Failed { text, .. }) => println!("  ! {text}"),
            Err(RecvError::Lagged(skipped)) => println!("  ({skipped} updates skipped)"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn chat_loop(conversation: Arc<Conversation>) -> Result<(), BoxError> {
    let printer = tokio::spawn(print_events(conversation.subscribe()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    print_prompt();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => {}
            "/quit" => break,
            "/undo" => {
                if conversation.undo().await {
                    println!("  Restored.");
                } else {
                    println!("  Nothing to undo.");
                }
            }
            "/clear" => {
                conversation.clear().await;
                println!("  Cleared. Type /undo to restore.");
            }
            "/history" => {
                for message in conversation.messages().await {
                    let who = match message.role {
                        Role::User => "you",
                        Role::Assistant => "companion",
                    };
                    let star = if message.starred { " *" } else { "" };
                    println!("  [{who}{star}] {}", message.content);
                }
            }
            text => {
                conversation.send(text, None).await;
            }
        }
        print_prompt();
    }

    printer.abort();
    Ok(())
}

fn main() -> ExitCode {
    start_companion::init_tracing();

    println!();
    println!("  ╔═══════════════════════════════════════════╗");
    println!("  ║        Companion Link - Terminal Chat     ║");
    println!("  ╚═══════════════════════════════════════════╝");
    println!();

    let config = match start_companion::load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("  Invalid configuration: {e}");
            return ExitCode::from(1);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("  Failed to create runtime: {e}");
            return ExitCode::from(1);
        }
    };

    let storage: Arc<dyn Storage> =
        match rt.block_on(SqliteStorage::open(&config.chat.storage_path)) {
            Ok(storage) => Arc::new(storage),
            Err(e) => {
                eprintln!("  Failed to open {}: {e}", config.chat.storage_path.display());
                return ExitCode::from(1);
            }
        };

    let conversation =
        match rt.block_on(Conversation::with_rolling_memory(&config.chat, storage)) {
            Ok(conversation) => Arc::new(conversation),
            Err(e) => {
                eprintln!("  Failed to start conversation: {e}");
                return ExitCode::from(1);
            }
        };

    println!("  Commands: /undo /clear /history /quit");
    println!();

    if let Err(e) = rt.block_on(chat_loop(conversation)) {
        eprintln!("  Error: {e}");
        return ExitCode::from(1);
    }

    println!();
    ExitCode::SUCCESS
}
