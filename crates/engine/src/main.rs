use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use parley::{
    ChannelNotifier, Conversation, ConversationStore, ConversationTurn, HistoryReconciler,
    Notification, RequestCoordinator, SettingsStore, TurnId,
};
use parley_transport::{HttpChatTransport, HttpHistoryService, SourceLocation};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Answer being printed as it streams in.
struct FollowedTurn {
    turn_id: TurnId,
    printed: usize,
}

enum Command<'a> {
    Ask(&'a str),
    NewChat,
    Open(&'a str),
    Stop,
    ShowSettings,
    Set(&'a str, &'a str),
    Quit,
    Unknown(&'a str),
}

impl<'a> Command<'a> {
    fn parse(line: &'a str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Some(Self::Ask(line));
        };

        let (name, argument) = command
            .split_once(char::is_whitespace)
            .map(|(name, argument)| (name, argument.trim()))
            .unwrap_or((command, ""));
        Some(match name {
            "new" => Self::NewChat,
            "open" => Self::Open(argument),
            "stop" => Self::Stop,
            "settings" => Self::ShowSettings,
            "set" => {
                let (key, value) = argument
                    .split_once(char::is_whitespace)
                    .unwrap_or((argument, ""));
                Self::Set(key, value.trim())
            }
            "quit" | "exit" => Self::Quit,
            _ => Self::Unknown(name),
        })
    }
}

/// Headless front end: prompts from stdin, streamed answers on stdout.
#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings_store = SettingsStore::load();
    let settings = settings_store.settings();
    tracing::info!(
        chat_endpoint = %settings.chat_endpoint,
        history_endpoint = %settings.history_endpoint,
        framing = ?settings.framing,
        "loaded settings from {:?}",
        settings_store.config_path()
    );

    let auth = Arc::new(settings.auth());
    let transport = match HttpChatTransport::new(settings.chat_transport_config(), auth.clone()) {
        Ok(transport) => transport,
        Err(error) => {
            tracing::error!(error = %error, "failed to build chat transport");
            return ExitCode::FAILURE;
        }
    };
    let history = match HttpHistoryService::new(
        settings.history_endpoint.clone(),
        settings.request_timeout(),
        auth,
    ) {
        Ok(history) => history,
        Err(error) => {
            tracing::error!(error = %error, "failed to build history client");
            return ExitCode::FAILURE;
        }
    };

    let store = ConversationStore::new();
    let coordinator = RequestCoordinator::with_canceled_message(
        Arc::new(transport),
        store.clone(),
        settings.canceled_message.clone(),
    );
    let (notifier, mut notifications) = ChannelNotifier::new();
    let reconciler = HistoryReconciler::new(Arc::new(history), store.clone(), Arc::new(notifier));

    let mut updates = store.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut followed: Option<FollowedTurn> = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(error) => {
                        tracing::error!(error = %error, "failed to read stdin");
                        break;
                    }
                };
                let Some(command) = Command::parse(&line) else {
                    continue;
                };

                match command {
                    Command::Ask(question) => match coordinator.submit_prompt(question) {
                        Ok(turn_id) => followed = Some(FollowedTurn { turn_id, printed: 0 }),
                        Err(error) => eprintln!("! {error}"),
                    },
                    Command::NewChat => {
                        coordinator.start_new_chat().await;
                        followed = None;
                        println!("-- new chat --");
                    }
                    Command::Open(chat_id) if chat_id.is_empty() => {
                        eprintln!("! usage: /open <chat-id>");
                    }
                    Command::Open(chat_id) => {
                        coordinator.abort_request().await;
                        followed = None;
                        if reconciler.open(chat_id).await.is_ok() {
                            print_conversation(&store.snapshot());
                        }
                    }
                    Command::Stop => {
                        if !coordinator.abort_request().await {
                            eprintln!("! nothing to stop");
                        }
                    }
                    Command::ShowSettings => {
                        println!("-- settings ({}) --", settings_store.config_path().display());
                        for line in settings_store.settings().describe() {
                            println!("  {line}");
                        }
                    }
                    Command::Set(key, value) if key.is_empty() || value.is_empty() => {
                        eprintln!("! usage: /set <key> <value>");
                    }
                    Command::Set(key, value) => match settings_store.set_value(key, value) {
                        Ok(_) => println!("-- saved {key}; restart to apply --"),
                        Err(error) => eprintln!("! {error}"),
                    },
                    Command::Quit => break,
                    Command::Unknown(name) => {
                        eprintln!(
                            "! unknown command /{name} (try /new, /open <id>, /stop, /settings, /set <key> <value>, /quit)"
                        );
                    }
                }
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let conversation = updates.borrow_and_update().clone();
                if let Some(follow) = followed.as_mut()
                    && render_progress(follow, &conversation)
                {
                    followed = None;
                }
            }
            Some(Notification { severity, text }) = notifications.recv() => {
                eprintln!("! [{severity}] {text}");
            }
        }
    }

    coordinator.abort_request().await;
    ExitCode::SUCCESS
}

/// Prints the unseen part of the followed answer. Returns `true` once the
/// turn is resolved.
fn render_progress(follow: &mut FollowedTurn, conversation: &Conversation) -> bool {
    let Some(turn) = conversation.turn(follow.turn_id) else {
        return true;
    };

    if let Some(fresh) = turn.answer.get(follow.printed..) {
        print!("{fresh}");
        follow.printed = turn.answer.len();
    }

    if turn.is_pending {
        let _ = std::io::stdout().flush();
        return false;
    }

    println!();
    print_outcome(turn);
    true
}

fn print_conversation(conversation: &Conversation) {
    if let Some(chat_id) = conversation.conversation_id.as_deref() {
        println!("-- chat {chat_id} ({} turns) --", conversation.len());
    }
    for turn in &conversation.turns {
        println!("> {}", turn.question);
        println!("{}", turn.answer);
        print_outcome(turn);
    }
}

fn print_outcome(turn: &ConversationTurn) {
    if let Some(error) = turn.error.as_deref() {
        println!("[{error}]");
    }
    for source in &turn.sources {
        let citation = source
            .citation_id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_default();
        match &source.location {
            SourceLocation::File {
                bucket_name,
                object_name,
            } => println!("  [{citation}] {bucket_name}/{object_name}"),
            SourceLocation::Link { url } => println!("  [{citation}] {url}"),
        }
    }
    let _ = std::io::stdout().flush();
}
