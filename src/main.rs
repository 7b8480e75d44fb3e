use std::collections::HashSet;

use clap::{Parser, Subcommand};
use recruit_chat::net::api::{ChatApi, HttpChatApi};
use recruit_chat::net::types::CreateConversationParams;
use recruit_chat::{ChatConfig, ChatError, ChatSession, ConversationView, StatusView, chat::render::bubbles};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("missing company uuid; pass --company-uuid or set CHAT_COMPANY_UUID")]
    MissingCompany,
    #[error(transparent)]
    Chat(#[from] ChatError),
    #[error("stdin read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "recruit-chat", about = "Recruitment dashboard chat client")]
struct Cli {
    #[arg(long, env = "CHAT_HUB_URL")]
    hub_url: Option<String>,

    #[arg(long, env = "CHAT_API_BASE_URL")]
    api_base_url: Option<String>,

    #[arg(long, env = "CHAT_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    #[arg(long, env = "CHAT_COMPANY_UUID")]
    company_uuid: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the company's conversations.
    Conversations,
    /// Print the message history of a conversation.
    History { conversation: String },
    /// Send one message and print the server's copy.
    Send { conversation: String, text: String },
    /// Open (or fetch) the conversation with a student.
    CreateConversation {
        #[arg(long)]
        student: String,
    },
    /// Interactive chat. `/reconnect` retries the hub, `/quit` leaves.
    Chat { conversation: String },
}

impl Cli {
    fn config(&self) -> Result<ChatConfig, CliError> {
        let mut config = ChatConfig::from_env()?;
        if let Some(url) = &self.hub_url {
            config.hub_url.clone_from(url);
        }
        if let Some(url) = &self.api_base_url {
            config.api_base_url = url.trim_end_matches('/').to_owned();
        }
        if self.access_token.is_some() {
            config.access_token.clone_from(&self.access_token);
        }
        if self.company_uuid.is_some() {
            config.company_uuid.clone_from(&self.company_uuid);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let config = cli.config()?;

    match cli.command {
        Command::Conversations => run_conversations(&config).await,
        Command::History { conversation } => run_history(&config, &conversation).await,
        Command::Send { conversation, text } => run_send(&config, &conversation, &text).await,
        Command::CreateConversation { student } => run_create(&config, student).await,
        Command::Chat { conversation } => run_chat(&config, &conversation).await,
    }
}

fn company(config: &ChatConfig) -> Result<String, CliError> {
    config.company_uuid.clone().ok_or(CliError::MissingCompany)
}

async fn run_conversations(config: &ChatConfig) -> Result<(), CliError> {
    let company = company(config)?;
    let api = HttpChatApi::new(config)?;
    for conversation in api.list_conversations(&company).await? {
        println!("{}  {}  {}", conversation.uuid, conversation.display_name(), conversation.created_at);
    }
    Ok(())
}

async fn run_history(config: &ChatConfig, conversation: &str) -> Result<(), CliError> {
    let api = HttpChatApi::new(config)?;
    let messages = api.fetch_messages(conversation).await?;
    let own = config.company_uuid.as_deref().unwrap_or_default();
    for bubble in bubbles(&messages, own) {
        println!("{bubble}");
    }
    Ok(())
}

async fn run_send(config: &ChatConfig, conversation: &str, text: &str) -> Result<(), CliError> {
    company(config)?;
    let session = ChatSession::new(config)?;
    session.start().await;

    let view = session.open(conversation).await;
    let sent = view.send(text).await;
    view.close().await;
    session.shutdown().await;

    let sent = sent.inspect_err(report_send_failure)?;
    println!("{}", serde_json::to_string_pretty(&sent)?);
    Ok(())
}

async fn run_create(config: &ChatConfig, student: String) -> Result<(), CliError> {
    let params = CreateConversationParams { student_uuid: student, company_uuid: company(config)? };
    let api = HttpChatApi::new(config)?;
    let conversation = api.create_conversation(&params).await?;
    println!("{}", serde_json::to_string_pretty(&conversation)?);
    Ok(())
}

async fn run_chat(config: &ChatConfig, conversation: &str) -> Result<(), CliError> {
    company(config)?;
    let session = ChatSession::new(config)?;
    session.start().await;

    let mut changes = session.store().subscribe();
    let mut status = session.hub().subscribe_status();
    let view = session.open(conversation).await;
    view.ready().await;
    if let Some(error) = view.last_error() {
        eprintln!("history unavailable: {error}");
    }
    print_status(&view.status());

    let mut printed = HashSet::new();
    print_new(&view, &mut printed);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/reconnect" => {
                        if let Err(error) = session.hub().reconnect().await {
                            eprintln!("reconnect failed: {error}");
                        }
                    }
                    text => {
                        if let Err(error) = view.send(text).await {
                            report_send_failure(&error);
                        }
                    }
                }
            }
            change = changes.recv() => match change {
                Ok(change) if change.conversation_id != conversation => {}
                Ok(_) | Err(RecvError::Lagged(_)) => print_new(&view, &mut printed),
                Err(RecvError::Closed) => break,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                print_status(&view.status());
            }
        }
    }

    view.close().await;
    session.shutdown().await;
    Ok(())
}

fn report_send_failure(error: &ChatError) {
    if error.retryable() {
        eprintln!("send failed: {error}; try again once the connection recovers");
    } else {
        eprintln!("send failed: {error}");
    }
}

/// Print bubbles not shown yet. A delivery change reprints the bubble.
fn print_new(view: &ConversationView, printed: &mut HashSet<String>) {
    for bubble in view.bubbles() {
        if printed.insert(format!("{}:{:?}", bubble.uuid, bubble.delivery)) {
            println!("{bubble}");
        }
    }
}

fn print_status(status: &StatusView) {
    match &status.alert {
        Some(alert) => eprintln!("-- {} ({alert})", status.label),
        None => eprintln!("-- {}", status.label),
    }
    if status.show_reconnect {
        eprintln!("-- {}; type /reconnect", status.placeholder);
    }
}
