use anyhow::{bail, Result};
use chat_sync::{load_config, ChatSession, SyncError, SyncEvent};
use clap::Parser;
use shared::domain::{Conversation, Message, UserId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::warn;

/// Terminal client for one direct or circle conversation.
#[derive(Parser, Debug)]
struct Args {
    /// REST base URL, e.g. http://localhost:5000/api. Overrides the config file.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    conversation: String,
    /// Partner user id for a direct conversation.
    #[arg(long, conflicts_with = "circle")]
    partner: Option<String>,
    #[arg(long)]
    circle: bool,
}

impl Args {
    fn conversation(&self) -> Result<Conversation> {
        match (&self.partner, self.circle) {
            (Some(partner), false) => Ok(Conversation::direct(
                self.conversation.as_str(),
                partner.as_str(),
            )),
            (None, true) => Ok(Conversation::circle(self.conversation.as_str())),
            _ => bail!("pass either --partner <user> or --circle"),
        }
    }
}

fn print_message(message: &Message) {
    let marker = if message.is_pending() { " (sending)" } else { "" };
    println!("[{}] {}: {}{marker}", message.id, message.sender_id, message.text);
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::MessageAppended { message, .. } if !message.is_pending() => {
            print_message(message)
        }
        SyncEvent::MessageConfirmed { temp_id, message, .. } => {
            println!("  {temp_id} delivered as {}", message.id)
        }
        SyncEvent::MessageFailed { draft, .. } => println!("  not sent, draft kept: {draft}"),
        SyncEvent::ReadReceipt { user_id, .. } => println!("  read by {user_id}"),
        SyncEvent::ConversationCleared { .. } => println!("  conversation cleared"),
        SyncEvent::BlockUpdated { blocked_by, .. } => {
            println!("  block state changed ({} blocking)", blocked_by.len())
        }
        SyncEvent::Signal { from, call_type, .. } => {
            println!("  incoming {call_type:?} call signal from {from}")
        }
        SyncEvent::ConnectionStateChanged(state) => println!("  connection: {state:?}"),
        SyncEvent::ChannelError(err) => println!("  {}", err.code.describe()),
        SyncEvent::Error(err) => println!("  error: {err}"),
        _ => {}
    }
}

async fn run_command(session: &ChatSession, conversation: &Conversation, line: &str) -> Result<bool> {
    match line {
        "/quit" => return Ok(false),
        "/older" => {
            let added = session.load_older(conversation).await?;
            println!("  loaded {added} older messages");
            for message in session.messages(&conversation.id).await.iter().take(added) {
                print_message(message);
            }
        }
        "/clear" => session.clear_history(conversation).await?,
        "/block" => session.set_blocked(conversation, true).await?,
        "/unblock" => session.set_blocked(conversation, false).await?,
        text => match session.send_message(conversation, text).await {
            Ok(_) | Err(SyncError::EmptyMessage) => {}
            Err(err) => {
                println!("  {err}");
                if let Some(draft) = err.draft() {
                    println!("  draft: {draft}");
                }
            }
        },
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();
    let conversation = args.conversation()?;

    let mut config = load_config()?;
    if let Some(url) = &args.server_url {
        config.base_url = url.trim_end_matches('/').to_string();
    }
    if args.token.is_some() {
        config.auth_token = args.token.clone();
    }

    let session = ChatSession::new(config);
    let mut events = session.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "display fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    session.sign_in(UserId::new(args.user_id.as_str())).await?;
    for message in session.open_conversation(conversation.clone()).await? {
        print_message(&message);
    }
    println!("type a message, or /older /clear /block /unblock /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match run_command(&session, &conversation, line.trim()).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => warn!(error = %err, "command failed"),
        }
    }

    session.close_conversation(&conversation.id).await?;
    session.sign_out().await;
    Ok(())
}

