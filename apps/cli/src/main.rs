use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    load_settings, AccessToken, BackendApi, ChatSession, ClientEvent, FileSessionStore,
    HttpBackend, SessionSnapshot, SessionStore,
};
use shared::domain::{MessageId, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "chat.toml")]
    config: PathBuf,
    /// Where session snapshots are kept. Defaults to the per-user data dir.
    #[arg(long)]
    session_dir: Option<PathBuf>,
    #[arg(long, default_value = "default")]
    scope: String,
    /// Stores a fresh credential for this scope before starting.
    #[arg(long, requires = "user_id")]
    token: Option<String>,
    #[arg(long, requires = "token")]
    user_id: Option<String>,
    /// Counterpart to open once the inbox is loaded.
    #[arg(long)]
    chat: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let settings = load_settings(&args.config)?;
    let session_dir = match args.session_dir {
        Some(dir) => dir,
        None => dirs::data_local_dir()
            .context("unable to resolve local app data dir")?
            .join("chat_sync")
            .join("sessions"),
    };
    let store: Arc<dyn SessionStore> = Arc::new(FileSessionStore::new(&session_dir, &args.scope)?);

    if let (Some(token), Some(user_id)) = (args.token, args.user_id) {
        let token = AccessToken::new(token);
        let backend = HttpBackend::new(&settings.api_base_url, token.clone())?;
        let user = backend
            .fetch_user(&UserId::new(user_id))
            .await
            .context("failed to fetch the local user's profile")?;
        store.save(&SessionSnapshot {
            access_token: token,
            user,
        })?;
    }

    let session = ChatSession::restore(settings, Arc::clone(&store))
        .context("no stored session; pass --token and --user-id")?;
    info!(user = %session.local_user().id, "cli: session restored");

    let printer = tokio::spawn(print_events(Arc::clone(&session)));
    session.start().await?;
    if let Some(peer) = args.chat {
        if let Err(err) = session.open_conversation(UserId::new(peer)).await {
            warn!(error = %err, "cli: failed to open conversation");
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if !handle_line(&session, line.trim()).await {
                    break;
                }
            }
        }
    }

    printer.abort();
    Ok(())
}

/// Returns false once the user asked to leave.
async fn handle_line(session: &Arc<ChatSession>, line: &str) -> bool {
    let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
    let result = match command {
        "" => Ok(()),
        "/quit" => return false,
        "/logout" => {
            session.logout().await;
            return false;
        }
        "/open" => session.open_conversation(UserId::new(arg.trim())).await,
        "/close" => {
            session.close_conversation().await;
            Ok(())
        }
        "/older" => session.load_older().await.map(|issued| {
            if !issued {
                println!("(no older history)");
            }
        }),
        "/retry" => session.retry_failed(&MessageId::new(arg.trim())).await,
        "/friend" => session.add_friend(UserId::new(arg.trim())).await,
        "/unfriend" => session.remove_friend(UserId::new(arg.trim())).await,
        _ => session.send_message(line).await.map(|temp_id| {
            println!("(sending {temp_id})");
        }),
    };
    if let Err(err) = result {
        println!("! {err}");
    }
    true
}

async fn print_events(session: Arc<ChatSession>) {
    let mut events = session.subscribe_events();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "cli: event printer lagged");
                continue;
            }
            Err(_) => return,
        };
        match event {
            ClientEvent::InboxUpdated(rows) => {
                println!("-- inbox ({} conversations)", rows.len());
                for row in rows.iter().take(10) {
                    println!(
                        "  {}{} {}: {}",
                        if row.unread_for_me { "*" } else { " " },
                        if row.online { "+" } else { " " },
                        row.summary.participant.name,
                        row.summary.last_message.body
                    );
                }
            }
            ClientEvent::PresenceChanged(online) => {
                let names: Vec<_> = online.iter().map(|entry| entry.name.as_str()).collect();
                println!("-- online: {}", names.join(", "));
            }
            ClientEvent::ScrollToLatest { conversation } => {
                if let Some(last) = session.messages(&conversation).await.last() {
                    println!("[{}] {}: {}", conversation, last.sender_id, last.body);
                }
            }
            ClientEvent::HistoryExhausted { conversation } => {
                println!("-- start of conversation with {conversation}");
            }
            ClientEvent::CounterpartResolved(view) => {
                let status = if view.online { "active now" } else { "offline" };
                println!("-- chatting with {} ({status})", view.profile.name);
            }
            ClientEvent::TypingChanged { conversation, typing } => {
                if typing {
                    println!("-- {conversation} is typing...");
                }
            }
            ClientEvent::SendFailed { temp_id, reason } => {
                println!("! {temp_id} not delivered: {reason} (use /retry {temp_id})");
            }
            ClientEvent::Error(reason) => println!("! {reason}"),
            ClientEvent::LoggedOut => {
                println!("-- logged out");
                return;
            }
            ClientEvent::MessagesUpdated { .. }
            | ClientEvent::MessageDelivered { .. }
            | ClientEvent::SubscriptionStateChanged(_) => {}
        }
    }
}
