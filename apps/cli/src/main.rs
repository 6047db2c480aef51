use std::{collections::HashSet, sync::Arc};

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use client_core::{
    conversation_list::ConversationList,
    load_client_settings,
    realtime::ChannelOptions,
    session::AuthMode,
    ChatBackend, ClientSettings, HttpBackend, NoticeLevel, Session, SessionContext, SessionStore,
    SyncEngine, SyncEvent, SyncHandle, WebSocketChannelFactory,
};
use shared::{
    domain::{ConversationId, DeliveryStatus, MessageId, UserId},
    protocol::CreateGroupRequest,
};
use storage::Storage;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod render;

#[derive(Parser, Debug)]
#[command(name = "chat-cli", about = "Terminal client for the chat backend")]
struct Cli {
    /// REST root including `/api`.
    #[arg(long, global = true)]
    api_url: Option<String>,
    #[arg(long, global = true)]
    realtime_url: Option<String>,
    #[arg(long, global = true)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Joins an invite link as a guest.
    JoinInvite { token: String, name: String },
    VerifyInvite { token: String },
    Logout,
    Whoami,
    Conversations,
    /// Prints the history, then tails the conversation and sends each stdin line.
    Open { conversation_id: String },
    Send {
        conversation_id: String,
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    /// Generates an invite link for a guest.
    Invite,
    Groups,
    CreateGroup {
        name: String,
        #[arg(long)]
        description: Option<String>,
        /// User id to add; repeat for several members.
        #[arg(long = "member")]
        members: Vec<String>,
    },
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Subcommand, Debug)]
enum SessionAction {
    Show,
    Clear,
}

struct App {
    settings: ClientSettings,
    backend: HttpBackend,
    context: SessionContext,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let settings = apply_overrides(load_client_settings(), &cli);
    let storage = open_storage(&settings.database_url).await?;
    let factory = Arc::new(WebSocketChannelFactory::new(
        settings.realtime_url.clone(),
        ChannelOptions::from_settings(&settings),
    ));
    let mut app = App {
        backend: HttpBackend::new(settings.api_base_url.clone()),
        context: SessionContext::new(SessionStore::new(storage), factory),
        settings,
    };
    info!(api = %app.settings.api_base_url, realtime = %app.settings.realtime_url, "client configured");

    match cli.command {
        Command::Login { email, password } => {
            let auth = app.backend.login(&email, &password).await?;
            let session = Session::registered(auth.user, auth.token);
            println!("logged in as {} ({})", session.user.name, session.user.id);
            app.context.establish(session).await?;
        }
        Command::Register {
            name,
            email,
            password,
        } => {
            let auth = app.backend.register(&name, &email, &password).await?;
            let session = Session::registered(auth.user, auth.token);
            println!("registered {} ({})", session.user.name, session.user.id);
            app.context.establish(session).await?;
        }
        Command::JoinInvite { token, name } => {
            let joined = app.backend.join_invite(&token, &name).await?;
            let conversation_id = joined.conversation.id.clone();
            let session = Session::guest(joined.guest_user, joined.guest_token);
            println!(
                "joined as guest {} in conversation {conversation_id}",
                session.user.name
            );
            app.context.establish(session).await?;
        }
        Command::VerifyInvite { token } => {
            let invite = app.backend.verify_invite(&token).await?;
            let validity = if invite.is_valid { "valid" } else { "not valid" };
            println!("invite from {} is {validity}", invite.host_user.name);
            if let Some(expires_at) = invite.expires_at {
                println!("expires {}", render::local_time(expires_at));
            }
        }
        Command::Logout => {
            if let Some(session) = app.context.bootstrap().await?.cloned() {
                if let Err(error) = app.backend.logout(&session).await {
                    warn!(%error, "backend logout failed, clearing local session anyway");
                }
            }
            app.context.logout().await?;
            println!("logged out");
        }
        Command::Whoami => match app.context.bootstrap().await? {
            Some(session) => {
                let mode = match session.mode() {
                    AuthMode::Registered => "registered",
                    AuthMode::Guest => "guest",
                };
                println!("{} ({}) [{mode}]", session.user.name, session.user.id);
            }
            None => println!("not logged in"),
        },
        Command::Conversations => {
            let session = require_session(&mut app).await?;
            let mut list = ConversationList::new();
            list.load_all(app.backend.list_conversations(&session).await?);
            for conversation in list.sorted_by_activity() {
                println!("{}", render::conversation_line(conversation, &session.user.id));
            }
            println!("{} unread in total", list.total_unread());
        }
        Command::Open { conversation_id } => {
            let session = require_session(&mut app).await?;
            let handle = spawn_engine(&app, session)?;
            open_conversation(&handle, ConversationId::new(conversation_id)).await?;
            handle.shutdown();
        }
        Command::Send {
            conversation_id,
            text,
        } => {
            let session = require_session(&mut app).await?;
            let handle = spawn_engine(&app, session)?;
            send_once(&handle, ConversationId::new(conversation_id), text.join(" ")).await?;
            handle.shutdown();
        }
        Command::Invite => {
            let session = require_session(&mut app).await?;
            let invite = app.backend.generate_invite(&session).await?;
            println!("invite token: {}", invite.token);
            if let Some(expires_at) = invite.expires_at {
                println!("expires {}", render::local_time(expires_at));
            }
        }
        Command::Groups => {
            let session = require_session(&mut app).await?;
            for group in app.backend.list_groups(&session).await? {
                println!("{}", render::conversation_line(&group, &session.user.id));
            }
        }
        Command::CreateGroup {
            name,
            description,
            members,
        } => {
            let session = require_session(&mut app).await?;
            let request = CreateGroupRequest {
                name,
                description,
                participants: members.into_iter().map(UserId::new).collect(),
                settings: None,
            };
            let group = app.backend.create_group(&session, &request).await?;
            println!("created group {}", render::conversation_line(&group, &session.user.id));
        }
        Command::Session { action } => match action {
            SessionAction::Show => {
                let values = app.context.store().storage().list_values().await?;
                if values.is_empty() {
                    println!("no stored session");
                }
                for stored in values {
                    let shown = if stored.key.ends_with("Token") {
                        render::redact(&stored.value)
                    } else {
                        stored.value
                    };
                    println!(
                        "{} = {shown} (updated {})",
                        stored.key,
                        render::local_time(stored.updated_at)
                    );
                }
            }
            SessionAction::Clear => {
                app.context.store().clear_all().await?;
                println!("stored session cleared");
            }
        },
    }

    Ok(())
}

async fn open_storage(database_url: &str) -> Result<Storage> {
    let storage = Storage::new(database_url)
        .await
        .with_context(|| format!("failed to open client storage at {database_url}"))?;
    storage
        .health_check()
        .await
        .with_context(|| format!("client storage at {database_url} is not usable"))?;
    info!(database_url, "client storage ready");
    Ok(storage)
}

fn apply_overrides(mut settings: ClientSettings, cli: &Cli) -> ClientSettings {
    if let Some(api_url) = &cli.api_url {
        settings = settings.with_api_base_url(api_url.clone(), cli.realtime_url.clone());
    } else if let Some(realtime_url) = &cli.realtime_url {
        settings.realtime_url = realtime_url.clone();
    }
    if let Some(database_url) = &cli.database_url {
        settings.database_url = database_url.clone();
    }
    settings
}

async fn require_session(app: &mut App) -> Result<Session> {
    match app.context.bootstrap().await? {
        Some(session) => Ok(session.clone()),
        None => bail!("not logged in; run `chat-cli login` or `chat-cli join-invite` first"),
    }
}

fn spawn_engine(app: &App, session: Session) -> Result<SyncHandle> {
    let channel = app
        .context
        .channel()
        .context("realtime channel was not opened for the session")?;
    Ok(SyncEngine::spawn(
        Arc::new(app.backend.clone()),
        session,
        channel,
        &app.settings,
    ))
}

async fn open_conversation(handle: &SyncHandle, conversation_id: ConversationId) -> Result<()> {
    let mut events = handle.subscribe();
    handle.select(conversation_id.clone())?;
    let mut printed: HashSet<MessageId> = HashSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut history_shown = false;

    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "display fell behind");
                        continue;
                    }
                    Err(_) => break,
                };
                match event {
                    SyncEvent::HistoryLoaded { conversation_id: loaded, .. } if loaded == conversation_id => {
                        let snapshot = handle.snapshot().await?;
                        if !history_shown {
                            for line in render::history_lines(&snapshot.messages, &Local) {
                                println!("{line}");
                            }
                            printed.extend(snapshot.messages.iter().map(|message| message.id.clone()));
                            history_shown = true;
                        } else {
                            print_new_messages(&snapshot.messages, &mut printed);
                        }
                    }
                    SyncEvent::MessagesChanged { conversation_id: changed } if changed == conversation_id && history_shown => {
                        let snapshot = handle.snapshot().await?;
                        print_new_messages(&snapshot.messages, &mut printed);
                    }
                    SyncEvent::TypingChanged { conversation_id: typing_in, user_id, is_typing } if typing_in == conversation_id => {
                        if is_typing {
                            println!("* {user_id} is typing");
                        }
                    }
                    SyncEvent::SendFailed { temp_id, error } => {
                        println!("! send failed ({error}); type /retry {temp_id}");
                    }
                    SyncEvent::IncomingCall { initiator, .. } => {
                        println!("* incoming call from {}; /accept or /decline", initiator.name);
                    }
                    SyncEvent::CallEnded { .. } => println!("* call ended"),
                    SyncEvent::ChannelState(state) => info!(?state, "realtime channel"),
                    SyncEvent::Notice { level, message } => match level {
                        NoticeLevel::Info => println!("* {message}"),
                        NoticeLevel::Warning | NoticeLevel::Error => println!("! {message}"),
                    },
                    _ => {}
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let trimmed = line.trim();
                match trimmed {
                    "/quit" => break,
                    "/read" => handle.mark_read()?,
                    "/accept" => handle.accept_call()?,
                    "/decline" => handle.decline_call()?,
                    "/hangup" => handle.end_call()?,
                    "" => handle.keystroke("")?,
                    _ if trimmed.starts_with("/retry ") => {
                        let temp_id = MessageId::new(trimmed.trim_start_matches("/retry ").trim());
                        if let Err(error) = handle.retry(temp_id).await {
                            println!("! {error}");
                        }
                    }
                    _ => {
                        handle.keystroke(line.clone())?;
                        if let Err(error) = handle.send(line.clone()).await {
                            println!("! {error}");
                        }
                    }
                }
            }
        }
    }

    handle.close()?;
    Ok(())
}

fn print_new_messages(messages: &[shared::domain::Message], printed: &mut HashSet<MessageId>) {
    for message in messages {
        if message.status == DeliveryStatus::Pending || printed.contains(&message.id) {
            continue;
        }
        println!("{}", render::message_line(message, &Local));
        printed.insert(message.id.clone());
    }
}

async fn send_once(handle: &SyncHandle, conversation_id: ConversationId, text: String) -> Result<()> {
    let mut events = handle.subscribe();
    handle.select(conversation_id.clone())?;
    loop {
        match events.recv().await? {
            SyncEvent::HistoryLoaded { conversation_id: loaded, .. } if loaded == conversation_id => break,
            SyncEvent::Notice {
                level: NoticeLevel::Error,
                message,
            } => bail!(message),
            _ => {}
        }
    }

    let temp_id = handle.send(text).await?;
    loop {
        match events.recv().await? {
            SyncEvent::SendFailed { temp_id: failed, error } if failed == temp_id => {
                bail!("send failed: {error}")
            }
            SyncEvent::MessagesChanged { .. } => {
                let snapshot = handle.snapshot().await?;
                let confirmed = snapshot
                    .messages
                    .iter()
                    .all(|message| message.id != temp_id);
                if confirmed {
                    println!("sent");
                    return Ok(());
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_storage_checks_the_database_it_opens() {
        let storage = open_storage("sqlite::memory:").await.expect("storage");
        storage.health_check().await.expect("still healthy");
    }
}
