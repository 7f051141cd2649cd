use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    AttachmentUpload, ChatSession, Contact, HttpChatApi, Message, OutgoingMessage, SessionEvent,
    WebSocketTransport,
};
use shared::domain::UserId;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod session_file;

use config::load_settings;

#[derive(Parser, Debug)]
#[command(name = "chat_cli", about = "Command-line client for the chat service")]
struct Args {
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    session_file: Option<PathBuf>,
    /// Acts as this user instead of the one in the session file.
    #[arg(long)]
    user_id: Option<String>,
    #[arg(long)]
    token: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lists contacts with their unread markers.
    Contacts,
    /// Lists directory users, optionally filtered.
    Directory {
        #[arg(long)]
        search: Option<String>,
    },
    /// Prints the conversation with a partner.
    History { partner: String },
    Send {
        partner: String,
        #[arg(long)]
        text: Option<String>,
        #[arg(long = "attach")]
        attachments: Vec<PathBuf>,
    },
    /// Streams session events until interrupted.
    Watch {
        #[arg(long)]
        partner: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(session_file) = args.session_file {
        settings.session_file = session_file;
    }
    if let Some(token) = args.token {
        settings.bearer_token = Some(token);
    }

    let identity = match args.user_id {
        Some(user_id) => Some(UserId::new(user_id)),
        None => session_file::read_identity(&settings.session_file).await?,
    };
    let Some(identity) = identity else {
        bail!(
            "no signed-in user: pass --user-id or create {}",
            settings.session_file.display()
        );
    };

    let mut api = HttpChatApi::new(&settings.server_url)?;
    if let Some(token) = settings.bearer_token.clone() {
        api = api.with_bearer_token(token);
    }
    let transport = WebSocketTransport::new(settings.channel_base())?;
    info!(server = %settings.server_url, identity = %identity, "cli: starting session");

    let session = ChatSession::new(Arc::new(api), Arc::new(transport));
    let events = session.subscribe_events();
    session.set_identity(Some(identity)).await;

    match args.command {
        Command::Contacts => {
            let snapshot = session.snapshot().await;
            if let Some(error) = snapshot.errors.contacts {
                bail!("{error}");
            }
            for contact in &snapshot.contacts {
                print_contact(contact);
            }
        }
        Command::Directory { search } => {
            if let Some(error) = session.snapshot().await.errors.directory {
                bail!("{error}");
            }
            for user in session
                .search_directory(search.as_deref().unwrap_or_default())
                .await
            {
                print_contact(&user);
            }
        }
        Command::History { partner } => {
            session.select_conversation(&UserId::new(partner)).await?;
            let snapshot = session.snapshot().await;
            if let Some(error) = snapshot.errors.history {
                bail!("{error}");
            }
            for message in &snapshot.messages {
                print_message(message);
            }
        }
        Command::Send {
            partner,
            text,
            attachments,
        } => {
            let mut content = OutgoingMessage {
                text,
                attachments: Vec::new(),
            };
            for path in attachments {
                content = content.with_attachment(read_attachment(&path).await?);
            }
            session.select_conversation(&UserId::new(partner)).await?;
            match session.send(content).await? {
                Some(message) => print_message(&message),
                None => println!("nothing to send"),
            }
        }
        Command::Watch { partner } => {
            if let Some(partner) = partner {
                session.select_conversation(&UserId::new(partner)).await?;
            }
            watch(events).await;
        }
    }

    session.logout().await;
    Ok(())
}

async fn read_attachment(path: &Path) -> Result<AttachmentUpload> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read attachment {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("attachment path has no file name: {}", path.display()))?;
    Ok(AttachmentUpload {
        filename,
        mime_type: None,
        bytes,
    })
}

async fn watch(mut events: tokio::sync::broadcast::Receiver<SessionEvent>) {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => println!("... {skipped} events skipped"),
                Err(RecvError::Closed) => break,
            },
        }
    }
}

fn print_contact(contact: &Contact) {
    let marker = if contact.has_unread { "*" } else { " " };
    let handle = contact.handle.as_deref().unwrap_or("-");
    println!(
        "{marker} {}\t{}\t@{handle}\t{:?}",
        contact.identity, contact.display_name, contact.role
    );
}

fn print_message(message: &Message) {
    let text = message.text.as_deref().unwrap_or("");
    println!(
        "[{}] {}: {text}",
        message.created_at.format("%Y-%m-%d %H:%M"),
        message.sender
    );
    for attachment in &message.attachments {
        println!(
            "    attachment: {} {}",
            attachment.name.as_deref().unwrap_or("(unnamed)"),
            attachment.url.as_deref().unwrap_or("")
        );
    }
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::MessageAppended { message } => print_message(message),
        SessionEvent::UnreadChanged {
            identity,
            has_unread: true,
        } => println!("new message from {identity}"),
        SessionEvent::ConnectivityChanged(connectivity) => {
            println!("connectivity: {connectivity:?}")
        }
        SessionEvent::Error(error) => eprintln!("error: {error}"),
        other => tracing::debug!(event = ?other, "cli: session event"),
    }
}
