use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use chat_core::{load_settings, ChatFacade, Credential, MemoryCredentialStore};
use clap::Parser;
use shared::domain::UserId;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// REST base, e.g. https://market.example/api/
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    access_token: String,
    #[arg(long)]
    refresh_token: String,
    /// Optional TOML settings file; CHAT__* variables override it.
    #[arg(long)]
    settings: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings(args.settings.as_deref())?;
    if let Some(api_url) = args.api_url {
        settings.api_base_url = api_url;
    }
    let facade = ChatFacade::new(&settings, Arc::new(MemoryCredentialStore::new()))
        .context("failed to build chat client")?;

    facade
        .sign_in(
            Credential::new(args.access_token, args.refresh_token),
            UserId::new(args.user_id),
        )
        .await;
    let conversations = facade
        .load_conversations()
        .await
        .context("failed to load conversations")?;
    println!("{} conversations, {} unread", conversations.len(), facade.total_unread_count().await);
    for conversation in &conversations {
        println!(
            "  {} ({} unread, updated {})",
            conversation.id,
            facade.unread_count(&conversation.id).await,
            conversation.updated_at
        );
    }

    let mut frames = facade.subscribe_frames();
    let mut state = facade.watch_connection();
    facade.connect().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = state.borrow_and_update().clone();
                match &snapshot.last_error {
                    Some(issue) => println!(
                        "connection: {:?} (attempt {}, {issue})",
                        snapshot.state, snapshot.reconnect_attempt
                    ),
                    None => println!("connection: {:?}", snapshot.state),
                }
            }
            frame = frames.recv() => match frame {
                Ok(frame) => println!("{} {}", frame.kind(), serde_json::to_string(&frame)?),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event output fell behind"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    info!("shutting down");
    facade.disconnect().await;
    Ok(())
}
