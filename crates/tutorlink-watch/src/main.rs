//! # tutorlink-watch
//!
//! Headless session runner for the Tutorlink messaging core.
//!
//! Opens the local SQLite store, waits for the signed-in identity, then
//! follows the unread counts of the configured counterparties and
//! (optionally) one conversation feed, logging every emission until Ctrl+C.
//! Another process writing to the same database file shows up on the next
//! poll.

mod config;

use std::sync::Arc;

use futures::stream::{BoxStream, SelectAll};
use futures::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tutorlink_core::{
    wait_for_user, CommandCue, FeedSnapshot, LogCue, Messenger, MessagingError, NotificationCue,
    SessionAuth, Unsubscribe, UnreadCounts,
};
use tutorlink_store::SqliteStore;

use crate::config::WatchConfig;

enum Event {
    Unread(Result<UnreadCounts, MessagingError>),
    Feed(Result<FeedSnapshot, MessagingError>),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,tutorlink_core=debug,tutorlink_store=info")
        }))
        .init();

    info!("Starting Tutorlink watch v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration and open the store
    // -----------------------------------------------------------------------
    let config = WatchConfig::from_env();
    info!(?config, "Loaded configuration");

    let store = Arc::new(match &config.db_path {
        Some(path) => SqliteStore::open_at(path)?,
        None => SqliteStore::new()?,
    });
    info!(path = ?store.path(), "Store ready");

    let cue: Arc<dyn NotificationCue> =
        match config.cue_command.as_deref().and_then(CommandCue::parse) {
            Some(cmd) => Arc::new(cmd),
            None => Arc::new(LogCue),
        };

    // -----------------------------------------------------------------------
    // 3. Wait for the signed-in identity
    // -----------------------------------------------------------------------
    let auth = SessionAuth::new();
    if let Some(user) = config.user.clone() {
        auth.sign_in(user);
    } else {
        info!("Not signed in; waiting (set TUTORLINK_USER)");
    }

    let me = tokio::select! {
        user = wait_for_user(&auth) => match user {
            Some(user) => user,
            None => return Ok(()),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C before sign-in, shutting down");
            return Ok(());
        }
    };

    // -----------------------------------------------------------------------
    // 4. Subscribe
    // -----------------------------------------------------------------------
    let messenger = Messenger::new(store.clone());
    let mut events: SelectAll<BoxStream<'static, Event>> = SelectAll::new();
    let mut handles: Vec<Unsubscribe> = Vec::new();

    if !config.counterparties.is_empty() {
        let (tracker, handle) = messenger
            .track_unread(&me, config.counterparties.iter().cloned())
            .await?;
        events.push(tracker.map(Event::Unread).boxed());
        handles.push(handle);
    }

    if let Some(other) = &config.conversation_with {
        match messenger.open_conversation(&me, other).await {
            Ok(key) => {
                let (feed, handle) = messenger.subscribe_feed(&key, &me, cue.clone()).await?;
                events.push(feed.map(Event::Feed).boxed());
                handles.push(handle);
            }
            Err(e) => warn!(error = %e, "Not following conversation"),
        }
    }

    if events.is_empty() {
        info!("Nothing to watch (set TUTORLINK_COUNTERPARTIES or TUTORLINK_CONVERSATION_WITH)");
    }

    // Picks up writes made by other processes.
    let poller = {
        let store = store.clone();
        let period = config.poll_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                store.refresh();
            }
        })
    };

    // -----------------------------------------------------------------------
    // 5. Log emissions until shutdown
    // -----------------------------------------------------------------------
    loop {
        tokio::select! {
            event = events.next(), if !events.is_empty() => match event {
                Some(Event::Unread(Ok(counts))) => {
                    let per: Vec<String> =
                        counts.iter().map(|(who, n)| format!("{who}={n}")).collect();
                    info!(
                        user = %me,
                        total = counts.total(),
                        counts = %per.join(","),
                        "Unread counts"
                    );
                }
                Some(Event::Unread(Err(e))) => warn!(error = %e, "Unread tracking degraded"),
                Some(Event::Feed(Ok(snapshot))) => {
                    if let Some(last) = snapshot.messages.last() {
                        info!(
                            messages = snapshot.messages.len(),
                            notified = snapshot.notified,
                            last_from = %last.sender_id,
                            last_text = %last.text,
                            "Conversation updated"
                        );
                    } else {
                        info!("Conversation is empty");
                    }
                }
                Some(Event::Feed(Err(e))) => {
                    error!(error = %e, "Conversation feed lost; restart to resubscribe")
                }
                None => info!("All subscriptions ended"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    for handle in &handles {
        handle.unsubscribe();
    }
    poller.abort();

    Ok(())
}
