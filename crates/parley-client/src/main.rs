use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::timeout;
use tracing::info;
use uuid::Uuid;

use parley_client::Session;
use parley_store::{LocalStore, ProfileStore};
use parley_sync::conversation::Scope;
use parley_sync::presence::PresenceConfig;
use parley_types::models::{MessageTable, PresenceStatus, Profile};

/// Scripted two-user exchange against the local reference backend: open
/// views, write through one session, watch the other converge.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug".into()),
        )
        .init();

    // Config
    let store = match std::env::var("PARLEY_DB_PATH") {
        Ok(path) => LocalStore::open(&PathBuf::from(path))?,
        Err(_) => LocalStore::in_memory()?,
    };
    let store = Arc::new(store);

    // Seed two users
    let alice_id = seed_user(&store, "alice").await?;
    let bob_id = seed_user(&store, "bob").await?;

    let alice = Session::sign_in(store.clone(), alice_id).await?;
    let bob = Session::sign_in(store.clone(), bob_id).await?;

    let alice_presence = alice.start_presence(PresenceConfig::default()).await;
    let bob_presence = bob.start_presence(PresenceConfig::default()).await;

    // Alice sets up a server; Bob finds it and joins.
    let server = alice.directory().create_server("parley hq", None, false).await?;
    bob.directory().join(server.id).await?;

    let tree = alice.directory().channel_tree(server.id).await?;
    let general = tree
        .root
        .first()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("server has no channels"))?;
    info!(channel = %general.name, "server ready");

    // Both sides watch the channel.
    let alice_conversations = alice.conversations();
    let bob_conversations = bob.conversations();
    let alice_view = alice_conversations.open(Scope::channel(general.id)).await?;
    let mut bob_view = bob_conversations.open(Scope::channel(general.id)).await?;

    let hello = alice
        .messages()
        .send_to_channel(general.id, "hello", None)
        .await?
        .ok_or_else(|| anyhow::anyhow!("empty message rejected"))?;

    // Bob's view converges on the insert without being told about it.
    while bob_view.entries().is_empty() {
        if !timeout(Duration::from_secs(5), bob_view.changed()).await? {
            anyhow::bail!("bob's view closed before converging");
        }
    }
    for entry in bob_view.entries() {
        info!(author = %entry.author_id, content = %entry.content, "bob sees");
    }
    info!(
        in_sync = (alice_view.entries() == bob_view.entries()),
        "views converged"
    );

    // Bob reacts; both sides aggregate the same tally.
    bob.reactions()
        .toggle(hello.id, MessageTable::Messages, "👍")
        .await?;
    for group in alice
        .reactions()
        .summary(hello.id, MessageTable::Messages)
        .await?
    {
        info!(emoji = %group.emoji, count = group.count, "reaction tally");
    }

    // The pair become friends, then a DM from Bob sits unread until Alice
    // opens the conversation.
    let request = alice.friends().request_by_username("bob").await?;
    bob.friends().accept(request.id).await?;
    bob.messages().send_direct(alice_id, "psst", None).await?;

    for convo in alice.friends().dm_conversations().await? {
        info!(peer = %convo.username, unread = convo.unread, "conversation");
    }
    let dm_view = alice_conversations.open(Scope::direct(alice_id, bob_id)).await?;
    info!(entries = dm_view.entries().len(), "dm opened and marked read");

    // The roster partitions by live status.
    let roster = alice.rosters().open(server.id).await?;
    let snapshot = roster.roster();
    info!(
        online = snapshot.online.len(),
        offline = snapshot.offline.len(),
        "roster"
    );

    bob_presence.shutdown().await;
    alice_presence.shutdown().await;
    info!("session closed");

    Ok(())
}

async fn seed_user(store: &LocalStore, username: &str) -> anyhow::Result<Uuid> {
    let id = Uuid::new_v4();
    store
        .upsert_profile(Profile {
            id,
            username: username.into(),
            avatar_url: None,
            status: PresenceStatus::Offline,
            last_seen: None,
            created_at: Utc::now(),
        })
        .await?;
    Ok(id)
}
