//! End-to-end synchronizer behavior against the reference backend: open a
//! view, mutate the store, and watch the view converge.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::timeout;
use uuid::Uuid;

use parley_store::feed::{Feed, FeedSubscription, Interest};
use parley_store::{
    ConversationStore, DirectoryStore, LocalStore, MessageOps, PresenceStore, ProfileStore,
    RosterStore, SocialStore,
};
use parley_sync::conversation::{ConversationHandle, ConversationSync, Scope};
use parley_sync::roster::RosterSync;
use parley_types::models::{
    Channel, DirectMessage, Membership, Message, PresenceStatus, Profile, Server,
};
use parley_types::{StoreError, StoreResult};

async fn seed_profile(store: &LocalStore, username: &str) -> Uuid {
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
        .await
        .unwrap();
    id
}

async fn seed_channel(store: &LocalStore, owner: Uuid, name: &str) -> Uuid {
    let server_id = Uuid::new_v4();
    store
        .insert_server(Server {
            id: server_id,
            name: format!("{name}-server"),
            description: None,
            icon: None,
            is_private: false,
            owner_id: owner,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    let channel_id = Uuid::new_v4();
    store
        .insert_channel(Channel {
            id: channel_id,
            server_id,
            category_id: None,
            name: name.into(),
            kind: Default::default(),
            position: 0,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    channel_id
}

fn channel_message(channel_id: Uuid, author_id: Uuid, content: &str) -> Message {
    Message {
        id: Uuid::new_v4(),
        channel_id,
        author_id,
        content: content.into(),
        media_url: None,
        created_at: Utc::now(),
        edited_at: None,
    }
}

fn dm(sender: Uuid, receiver: Uuid, content: &str) -> DirectMessage {
    DirectMessage {
        id: Uuid::new_v4(),
        sender_id: sender,
        receiver_id: receiver,
        content: content.into(),
        media_url: None,
        read: false,
        created_at: Utc::now(),
        edited_at: None,
    }
}

/// Poll the view until it holds `n` entries or give up.
async fn wait_for_len(handle: &mut ConversationHandle, n: usize) {
    for _ in 0..100 {
        if handle.entries().len() == n {
            return;
        }
        let _ = timeout(Duration::from_millis(50), handle.changed()).await;
    }
    panic!("view never reached {n} entries, has {}", handle.entries().len());
}

#[tokio::test]
async fn empty_channel_receives_first_message() {
    let store = Arc::new(LocalStore::in_memory().unwrap());
    let alice = seed_profile(&store, "alice").await;
    let channel = seed_channel(&store, alice, "general").await;

    let sync = ConversationSync::new(store.clone(), alice);
    let mut handle = sync.open(Scope::channel(channel)).await.unwrap();
    assert!(handle.entries().is_empty());

    store
        .insert_message(channel_message(channel, alice, "hello"))
        .await
        .unwrap();

    wait_for_len(&mut handle, 1).await;
    let entries = handle.entries();
    assert_eq!(entries[0].content, "hello");
    assert_eq!(entries[0].author_id, alice);
}

#[tokio::test]
async fn two_views_on_one_scope_converge() {
    let store = Arc::new(LocalStore::in_memory().unwrap());
    let alice = seed_profile(&store, "alice").await;
    let bob = seed_profile(&store, "bob").await;
    let channel = seed_channel(&store, alice, "general").await;

    store
        .insert_message(channel_message(channel, alice, "first"))
        .await
        .unwrap();

    // Alice's view is open while the conversation grows; Bob's opens late.
    let alice_sync = ConversationSync::new(store.clone(), alice);
    let mut alice_view = alice_sync.open(Scope::channel(channel)).await.unwrap();

    for content in ["second", "third"] {
        store
            .insert_message(channel_message(channel, bob, content))
            .await
            .unwrap();
    }
    wait_for_len(&mut alice_view, 3).await;

    let bob_sync = ConversationSync::new(store.clone(), bob);
    let bob_view = bob_sync.open(Scope::channel(channel)).await.unwrap();

    // Same ids, same order, regardless of how each view got there.
    assert_eq!(alice_view.entries(), bob_view.entries());
}

#[tokio::test]
async fn dm_views_converge_from_both_sides() {
    let store = Arc::new(LocalStore::in_memory().unwrap());
    let alice = seed_profile(&store, "alice").await;
    let bob = seed_profile(&store, "bob").await;

    store.insert_direct_message(dm(alice, bob, "hi bob")).await.unwrap();
    store.insert_direct_message(dm(bob, alice, "hi alice")).await.unwrap();

    let alice_view = ConversationSync::new(store.clone(), alice)
        .open(Scope::direct(alice, bob))
        .await
        .unwrap();
    let bob_view = ConversationSync::new(store.clone(), bob)
        .open(Scope::direct(bob, alice))
        .await
        .unwrap();

    assert_eq!(alice_view.entries().len(), 2);
    assert_eq!(alice_view.entries(), bob_view.entries());
}

#[tokio::test]
async fn opening_a_dm_marks_it_read_and_incoming_stays_read() {
    let store = Arc::new(LocalStore::in_memory().unwrap());
    let alice = seed_profile(&store, "alice").await;
    let bob = seed_profile(&store, "bob").await;

    store.insert_direct_message(dm(bob, alice, "one")).await.unwrap();
    store.insert_direct_message(dm(bob, alice, "two")).await.unwrap();
    assert_eq!(store.unread_count(alice, bob).await.unwrap(), 2);

    let sync = ConversationSync::new(store.clone(), alice);
    let mut handle = sync.open(Scope::direct(alice, bob)).await.unwrap();
    assert_eq!(store.unread_count(alice, bob).await.unwrap(), 0);

    // A message arriving while the conversation is open is read on arrival.
    store.insert_direct_message(dm(bob, alice, "three")).await.unwrap();
    wait_for_len(&mut handle, 3).await;

    let mut unread = u64::MAX;
    for _ in 0..100 {
        unread = store.unread_count(alice, bob).await.unwrap();
        if unread == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(unread, 0);
}

#[tokio::test]
async fn close_is_idempotent_and_stops_updates() {
    let store = Arc::new(LocalStore::in_memory().unwrap());
    let alice = seed_profile(&store, "alice").await;
    let channel = seed_channel(&store, alice, "general").await;

    let sync = ConversationSync::new(store.clone(), alice);
    let mut handle = sync.open(Scope::channel(channel)).await.unwrap();

    handle.close();
    handle.close();
    assert!(!handle.is_current());

    store
        .insert_message(channel_message(channel, alice, "after close"))
        .await
        .unwrap();

    // The closed view never sees the insert.
    assert!(!handle.changed().await);
    assert!(handle.entries().is_empty());
}

/// Delays fetches for one channel so a stale response can be provoked.
struct SlowChannelStore {
    inner: Arc<LocalStore>,
    slow_channel: Uuid,
    delay: Duration,
}

#[async_trait]
impl ConversationStore for SlowChannelStore {
    async fn channel_messages(&self, channel_id: Uuid) -> StoreResult<Vec<Message>> {
        if channel_id == self.slow_channel {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.channel_messages(channel_id).await
    }

    async fn direct_messages(&self, a: Uuid, b: Uuid) -> StoreResult<Vec<DirectMessage>> {
        self.inner.direct_messages(a, b).await
    }

    async fn mark_direct_read(&self, receiver: Uuid, sender: Uuid) -> StoreResult<u64> {
        self.inner.mark_direct_read(receiver, sender).await
    }

    async fn unread_count(&self, receiver: Uuid, sender: Uuid) -> StoreResult<u64> {
        self.inner.unread_count(receiver, sender).await
    }
}

impl Feed for SlowChannelStore {
    fn subscribe(&self, interest: Interest) -> FeedSubscription {
        self.inner.subscribe(interest)
    }
}

#[tokio::test(start_paused = true)]
async fn stale_scope_fetch_does_not_affect_current_view() {
    let inner = Arc::new(LocalStore::in_memory().unwrap());
    let alice = seed_profile(&inner, "alice").await;
    let slow_channel = seed_channel(&inner, alice, "slow").await;
    let fast_channel = seed_channel(&inner, alice, "fast").await;

    inner
        .insert_message(channel_message(slow_channel, alice, "stale payload"))
        .await
        .unwrap();
    inner
        .insert_message(channel_message(fast_channel, alice, "current payload"))
        .await
        .unwrap();

    let store = Arc::new(SlowChannelStore {
        inner: inner.clone(),
        slow_channel,
        delay: Duration::from_secs(5),
    });
    let sync = Arc::new(ConversationSync::new(store, alice));

    // Open the slow scope; its fetch parks on the delay.
    let slow_open = {
        let sync = sync.clone();
        tokio::spawn(async move { sync.open(Scope::channel(slow_channel)).await })
    };
    // Let the slow open claim its generation before switching scopes.
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    // The user has moved on.
    let current = sync.open(Scope::channel(fast_channel)).await.unwrap();
    let before = current.entries();
    assert_eq!(before.len(), 1);
    assert_eq!(before[0].content, "current payload");

    // The slow fetch now resolves — into a superseded view.
    let stale = slow_open.await.unwrap().unwrap();
    assert!(!stale.is_current());
    assert!(current.is_current());
    assert_eq!(current.entries(), before);
}

/// Fails channel fetches on demand to exercise fail-stale.
struct FlakyStore {
    inner: Arc<LocalStore>,
    failing: AtomicBool,
}

#[async_trait]
impl ConversationStore for FlakyStore {
    async fn channel_messages(&self, channel_id: Uuid) -> StoreResult<Vec<Message>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Transient(anyhow::anyhow!("store unreachable")));
        }
        self.inner.channel_messages(channel_id).await
    }

    async fn direct_messages(&self, a: Uuid, b: Uuid) -> StoreResult<Vec<DirectMessage>> {
        self.inner.direct_messages(a, b).await
    }

    async fn mark_direct_read(&self, receiver: Uuid, sender: Uuid) -> StoreResult<u64> {
        self.inner.mark_direct_read(receiver, sender).await
    }

    async fn unread_count(&self, receiver: Uuid, sender: Uuid) -> StoreResult<u64> {
        self.inner.unread_count(receiver, sender).await
    }
}

impl Feed for FlakyStore {
    fn subscribe(&self, interest: Interest) -> FeedSubscription {
        self.inner.subscribe(interest)
    }
}

#[tokio::test]
async fn failed_refetch_keeps_previous_snapshot() {
    let inner = Arc::new(LocalStore::in_memory().unwrap());
    let alice = seed_profile(&inner, "alice").await;
    let channel = seed_channel(&inner, alice, "general").await;

    inner
        .insert_message(channel_message(channel, alice, "before outage"))
        .await
        .unwrap();

    let store = Arc::new(FlakyStore { inner: inner.clone(), failing: AtomicBool::new(false) });
    let sync = ConversationSync::new(store.clone(), alice);
    let mut handle = sync.open(Scope::channel(channel)).await.unwrap();
    assert_eq!(handle.entries().len(), 1);

    // The store goes dark; an event arrives; the refetch fails.
    store.failing.store(true, Ordering::SeqCst);
    inner
        .insert_message(channel_message(channel, alice, "during outage"))
        .await
        .unwrap();

    let mut error = None;
    for _ in 0..100 {
        error = handle.try_next_error();
        if error.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(matches!(error, Some(StoreError::Transient(_))));
    // Fail-stale: the view still shows the last good snapshot.
    assert_eq!(handle.entries().len(), 1);
    assert_eq!(handle.entries()[0].content, "before outage");

    // Once the store recovers, the next event catches the view up.
    store.failing.store(false, Ordering::SeqCst);
    inner
        .insert_message(channel_message(channel, alice, "after outage"))
        .await
        .unwrap();
    wait_for_len(&mut handle, 3).await;
}

/// Counts roster fetches so gating can be asserted.
struct CountingRosterStore {
    inner: Arc<LocalStore>,
    fetches: AtomicUsize,
}

#[async_trait]
impl RosterStore for CountingRosterStore {
    async fn memberships(&self, server_id: Uuid) -> StoreResult<Vec<Membership>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.memberships(server_id).await
    }

    async fn profiles_by_ids(&self, ids: &[Uuid]) -> StoreResult<Vec<Profile>> {
        self.inner.profiles_by_ids(ids).await
    }
}

impl Feed for CountingRosterStore {
    fn subscribe(&self, interest: Interest) -> FeedSubscription {
        self.inner.subscribe(interest)
    }
}

#[tokio::test]
async fn roster_tracks_membership_and_presence() {
    let inner = Arc::new(LocalStore::in_memory().unwrap());
    let alice = seed_profile(&inner, "alice").await;
    let bob = seed_profile(&inner, "bob").await;
    let outsider = seed_profile(&inner, "mallory").await;

    let server_id = Uuid::new_v4();
    inner
        .insert_server(Server {
            id: server_id,
            name: "club".into(),
            description: None,
            icon: None,
            is_private: false,
            owner_id: alice,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    for user in [alice, bob] {
        inner
            .join_server(Membership {
                id: Uuid::new_v4(),
                server_id,
                user_id: user,
                joined_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    let store =
        Arc::new(CountingRosterStore { inner: inner.clone(), fetches: AtomicUsize::new(0) });
    let sync = RosterSync::new(store.clone());
    let mut handle = sync.open(server_id).await.unwrap();

    let roster = handle.roster();
    assert_eq!(roster.len(), 2);
    assert!(roster.online.is_empty());

    // A member comes online: the roster repartitions.
    inner.set_presence(bob, PresenceStatus::Online, Utc::now()).await.unwrap();
    let mut online_names = vec![];
    for _ in 0..100 {
        online_names = handle
            .roster()
            .online
            .iter()
            .map(|m| m.username.clone())
            .collect();
        if !online_names.is_empty() {
            break;
        }
        let _ = timeout(Duration::from_millis(50), handle.changed()).await;
    }
    assert_eq!(online_names, vec!["bob".to_string()]);

    // A non-member's presence change is gated out: no extra roster fetch.
    let fetches_before = store.fetches.load(Ordering::SeqCst);
    inner
        .set_presence(outsider, PresenceStatus::Online, Utc::now())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.fetches.load(Ordering::SeqCst), fetches_before);
}
