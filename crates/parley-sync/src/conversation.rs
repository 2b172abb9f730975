use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use parley_store::feed::{ColumnFilter, Feed, FeedSignal, FeedSubscription, Interest};
use parley_store::ConversationStore;
use parley_types::events::{ChangeOp, RowChange, Table};
use parley_types::models::{DirectMessage, Message};
use parley_types::{StoreError, StoreResult};

/// Identifies the message set a conversation view covers: one channel, or
/// one unordered DM pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Channel(Uuid),
    Direct { low: Uuid, high: Uuid },
}

impl Scope {
    pub fn channel(id: Uuid) -> Self {
        Self::Channel(id)
    }

    /// DM scope is symmetric: the pair is normalized so `direct(a, b)` and
    /// `direct(b, a)` name the same scope.
    pub fn direct(a: Uuid, b: Uuid) -> Self {
        if a <= b { Self::Direct { low: a, high: b } } else { Self::Direct { low: b, high: a } }
    }

    /// Whether a DM row belongs to this scope, in either direction.
    pub fn includes_direct(&self, dm: &DirectMessage) -> bool {
        match *self {
            Self::Direct { low, high } => {
                (dm.sender_id == low && dm.receiver_id == high)
                    || (dm.sender_id == high && dm.receiver_id == low)
            }
            Self::Channel(_) => false,
        }
    }

    /// The other participant of a DM scope, from `me`'s side.
    pub fn peer_of(&self, me: Uuid) -> Option<Uuid> {
        match *self {
            Self::Direct { low, high } if low == me => Some(high),
            Self::Direct { low, high } if high == me => Some(low),
            _ => None,
        }
    }
}

/// One displayable conversation row, channel message or DM alike.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub id: Uuid,
    pub author_id: Uuid,
    pub content: String,
    pub media_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
}

impl From<Message> for Entry {
    fn from(m: Message) -> Self {
        Self {
            id: m.id,
            author_id: m.author_id,
            content: m.content,
            media_url: m.media_url,
            created_at: m.created_at,
            edited_at: m.edited_at,
        }
    }
}

impl From<DirectMessage> for Entry {
    fn from(m: DirectMessage) -> Self {
        Self {
            id: m.id,
            author_id: m.sender_id,
            content: m.content,
            media_url: m.media_url,
            created_at: m.created_at,
            edited_at: m.edited_at,
        }
    }
}

/// Pure view derivation: dedup by id (first occurrence wins), then order by
/// `(created_at, id)`. Every published snapshot goes through here, so two
/// views over the same rows are always identical.
pub fn derive_view(rows: Vec<Entry>) -> Vec<Entry> {
    let mut seen = HashSet::new();
    let mut view: Vec<Entry> = rows.into_iter().filter(|e| seen.insert(e.id)).collect();
    view.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    view
}

/// Opens live views over conversation scopes.
///
/// Carries the generation counter guarding against stale responses: each
/// `open` supersedes the previous one, and a superseded view stops
/// publishing even if its fetches are still in flight.
pub struct ConversationSync<S> {
    store: Arc<S>,
    viewer: Uuid,
    active: Arc<AtomicU64>,
}

impl<S> ConversationSync<S>
where
    S: ConversationStore + Feed + Send + Sync + 'static,
{
    pub fn new(store: Arc<S>, viewer: Uuid) -> Self {
        Self { store, viewer, active: Arc::new(AtomicU64::new(0)) }
    }

    /// Open a live view: initial fetch plus a change-feed subscription that
    /// refetches on every in-scope event.
    ///
    /// An initial fetch failure is returned to the caller as-is; there is
    /// no automatic retry — call `open` again.
    pub async fn open(&self, scope: Scope) -> StoreResult<ConversationHandle> {
        let generation = self.active.fetch_add(1, Ordering::SeqCst) + 1;

        // Subscribe before the fetch so no event can fall in between. The
        // DM interest is table-wide: the feed's filter language cannot
        // express the OR across sender/receiver, so the pair predicate is
        // applied client-side.
        let sub = match scope {
            Scope::Channel(id) => self
                .store
                .subscribe(Interest::filtered(Table::Messages, ColumnFilter::ChannelId(id))),
            Scope::Direct { .. } => self.store.subscribe(Interest::table(Table::DirectMessages)),
        };

        let initial = fetch_scope(self.store.as_ref(), scope).await?;

        // Opening a DM conversation reads it.
        if let Some(peer) = scope.peer_of(self.viewer) {
            if let Err(e) = self.store.mark_direct_read(self.viewer, peer).await {
                warn!(error = %e, "failed to mark conversation read");
            }
        }

        let (entries_tx, entries_rx) = watch::channel(initial);
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(run_view(
            self.store.clone(),
            self.viewer,
            scope,
            sub,
            entries_tx,
            errors_tx,
            closed.clone(),
            self.active.clone(),
            generation,
        ));

        Ok(ConversationHandle {
            scope,
            generation,
            active: self.active.clone(),
            entries: entries_rx,
            errors: errors_rx,
            closed,
            task,
        })
    }
}

async fn fetch_scope<S: ConversationStore>(store: &S, scope: Scope) -> StoreResult<Vec<Entry>> {
    let rows = match scope {
        Scope::Channel(id) => store
            .channel_messages(id)
            .await?
            .into_iter()
            .map(Entry::from)
            .collect(),
        Scope::Direct { low, high } => store
            .direct_messages(low, high)
            .await?
            .into_iter()
            .map(Entry::from)
            .collect(),
    };
    Ok(derive_view(rows))
}

#[allow(clippy::too_many_arguments)]
async fn run_view<S>(
    store: Arc<S>,
    viewer: Uuid,
    scope: Scope,
    mut sub: FeedSubscription,
    entries: watch::Sender<Vec<Entry>>,
    errors: mpsc::UnboundedSender<StoreError>,
    closed: Arc<AtomicBool>,
    active: Arc<AtomicU64>,
    generation: u64,
) where
    S: ConversationStore + Feed + Send + Sync + 'static,
{
    let still_current =
        || !closed.load(Ordering::SeqCst) && active.load(Ordering::SeqCst) == generation;

    while let Some(signal) = sub.next().await {
        if !still_current() {
            debug!(?scope, "conversation view superseded, stopping");
            return;
        }

        let mut peer_insert = false;
        if let FeedSignal::Change(event) = &signal {
            match (&event.row, scope) {
                (RowChange::DirectMessage(dm), Scope::Direct { .. }) => {
                    if !scope.includes_direct(dm) {
                        continue;
                    }
                    if event.op == ChangeOp::Insert {
                        peer_insert = scope.peer_of(viewer) == Some(dm.sender_id);
                        // Optimistic append: trust the payload now, let the
                        // refetch below confirm it. derive_view dedups the
                        // entry once the authoritative copy arrives.
                        let mut next = entries.borrow().clone();
                        next.push(Entry::from(dm.clone()));
                        entries.send_replace(derive_view(next));
                    }
                }
                (RowChange::Message(_), Scope::Channel(_)) => {}
                // Filtered channel interest only delivers message rows;
                // anything else is out of scope.
                _ => continue,
            }
        }

        // An incoming message from the peer is read the moment it lands in
        // an open conversation.
        if peer_insert {
            if let Some(peer) = scope.peer_of(viewer) {
                if let Err(e) = store.mark_direct_read(viewer, peer).await {
                    warn!(error = %e, "failed to mark conversation read");
                }
            }
        }

        // Refetch for truth rather than patching from the event stream.
        match fetch_scope(store.as_ref(), scope).await {
            Ok(view) => {
                if !still_current() {
                    return;
                }
                entries.send_replace(view);
            }
            Err(e) => {
                // Fail-stale: keep the previous snapshot, surface the error.
                warn!(?scope, error = %e, "conversation refetch failed");
                let _ = errors.send(e);
            }
        }
    }
}

/// A live, ordered, deduplicated view of one conversation scope.
pub struct ConversationHandle {
    scope: Scope,
    generation: u64,
    active: Arc<AtomicU64>,
    entries: watch::Receiver<Vec<Entry>>,
    errors: mpsc::UnboundedReceiver<StoreError>,
    closed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ConversationHandle {
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Current snapshot.
    pub fn entries(&self) -> Vec<Entry> {
        self.entries.borrow().clone()
    }

    /// Wait for the next snapshot. Returns `false` once the view is closed.
    pub async fn changed(&mut self) -> bool {
        self.entries.changed().await.is_ok()
    }

    /// Next transient error, if one is queued. Errors never clear the
    /// snapshot; they are reported so the caller can notify the user.
    pub fn try_next_error(&mut self) -> Option<StoreError> {
        self.errors.try_recv().ok()
    }

    /// Whether this view is still the active one for its synchronizer.
    pub fn is_current(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.active.load(Ordering::SeqCst) == self.generation
    }

    /// Unsubscribe and stop the view. Safe to call more than once; after it
    /// returns no further snapshots are published.
    pub fn close(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.task.abort();
    }
}

impl Drop for ConversationHandle {
    fn drop(&mut self) {
        self.close();
    }
}
