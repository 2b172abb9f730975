use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use parley_store::feed::{ColumnFilter, Feed, FeedSignal, Interest};
use parley_store::RosterStore;
use parley_types::events::{RowChange, Table};
use parley_types::models::PresenceStatus;
use parley_types::{StoreError, StoreResult};

/// One member row joined with their profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberView {
    pub user_id: Uuid,
    pub username: String,
    pub avatar_url: Option<String>,
    pub status: PresenceStatus,
    pub joined_at: DateTime<Utc>,
}

/// The member list split for display. A pure projection: `online` holds
/// everyone present in some form (`online`, `idle`, `dnd`), `offline` the
/// rest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    pub online: Vec<MemberView>,
    pub offline: Vec<MemberView>,
}

impl Roster {
    pub fn len(&self) -> usize {
        self.online.len() + self.offline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.online.is_empty() && self.offline.is_empty()
    }
}

/// Partition members into the two display groups, each sorted by name.
pub fn partition(mut members: Vec<MemberView>) -> Roster {
    members.sort_by(|a, b| a.username.cmp(&b.username).then(a.user_id.cmp(&b.user_id)));
    let mut roster = Roster::default();
    for member in members {
        if member.status.is_online_like() {
            roster.online.push(member);
        } else {
            roster.offline.push(member);
        }
    }
    roster
}

/// Opens live member lists for servers.
pub struct RosterSync<S> {
    store: Arc<S>,
}

impl<S> RosterSync<S>
where
    S: RosterStore + Feed + Send + Sync + 'static,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Fetch the roster and keep it live: membership changes for this
    /// server refetch directly; profile updates refetch only when the
    /// profile belongs to a current member (presence events carry no server
    /// context, so the unfiltered profile stream is gated client-side).
    pub async fn open(&self, server_id: Uuid) -> StoreResult<RosterHandle> {
        let mut members_sub = self
            .store
            .subscribe(Interest::filtered(Table::Memberships, ColumnFilter::ServerId(server_id)));
        let mut profiles_sub = self.store.subscribe(Interest::table(Table::Profiles));

        let (roster, mut member_ids) = fetch_roster(self.store.as_ref(), server_id).await?;

        let (roster_tx, roster_rx) = watch::channel(roster);
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let store = self.store.clone();
        let task_closed = closed.clone();
        let task = tokio::spawn(async move {
            loop {
                let refetch = tokio::select! {
                    signal = members_sub.next() => match signal {
                        Some(_) => true,
                        None => break,
                    },
                    signal = profiles_sub.next() => match signal {
                        Some(FeedSignal::Change(event)) => match &event.row {
                            RowChange::Profile(profile) => member_ids.contains(&profile.id),
                            _ => false,
                        },
                        Some(FeedSignal::Resync) => true,
                        None => break,
                    },
                };
                if task_closed.load(Ordering::SeqCst) {
                    return;
                }
                if !refetch {
                    continue;
                }
                match fetch_roster(store.as_ref(), server_id).await {
                    Ok((roster, ids)) => {
                        if task_closed.load(Ordering::SeqCst) {
                            return;
                        }
                        member_ids = ids;
                        roster_tx.send_replace(roster);
                    }
                    Err(e) => {
                        warn!(%server_id, error = %e, "roster refetch failed");
                        let _ = errors_tx.send(e);
                    }
                }
            }
        });

        Ok(RosterHandle { roster: roster_rx, errors: errors_rx, closed, task })
    }
}

async fn fetch_roster<S: RosterStore>(
    store: &S,
    server_id: Uuid,
) -> StoreResult<(Roster, HashSet<Uuid>)> {
    let memberships = store.memberships(server_id).await?;
    let member_ids: HashSet<Uuid> = memberships.iter().map(|m| m.user_id).collect();
    let ids: Vec<Uuid> = member_ids.iter().copied().collect();
    let profiles = store.profiles_by_ids(&ids).await?;
    let by_id: HashMap<Uuid, _> =
        profiles.into_iter().map(|p| (p.id, p)).collect();

    let members = memberships
        .into_iter()
        .filter_map(|m| {
            // A membership whose profile row is missing is dropped rather
            // than rendered half-empty.
            by_id.get(&m.user_id).map(|p| MemberView {
                user_id: m.user_id,
                username: p.username.clone(),
                avatar_url: p.avatar_url.clone(),
                status: p.status,
                joined_at: m.joined_at,
            })
        })
        .collect();

    Ok((partition(members), member_ids))
}

/// A live member list for one server.
pub struct RosterHandle {
    roster: watch::Receiver<Roster>,
    errors: mpsc::UnboundedReceiver<StoreError>,
    closed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl RosterHandle {
    pub fn roster(&self) -> Roster {
        self.roster.borrow().clone()
    }

    pub async fn changed(&mut self) -> bool {
        self.roster.changed().await.is_ok()
    }

    pub fn try_next_error(&mut self) -> Option<StoreError> {
        self.errors.try_recv().ok()
    }

    /// Idempotent; no further snapshots after it returns.
    pub fn close(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.task.abort();
    }
}

impl Drop for RosterHandle {
    fn drop(&mut self) {
        self.close();
    }
}
