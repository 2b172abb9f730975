use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use parley_store::feed::{ColumnFilter, Feed, FeedSignal, Interest};
use parley_store::ReactionStore;
use parley_types::events::{RowChange, Table};
use parley_types::models::{MessageTable, Reaction};
use parley_types::{StoreError, StoreResult};

/// Display-ready tally for one emoji on one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionGroup {
    pub emoji: String,
    pub count: usize,
    pub users: Vec<Uuid>,
    pub viewer_has_reacted: bool,
}

/// Fold the flat reaction log into per-emoji groups.
///
/// Group order is first occurrence in the log — deterministic for a fixed
/// log, but dependent on fetch order, so assertions should treat it as
/// unordered. `users` keeps insertion order; `count` is distinct users.
pub fn aggregate(rows: &[Reaction], viewer: Uuid) -> Vec<ReactionGroup> {
    let mut order: Vec<&str> = Vec::new();
    let mut users_by_emoji: HashMap<&str, Vec<Uuid>> = HashMap::new();

    for r in rows {
        let users = users_by_emoji.entry(r.emoji.as_str()).or_insert_with(|| {
            order.push(r.emoji.as_str());
            Vec::new()
        });
        if !users.contains(&r.user_id) {
            users.push(r.user_id);
        }
    }

    order
        .into_iter()
        .map(|emoji| {
            let users = users_by_emoji.remove(emoji).unwrap_or_default();
            ReactionGroup {
                emoji: emoji.to_owned(),
                count: users.len(),
                viewer_has_reacted: users.contains(&viewer),
                users,
            }
        })
        .collect()
}

/// Toggle and summary operations for the local viewer.
pub struct Reactions<S> {
    store: Arc<S>,
    viewer: Uuid,
}

impl<S> Reactions<S>
where
    S: ReactionStore + Send + Sync,
{
    pub fn new(store: Arc<S>, viewer: Uuid) -> Self {
        Self { store, viewer }
    }

    /// Toggle the viewer's reaction: delete the row if it exists, insert it
    /// otherwise. Returns whether the reaction is now present.
    ///
    /// This is an existence check followed by a branch, not an upsert —
    /// repeated calls alternate. Two clients racing the same key can make
    /// the insert land on an existing row; that surfaces as `Conflict` and
    /// the last writer wins, which is acceptable for this feature.
    pub async fn toggle(
        &self,
        message_id: Uuid,
        table: MessageTable,
        emoji: &str,
    ) -> StoreResult<bool> {
        match self
            .store
            .find_reaction(message_id, table, self.viewer, emoji)
            .await?
        {
            Some(id) => {
                self.store.delete_reaction(id).await?;
                Ok(false)
            }
            None => {
                self.store
                    .insert_reaction(Reaction {
                        id: Uuid::new_v4(),
                        message_id,
                        table,
                        user_id: self.viewer,
                        emoji: emoji.to_owned(),
                        created_at: Utc::now(),
                    })
                    .await?;
                Ok(true)
            }
        }
    }

    /// One-shot fetch + aggregate.
    pub async fn summary(
        &self,
        message_id: Uuid,
        table: MessageTable,
    ) -> StoreResult<Vec<ReactionGroup>> {
        let rows = self.store.reactions_for(message_id, table).await?;
        Ok(aggregate(&rows, self.viewer))
    }
}

/// Live per-message reaction views. Unlike conversations, many watchers are
/// open at once (one per rendered message), so handles are independent.
pub struct ReactionSync<S> {
    store: Arc<S>,
    viewer: Uuid,
}

impl<S> ReactionSync<S>
where
    S: ReactionStore + Feed + Send + Sync + 'static,
{
    pub fn new(store: Arc<S>, viewer: Uuid) -> Self {
        Self { store, viewer }
    }

    pub async fn open(
        &self,
        message_id: Uuid,
        table: MessageTable,
    ) -> StoreResult<ReactionHandle> {
        let mut sub = self
            .store
            .subscribe(Interest::filtered(Table::Reactions, ColumnFilter::MessageId(message_id)));

        let rows = self.store.reactions_for(message_id, table).await?;
        let (groups_tx, groups_rx) = watch::channel(aggregate(&rows, self.viewer));
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let store = self.store.clone();
        let viewer = self.viewer;
        let task_closed = closed.clone();
        let task = tokio::spawn(async move {
            while let Some(signal) = sub.next().await {
                if task_closed.load(Ordering::SeqCst) {
                    return;
                }
                // The interest filters by message id; the table tag still
                // needs a client-side check since both message tables share
                // the reaction log.
                if let FeedSignal::Change(event) = &signal {
                    if let RowChange::Reaction(r) = &event.row {
                        if r.table != table {
                            continue;
                        }
                    }
                }
                match store.reactions_for(message_id, table).await {
                    Ok(rows) => {
                        if task_closed.load(Ordering::SeqCst) {
                            return;
                        }
                        groups_tx.send_replace(aggregate(&rows, viewer));
                    }
                    Err(e) => {
                        warn!(%message_id, error = %e, "reaction refetch failed");
                        let _ = errors_tx.send(e);
                    }
                }
            }
        });

        Ok(ReactionHandle { groups: groups_rx, errors: errors_rx, closed, task })
    }
}

/// A live reaction summary for one message.
pub struct ReactionHandle {
    groups: watch::Receiver<Vec<ReactionGroup>>,
    errors: mpsc::UnboundedReceiver<StoreError>,
    closed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ReactionHandle {
    pub fn groups(&self) -> Vec<ReactionGroup> {
        self.groups.borrow().clone()
    }

    pub async fn changed(&mut self) -> bool {
        self.groups.changed().await.is_ok()
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

impl Drop for ReactionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reaction(message_id: Uuid, user_id: Uuid, emoji: &str) -> Reaction {
        Reaction {
            id: Uuid::new_v4(),
            message_id,
            table: MessageTable::Messages,
            user_id,
            emoji: emoji.into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn aggregate_groups_by_emoji_in_first_occurrence_order() {
        let message = Uuid::new_v4();
        let (u1, u2, u3) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        let rows = vec![
            reaction(message, u1, "👍"),
            reaction(message, u2, "🔥"),
            reaction(message, u2, "👍"),
            reaction(message, u3, "👍"),
        ];

        let groups = aggregate(&rows, u3);
        assert_eq!(groups.len(), 2);

        assert_eq!(groups[0].emoji, "👍");
        assert_eq!(groups[0].count, 3);
        assert_eq!(groups[0].users, vec![u1, u2, u3]);
        assert!(groups[0].viewer_has_reacted);

        assert_eq!(groups[1].emoji, "🔥");
        assert_eq!(groups[1].count, 1);
        assert!(!groups[1].viewer_has_reacted);
    }

    #[test]
    fn aggregate_counts_distinct_users() {
        let message = Uuid::new_v4();
        let user = Uuid::new_v4();
        // Duplicate rows for the same key must not double-count.
        let rows = vec![reaction(message, user, "👍"), reaction(message, user, "👍")];

        let groups = aggregate(&rows, user);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].count, 1);
        assert_eq!(groups[0].users, vec![user]);
    }

    #[test]
    fn aggregate_of_empty_log_is_empty() {
        assert!(aggregate(&[], Uuid::new_v4()).is_empty());
    }

    mod toggle {
        use super::*;
        use parley_store::LocalStore;
        use parley_types::models::{PresenceStatus, Profile};
        use parley_store::ProfileStore;

        async fn seeded_store() -> (Arc<LocalStore>, Uuid) {
            let store = Arc::new(LocalStore::in_memory().unwrap());
            let user = Uuid::new_v4();
            store
                .upsert_profile(Profile {
                    id: user,
                    username: "alice".into(),
                    avatar_url: None,
                    status: PresenceStatus::Online,
                    last_seen: None,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
            (store, user)
        }

        #[tokio::test]
        async fn even_number_of_toggles_restores_absence() {
            let (store, user) = seeded_store().await;
            let reactions = Reactions::new(store.clone(), user);
            let message = Uuid::new_v4();

            for i in 0..4 {
                let added = reactions
                    .toggle(message, MessageTable::Messages, "👍")
                    .await
                    .unwrap();
                assert_eq!(added, i % 2 == 0);
            }

            let rows = store
                .reactions_for(message, MessageTable::Messages)
                .await
                .unwrap();
            assert!(rows.is_empty());
        }

        #[tokio::test]
        async fn odd_number_of_toggles_leaves_exactly_one_row() {
            let (store, user) = seeded_store().await;
            let reactions = Reactions::new(store.clone(), user);
            let message = Uuid::new_v4();

            for _ in 0..3 {
                reactions
                    .toggle(message, MessageTable::Messages, "👍")
                    .await
                    .unwrap();
            }

            let rows = store
                .reactions_for(message, MessageTable::Messages)
                .await
                .unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].user_id, user);
            assert_eq!(rows[0].emoji, "👍");
        }

        #[tokio::test]
        async fn toggles_on_different_tables_do_not_collide() {
            let (store, user) = seeded_store().await;
            let reactions = Reactions::new(store.clone(), user);
            let message = Uuid::new_v4();

            reactions
                .toggle(message, MessageTable::Messages, "👍")
                .await
                .unwrap();
            reactions
                .toggle(message, MessageTable::DirectMessages, "👍")
                .await
                .unwrap();

            assert_eq!(
                store.reactions_for(message, MessageTable::Messages).await.unwrap().len(),
                1
            );
            assert_eq!(
                store
                    .reactions_for(message, MessageTable::DirectMessages)
                    .await
                    .unwrap()
                    .len(),
                1
            );
        }
    }
}
