use std::sync::Arc;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use parley_store::{DirectoryStore, SocialStore};
use parley_types::models::{
    Ban, Category, Channel, ChannelKind, Membership, RoleAssignment, Server, ServerRole,
};
use parley_types::{StoreError, StoreResult};

/// Channels of one server grouped for the sidebar: the uncategorized root
/// list plus each category with its channels, all in position order.
#[derive(Debug, Clone)]
pub struct ChannelTree {
    pub root: Vec<Channel>,
    pub categories: Vec<(Category, Vec<Channel>)>,
}

/// Group position-ordered rows into the sidebar tree. Inputs come from the
/// store already ordered by `(position, created_at)`.
pub fn build_tree(categories: Vec<Category>, channels: Vec<Channel>) -> ChannelTree {
    let mut root = Vec::new();
    let mut grouped: Vec<(Category, Vec<Channel>)> =
        categories.into_iter().map(|c| (c, Vec::new())).collect();

    for channel in channels {
        match channel.category_id {
            None => root.push(channel),
            Some(category_id) => {
                if let Some((_, members)) =
                    grouped.iter_mut().find(|(c, _)| c.id == category_id)
                {
                    members.push(channel);
                } else {
                    // Orphaned category reference: show the channel at the
                    // root rather than losing it.
                    root.push(channel);
                }
            }
        }
    }

    ChannelTree { root, categories: grouped }
}

/// Swap two siblings and renumber the whole group densely from 0, so
/// positions stay contiguous with no gaps or duplicates.
pub fn renumber_after_swap(ordered_ids: &[Uuid], a: usize, b: usize) -> Vec<(Uuid, i64)> {
    let mut ids = ordered_ids.to_vec();
    ids.swap(a, b);
    ids.into_iter().enumerate().map(|(i, id)| (id, i as i64)).collect()
}

/// Server, channel and category management plus the membership flows.
pub struct Directory<S> {
    store: Arc<S>,
    user: Uuid,
}

impl<S> Directory<S>
where
    S: DirectoryStore + SocialStore + Send + Sync,
{
    pub fn new(store: Arc<S>, user: Uuid) -> Self {
        Self { store, user }
    }

    pub async fn servers(&self) -> StoreResult<Vec<Server>> {
        self.store.servers().await
    }

    /// Create a server owned by the local user: the owner joins it and a
    /// seed `general` channel is created so the server is usable at once.
    pub async fn create_server(
        &self,
        name: &str,
        description: Option<String>,
        is_private: bool,
    ) -> StoreResult<Server> {
        let server = Server {
            id: Uuid::new_v4(),
            name: name.trim().to_owned(),
            description,
            icon: None,
            is_private,
            owner_id: self.user,
            created_at: Utc::now(),
        };
        self.store.insert_server(server.clone()).await?;
        self.store
            .join_server(Membership {
                id: Uuid::new_v4(),
                server_id: server.id,
                user_id: self.user,
                joined_at: Utc::now(),
            })
            .await?;
        self.store
            .insert_channel(Channel {
                id: Uuid::new_v4(),
                server_id: server.id,
                category_id: None,
                name: "general".into(),
                kind: ChannelKind::Text,
                position: 0,
                created_at: Utc::now(),
            })
            .await?;
        info!(server = %server.id, name = %server.name, "server created");
        Ok(server)
    }

    /// Join a server. Already a member surfaces as `Conflict`.
    pub async fn join(&self, server_id: Uuid) -> StoreResult<()> {
        self.store
            .join_server(Membership {
                id: Uuid::new_v4(),
                server_id,
                user_id: self.user,
                joined_at: Utc::now(),
            })
            .await
    }

    pub async fn leave(&self, server_id: Uuid) -> StoreResult<()> {
        self.store.leave_server(server_id, self.user).await
    }

    /// New categories land after the existing ones.
    pub async fn create_category(&self, server_id: Uuid, name: &str) -> StoreResult<Category> {
        let existing = self.store.categories(server_id).await?;
        let position = existing.iter().map(|c| c.position + 1).max().unwrap_or(0);
        let category = Category {
            id: Uuid::new_v4(),
            server_id,
            name: name.trim().to_owned(),
            position,
            created_at: Utc::now(),
        };
        self.store.insert_category(category.clone()).await?;
        Ok(category)
    }

    /// New channels land at the end of their sibling group.
    pub async fn create_channel(
        &self,
        server_id: Uuid,
        category_id: Option<Uuid>,
        name: &str,
        kind: ChannelKind,
    ) -> StoreResult<Channel> {
        let siblings = self.siblings(server_id, category_id).await?;
        let position = siblings.iter().map(|c| c.position + 1).max().unwrap_or(0);
        let channel = Channel {
            id: Uuid::new_v4(),
            server_id,
            category_id,
            name: name.trim().to_owned(),
            kind,
            position,
            created_at: Utc::now(),
        };
        self.store.insert_channel(channel.clone()).await?;
        Ok(channel)
    }

    pub async fn channel_tree(&self, server_id: Uuid) -> StoreResult<ChannelTree> {
        let categories = self.store.categories(server_id).await?;
        let channels = self.store.channels(server_id).await?;
        Ok(build_tree(categories, channels))
    }

    /// Swap two channels within a sibling group (root list or one
    /// category) and settle the group's positions densely from 0.
    pub async fn swap_channels(
        &self,
        server_id: Uuid,
        category_id: Option<Uuid>,
        a: usize,
        b: usize,
    ) -> StoreResult<()> {
        let siblings = self.siblings(server_id, category_id).await?;
        if a >= siblings.len() || b >= siblings.len() {
            return Err(StoreError::NotFound("channel"));
        }

        let ids: Vec<Uuid> = siblings.iter().map(|c| c.id).collect();
        for (id, position) in renumber_after_swap(&ids, a, b) {
            let unchanged = siblings
                .iter()
                .any(|c| c.id == id && c.position == position);
            if !unchanged {
                self.store.set_channel_position(id, position).await?;
            }
        }
        Ok(())
    }

    async fn siblings(
        &self,
        server_id: Uuid,
        category_id: Option<Uuid>,
    ) -> StoreResult<Vec<Channel>> {
        let channels = self.store.channels(server_id).await?;
        Ok(channels
            .into_iter()
            .filter(|c| c.category_id == category_id)
            .collect())
    }

    /// The user's effective role. Ownership is derived from the server row
    /// — it is never stored as a role assignment.
    pub async fn effective_role(
        &self,
        server_id: Uuid,
        user_id: Uuid,
    ) -> StoreResult<ServerRole> {
        let server = self
            .store
            .server(server_id)
            .await?
            .ok_or(StoreError::NotFound("server"))?;
        if server.owner_id == user_id {
            return Ok(ServerRole::Owner);
        }
        Ok(self
            .store
            .role_row(server_id, user_id)
            .await?
            .map(|r| r.role)
            .unwrap_or(ServerRole::Member))
    }

    pub async fn assign_role(
        &self,
        server_id: Uuid,
        user_id: Uuid,
        role: ServerRole,
    ) -> StoreResult<()> {
        self.store
            .assign_role(RoleAssignment {
                id: Uuid::new_v4(),
                server_id,
                user_id,
                role,
                created_at: Utc::now(),
            })
            .await
    }

    /// Ban a user: record the ban and drop their membership. Banning
    /// someone who already left still records the ban.
    pub async fn ban(
        &self,
        server_id: Uuid,
        user_id: Uuid,
        reason: Option<String>,
    ) -> StoreResult<()> {
        self.store
            .insert_ban(Ban {
                id: Uuid::new_v4(),
                server_id,
                user_id,
                banned_by: self.user,
                reason,
                created_at: Utc::now(),
            })
            .await?;
        match self.store.leave_server(server_id, user_id).await {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_store::{LocalStore, ProfileStore, RosterStore};
    use parley_types::models::{PresenceStatus, Profile};

    fn channel(server_id: Uuid, category_id: Option<Uuid>, name: &str, position: i64) -> Channel {
        Channel {
            id: Uuid::new_v4(),
            server_id,
            category_id,
            name: name.into(),
            kind: ChannelKind::Text,
            position,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn swap_of_first_and_third_settles_dense_positions() {
        let ids = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let renumbered = renumber_after_swap(&ids, 0, 2);

        // New order maps onto [0, 1, 2] — no gaps, no duplicates.
        let positions: Vec<i64> = renumbered.iter().map(|(_, p)| *p).collect();
        assert_eq!(positions, vec![0, 1, 2]);
        assert_eq!(renumbered[0].0, ids[2]);
        assert_eq!(renumbered[1].0, ids[1]);
        assert_eq!(renumbered[2].0, ids[0]);
    }

    #[test]
    fn tree_groups_channels_under_their_categories() {
        let server = Uuid::new_v4();
        let category = Category {
            id: Uuid::new_v4(),
            server_id: server,
            name: "voice rooms".into(),
            position: 0,
            created_at: Utc::now(),
        };

        let rooted = channel(server, None, "general", 0);
        let nested = channel(server, Some(category.id), "lounge", 0);
        let orphaned = channel(server, Some(Uuid::new_v4()), "lost", 1);

        let tree = build_tree(
            vec![category.clone()],
            vec![rooted.clone(), nested.clone(), orphaned.clone()],
        );

        let root_names: Vec<&str> = tree.root.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(root_names, vec!["general", "lost"]);
        assert_eq!(tree.categories.len(), 1);
        assert_eq!(tree.categories[0].0.id, category.id);
        assert_eq!(tree.categories[0].1[0].id, nested.id);
    }

    async fn seeded() -> (Arc<LocalStore>, Directory<LocalStore>, Uuid) {
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
        let directory = Directory::new(store.clone(), user);
        (store, directory, user)
    }

    #[tokio::test]
    async fn create_server_seeds_membership_and_general_channel() {
        let (store, directory, user) = seeded().await;
        let server = directory.create_server("club", None, false).await.unwrap();

        assert_eq!(server.owner_id, user);
        let members = store.memberships(server.id).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].user_id, user);

        let tree = directory.channel_tree(server.id).await.unwrap();
        assert_eq!(tree.root.len(), 1);
        assert_eq!(tree.root[0].name, "general");
    }

    #[tokio::test]
    async fn new_channels_append_to_their_sibling_group() {
        let (_store, directory, _user) = seeded().await;
        let server = directory.create_server("club", None, false).await.unwrap();

        let second = directory
            .create_channel(server.id, None, "random", ChannelKind::Text)
            .await
            .unwrap();
        assert_eq!(second.position, 1);

        let category = directory.create_category(server.id, "projects").await.unwrap();
        assert_eq!(category.position, 0);
        let nested = directory
            .create_channel(server.id, Some(category.id), "alpha", ChannelKind::Text)
            .await
            .unwrap();
        // Sibling groups number independently.
        assert_eq!(nested.position, 0);
    }

    #[tokio::test]
    async fn swapping_channels_keeps_positions_dense() {
        let (_store, directory, _user) = seeded().await;
        let server = directory.create_server("club", None, false).await.unwrap();
        for name in ["random", "memes"] {
            directory
                .create_channel(server.id, None, name, ChannelKind::Text)
                .await
                .unwrap();
        }

        directory.swap_channels(server.id, None, 0, 2).await.unwrap();

        let tree = directory.channel_tree(server.id).await.unwrap();
        let names: Vec<&str> = tree.root.iter().map(|c| c.name.as_str()).collect();
        let positions: Vec<i64> = tree.root.iter().map(|c| c.position).collect();
        assert_eq!(names, vec!["memes", "random", "general"]);
        assert_eq!(positions, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn owner_role_is_derived_not_stored() {
        let (store, directory, user) = seeded().await;
        let server = directory.create_server("club", None, false).await.unwrap();

        assert_eq!(
            directory.effective_role(server.id, user).await.unwrap(),
            ServerRole::Owner
        );
        assert!(store.role_row(server.id, user).await.unwrap().is_none());

        // Everyone else defaults to member until a role row exists.
        let other = Uuid::new_v4();
        assert_eq!(
            directory.effective_role(server.id, other).await.unwrap(),
            ServerRole::Member
        );
    }

    #[tokio::test]
    async fn ban_records_and_removes_membership() {
        let (store, directory, _user) = seeded().await;
        let server = directory.create_server("club", None, false).await.unwrap();

        let troll = Uuid::new_v4();
        store
            .upsert_profile(Profile {
                id: troll,
                username: "troll".into(),
                avatar_url: None,
                status: PresenceStatus::Online,
                last_seen: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store
            .join_server(Membership {
                id: Uuid::new_v4(),
                server_id: server.id,
                user_id: troll,
                joined_at: Utc::now(),
            })
            .await
            .unwrap();

        directory.ban(server.id, troll, Some("spam".into())).await.unwrap();

        let members = store.memberships(server.id).await.unwrap();
        assert!(members.iter().all(|m| m.user_id != troll));
        let bans = store.bans(server.id).await.unwrap();
        assert_eq!(bans.len(), 1);
        assert_eq!(bans[0].user_id, troll);
        assert_eq!(bans[0].reason.as_deref(), Some("spam"));
    }
}
