use std::sync::Arc;

use chrono::Utc;
use futures_util::future::try_join_all;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use parley_store::{ConversationStore, ProfileStore, RosterStore, SocialStore};
use parley_types::models::{Friendship, FriendshipState, PresenceStatus};
use parley_types::{StoreError, StoreResult};

#[derive(Debug, Error)]
pub enum FriendError {
    #[error("cannot send a friend request to yourself")]
    SelfRequest,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One friendship from the local user's point of view.
#[derive(Debug, Clone)]
pub struct FriendEntry {
    pub friendship_id: Uuid,
    pub peer_id: Uuid,
    pub username: String,
    pub status: PresenceStatus,
    pub state: FriendshipState,
    pub requested_by_me: bool,
}

/// Friendships partitioned for display: requests awaiting the local user's
/// answer, and established friends.
#[derive(Debug, Clone, Default)]
pub struct FriendOverview {
    pub incoming: Vec<FriendEntry>,
    pub friends: Vec<FriendEntry>,
}

/// A DM conversation row: one accepted friend plus their unread badge.
#[derive(Debug, Clone)]
pub struct DmConversation {
    pub peer_id: Uuid,
    pub username: String,
    pub unread: u64,
}

/// Friend request flows and the DM conversation list.
pub struct Friends<S> {
    store: Arc<S>,
    user: Uuid,
}

impl<S> Friends<S>
where
    S: SocialStore + ProfileStore + RosterStore + ConversationStore + Send + Sync,
{
    pub fn new(store: Arc<S>, user: Uuid) -> Self {
        Self { store, user }
    }

    /// Send a friend request by username. Unknown names are `NotFound`;
    /// a pending or accepted pair in either direction is `Conflict` —
    /// surfaced to the user as "already requested".
    pub async fn request_by_username(&self, username: &str) -> Result<Friendship, FriendError> {
        let peer = self
            .store
            .profile_by_username(username.trim())
            .await
            .map_err(FriendError::Store)?
            .ok_or(FriendError::Store(StoreError::NotFound("user")))?;
        if peer.id == self.user {
            return Err(FriendError::SelfRequest);
        }

        let friendship = Friendship {
            id: Uuid::new_v4(),
            user_id: self.user,
            friend_id: peer.id,
            state: FriendshipState::Pending,
            created_at: Utc::now(),
        };
        self.store
            .insert_friendship(friendship.clone())
            .await
            .map_err(FriendError::Store)?;
        info!(peer = %peer.id, "friend request sent");
        Ok(friendship)
    }

    pub async fn accept(&self, friendship_id: Uuid) -> StoreResult<()> {
        self.store
            .set_friendship_state(friendship_id, FriendshipState::Accepted)
            .await
    }

    /// Rejecting a request and removing a friend are the same delete.
    pub async fn remove(&self, friendship_id: Uuid) -> StoreResult<()> {
        self.store.delete_friendship(friendship_id).await
    }

    /// All friendships joined with peer profiles, partitioned for display.
    /// Outgoing pending requests are neither incoming nor friends and stay
    /// out of both lists.
    pub async fn overview(&self) -> StoreResult<FriendOverview> {
        let friendships = self.store.friendships_of(self.user).await?;
        let peer_ids: Vec<Uuid> = friendships.iter().map(|f| f.peer_of(self.user)).collect();
        let profiles = self.store.profiles_by_ids(&peer_ids).await?;

        let mut overview = FriendOverview::default();
        for friendship in friendships {
            let peer_id = friendship.peer_of(self.user);
            let Some(profile) = profiles.iter().find(|p| p.id == peer_id) else {
                continue;
            };
            let entry = FriendEntry {
                friendship_id: friendship.id,
                peer_id,
                username: profile.username.clone(),
                status: profile.status,
                state: friendship.state,
                requested_by_me: friendship.user_id == self.user,
            };
            match friendship.state {
                FriendshipState::Accepted => overview.friends.push(entry),
                FriendshipState::Pending if !entry.requested_by_me => {
                    overview.incoming.push(entry)
                }
                FriendshipState::Pending => {}
            }
        }
        Ok(overview)
    }

    /// Accepted friends with unread DM counts, for the conversation list.
    pub async fn dm_conversations(&self) -> StoreResult<Vec<DmConversation>> {
        let overview = self.overview().await?;
        let rows = overview.friends.into_iter().map(|friend| async move {
            let unread = self.store.unread_count(self.user, friend.peer_id).await?;
            Ok::<_, StoreError>(DmConversation {
                peer_id: friend.peer_id,
                username: friend.username,
                unread,
            })
        });
        try_join_all(rows).await
    }
}
