use std::sync::Arc;

use uuid::Uuid;

use parley_store::ClientStore;
use parley_sync::presence::{PresenceConfig, PresenceTracker};
use parley_sync::{ConversationSync, ReactionSync, Reactions, RosterSync};
use parley_types::models::Profile;
use parley_types::{StoreError, StoreResult};

use crate::directory::Directory;
use crate::friends::Friends;
use crate::messages::Messages;

/// An authenticated client session. Everything store-backed hangs off it;
/// without a profile row there is no session and every action is refused
/// up front.
pub struct Session<S> {
    store: Arc<S>,
    user: Profile,
}

impl<S> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("user", &self.user).finish()
    }
}

impl<S> Session<S>
where
    S: ClientStore + 'static,
{
    /// Resolve the local user's profile. `NotAuthenticated` when the store
    /// has no row for them.
    pub async fn sign_in(store: Arc<S>, user_id: Uuid) -> StoreResult<Self> {
        let user = store
            .profile(user_id)
            .await?
            .ok_or(StoreError::NotAuthenticated)?;
        Ok(Self { store, user })
    }

    pub fn user(&self) -> &Profile {
        &self.user
    }

    pub fn user_id(&self) -> Uuid {
        self.user.id
    }

    /// The conversation view factory. One per session: opening a new scope
    /// supersedes the previous view.
    pub fn conversations(&self) -> ConversationSync<S> {
        ConversationSync::new(self.store.clone(), self.user.id)
    }

    pub fn reactions(&self) -> Reactions<S> {
        Reactions::new(self.store.clone(), self.user.id)
    }

    pub fn reaction_views(&self) -> ReactionSync<S> {
        ReactionSync::new(self.store.clone(), self.user.id)
    }

    pub fn rosters(&self) -> RosterSync<S> {
        RosterSync::new(self.store.clone())
    }

    pub fn messages(&self) -> Messages<S> {
        Messages::new(self.store.clone(), self.user.id)
    }

    pub fn directory(&self) -> Directory<S> {
        Directory::new(self.store.clone(), self.user.id)
    }

    pub fn friends(&self) -> Friends<S> {
        Friends::new(self.store.clone(), self.user.id)
    }

    /// Start tracking the local user's presence. Held by the caller for
    /// the session's lifetime; `shutdown().await` on teardown writes the
    /// final `offline`.
    pub async fn start_presence(&self, config: PresenceConfig) -> PresenceTracker<S> {
        PresenceTracker::start(self.store.clone(), self.user.id, config).await
    }
}
