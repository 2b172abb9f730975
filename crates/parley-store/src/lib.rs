//! Capability boundary between the synchronization core and whatever
//! platform provides persistence and change notification.
//!
//! The traits are split per concern so a component depends only on the
//! reads and writes it actually performs, and tests can double one concern
//! without touching the rest. `LocalStore` implements all of them over
//! SQLite and doubles as the reference backend for tests and the demo.

pub mod feed;
pub mod local;
mod migrations;

pub use feed::{ColumnFilter, Feed, FeedHub, FeedSignal, FeedSubscription, Interest};
pub use local::LocalStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use parley_types::StoreResult;
use parley_types::models::{
    Ban, Category, Channel, DirectMessage, Friendship, FriendshipState, Membership, Message,
    MessageTable, PinnedMessage, PresenceStatus, Profile, Reaction, RoleAssignment, Server,
};

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn profile(&self, user_id: Uuid) -> StoreResult<Option<Profile>>;
    async fn profile_by_username(&self, username: &str) -> StoreResult<Option<Profile>>;
    async fn upsert_profile(&self, profile: Profile) -> StoreResult<()>;
}

/// Reads the Conversation Synchronizer performs.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Full channel history, ordered by `(created_at, id)` ascending.
    async fn channel_messages(&self, channel_id: Uuid) -> StoreResult<Vec<Message>>;

    /// Both directions of a DM pair, same ordering. The pair is symmetric:
    /// swapping `a` and `b` returns the same rows.
    async fn direct_messages(&self, a: Uuid, b: Uuid) -> StoreResult<Vec<DirectMessage>>;

    /// Flip unread `sender -> receiver` rows to read. Returns how many
    /// rows were flipped.
    async fn mark_direct_read(&self, receiver: Uuid, sender: Uuid) -> StoreResult<u64>;

    /// Unread `sender -> receiver` rows, for conversation list badges.
    async fn unread_count(&self, receiver: Uuid, sender: Uuid) -> StoreResult<u64>;
}

/// Message, DM and pin mutations issued by user actions.
#[async_trait]
pub trait MessageOps: Send + Sync {
    async fn insert_message(&self, message: Message) -> StoreResult<()>;
    async fn edit_message(
        &self,
        id: Uuid,
        content: &str,
        edited_at: DateTime<Utc>,
    ) -> StoreResult<()>;
    async fn delete_message(&self, id: Uuid) -> StoreResult<()>;

    async fn insert_direct_message(&self, message: DirectMessage) -> StoreResult<()>;
    async fn edit_direct_message(
        &self,
        id: Uuid,
        content: &str,
        edited_at: DateTime<Utc>,
    ) -> StoreResult<()>;
    async fn delete_direct_message(&self, id: Uuid) -> StoreResult<()>;

    /// Pins for a channel, newest first.
    async fn pins(&self, channel_id: Uuid) -> StoreResult<Vec<PinnedMessage>>;
    async fn insert_pin(&self, pin: PinnedMessage) -> StoreResult<()>;
    async fn delete_pin(&self, id: Uuid) -> StoreResult<()>;
}

#[async_trait]
pub trait ReactionStore: Send + Sync {
    /// Flat reaction log for one message, in insertion order.
    async fn reactions_for(
        &self,
        message_id: Uuid,
        table: MessageTable,
    ) -> StoreResult<Vec<Reaction>>;

    /// Id of the viewer's existing row for this exact key, if any.
    /// Toggle is an existence check followed by insert-or-delete — never
    /// an upsert.
    async fn find_reaction(
        &self,
        message_id: Uuid,
        table: MessageTable,
        user_id: Uuid,
        emoji: &str,
    ) -> StoreResult<Option<Uuid>>;

    async fn insert_reaction(&self, reaction: Reaction) -> StoreResult<()>;
    async fn delete_reaction(&self, id: Uuid) -> StoreResult<()>;
}

/// The single write the presence tracker performs: an idempotent overwrite
/// of the local user's own status row.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn set_presence(
        &self,
        user_id: Uuid,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    ) -> StoreResult<()>;
}

/// Reads the Roster Synchronizer performs. The membership/profile join
/// happens client-side.
#[async_trait]
pub trait RosterStore: Send + Sync {
    async fn memberships(&self, server_id: Uuid) -> StoreResult<Vec<Membership>>;
    async fn profiles_by_ids(&self, ids: &[Uuid]) -> StoreResult<Vec<Profile>>;
}

/// Server / channel / category structure.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn servers(&self) -> StoreResult<Vec<Server>>;
    async fn server(&self, id: Uuid) -> StoreResult<Option<Server>>;
    async fn insert_server(&self, server: Server) -> StoreResult<()>;

    /// Channels of a server ordered by `(position, created_at)`.
    async fn channels(&self, server_id: Uuid) -> StoreResult<Vec<Channel>>;
    async fn categories(&self, server_id: Uuid) -> StoreResult<Vec<Category>>;
    async fn insert_channel(&self, channel: Channel) -> StoreResult<()>;
    async fn insert_category(&self, category: Category) -> StoreResult<()>;
    async fn set_channel_position(&self, id: Uuid, position: i64) -> StoreResult<()>;
    async fn set_category_position(&self, id: Uuid, position: i64) -> StoreResult<()>;
}

/// Membership, role, ban and friendship flows.
#[async_trait]
pub trait SocialStore: Send + Sync {
    async fn join_server(&self, membership: Membership) -> StoreResult<()>;
    async fn leave_server(&self, server_id: Uuid, user_id: Uuid) -> StoreResult<()>;

    async fn role_row(&self, server_id: Uuid, user_id: Uuid)
    -> StoreResult<Option<RoleAssignment>>;
    async fn assign_role(&self, assignment: RoleAssignment) -> StoreResult<()>;

    async fn bans(&self, server_id: Uuid) -> StoreResult<Vec<Ban>>;
    async fn insert_ban(&self, ban: Ban) -> StoreResult<()>;

    /// Friendships where the user is on either side.
    async fn friendships_of(&self, user_id: Uuid) -> StoreResult<Vec<Friendship>>;
    async fn insert_friendship(&self, friendship: Friendship) -> StoreResult<()>;
    async fn set_friendship_state(&self, id: Uuid, state: FriendshipState) -> StoreResult<()>;
    async fn delete_friendship(&self, id: Uuid) -> StoreResult<()>;
}

/// Everything a full client session needs from one backend handle.
pub trait ClientStore:
    ProfileStore
    + ConversationStore
    + MessageOps
    + ReactionStore
    + PresenceStore
    + RosterStore
    + DirectoryStore
    + SocialStore
    + Feed
{
}

impl<T> ClientStore for T where
    T: ProfileStore
        + ConversationStore
        + MessageOps
        + ReactionStore
        + PresenceStore
        + RosterStore
        + DirectoryStore
        + SocialStore
        + Feed
{
}
