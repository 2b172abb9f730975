use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A user's presence state as stored on their profile row.
///
/// `Online`, `Idle` and `Offline` are driven by the automatic presence
/// tracker; `Dnd` is a manual override and never entered automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Idle,
    Dnd,
    #[default]
    Offline,
}

impl PresenceStatus {
    /// Whether this status belongs in the "online" roster section.
    /// `dnd` counts — the user is present, just not to be disturbed.
    pub fn is_online_like(self) -> bool {
        matches!(self, Self::Online | Self::Idle | Self::Dnd)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Idle => "idle",
            Self::Dnd => "dnd",
            Self::Offline => "offline",
        }
    }
}

impl std::str::FromStr for PresenceStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "online" => Ok(Self::Online),
            "idle" => Ok(Self::Idle),
            "dnd" => Ok(Self::Dnd),
            "offline" => Ok(Self::Offline),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub username: String,
    pub avatar_url: Option<String>,
    pub status: PresenceStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub is_private: bool,
    pub owner_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: Uuid,
    pub server_id: Uuid,
    pub name: String,
    pub position: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    #[default]
    Text,
    Voice,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Voice => "voice",
        }
    }
}

impl std::str::FromStr for ChannelKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "text" => Ok(Self::Text),
            "voice" => Ok(Self::Voice),
            _ => Err(()),
        }
    }
}

/// A channel belongs to a server and optionally to a category within it.
/// `position` orders channels inside their sibling group (root list or
/// category); sibling positions stay dense from 0 after any reorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: Uuid,
    pub server_id: Uuid,
    pub category_id: Option<Uuid>,
    pub name: String,
    pub kind: ChannelKind,
    pub position: i64,
    pub created_at: DateTime<Utc>,
}

/// A message posted to a server channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub author_id: Uuid,
    pub content: String,
    pub media_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
}

/// A message between two users. The `read` flag is owned by the receiver's
/// client: it is flipped when the receiver opens the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectMessage {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    pub content: String,
    pub media_url: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
}

/// Which message table a reaction or pin target lives in. Reactions share
/// one table across channel messages and DMs, disambiguated by this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageTable {
    Messages,
    DirectMessages,
}

impl MessageTable {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::DirectMessages => "direct_messages",
        }
    }
}

impl std::str::FromStr for MessageTable {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "messages" => Ok(Self::Messages),
            "direct_messages" => Ok(Self::DirectMessages),
            _ => Err(()),
        }
    }
}

/// One user's emoji reaction to one message.
/// Unique per (message_id, table, user_id, emoji); repeated toggles
/// alternate between this row existing and not existing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    pub id: Uuid,
    pub message_id: Uuid,
    pub table: MessageTable,
    pub user_id: Uuid,
    pub emoji: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub id: Uuid,
    pub server_id: Uuid,
    pub user_id: Uuid,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    Member,
    Moderator,
    Admin,
    /// Derived from `Server::owner_id`, never stored as a role row.
    Owner,
}

impl ServerRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Moderator => "moderator",
            Self::Admin => "admin",
            Self::Owner => "owner",
        }
    }
}

impl std::str::FromStr for ServerRole {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "member" => Ok(Self::Member),
            "moderator" => Ok(Self::Moderator),
            "admin" => Ok(Self::Admin),
            "owner" => Ok(Self::Owner),
            _ => Err(()),
        }
    }
}

/// An explicit role grant. Owner is never written here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub id: Uuid,
    pub server_id: Uuid,
    pub user_id: Uuid,
    pub role: ServerRole,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ban {
    pub id: Uuid,
    pub server_id: Uuid,
    pub user_id: Uuid,
    pub banned_by: Uuid,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A pin is a reference to a message, not a copy. The referenced message
/// may be deleted afterwards; rendering handles that as a placeholder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinnedMessage {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub message_id: Uuid,
    pub pinned_by: Uuid,
    pub pinned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FriendshipState {
    Pending,
    Accepted,
}

impl FriendshipState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
        }
    }
}

impl std::str::FromStr for FriendshipState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            _ => Err(()),
        }
    }
}

/// A friend request / friendship. `user_id` is the requester; the pair is
/// unique regardless of direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Friendship {
    pub id: Uuid,
    pub user_id: Uuid,
    pub friend_id: Uuid,
    pub state: FriendshipState,
    pub created_at: DateTime<Utc>,
}

impl Friendship {
    /// The other side of the friendship, from `me`'s point of view.
    pub fn peer_of(&self, me: Uuid) -> Uuid {
        if self.user_id == me { self.friend_id } else { self.user_id }
    }
}
