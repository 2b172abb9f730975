use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::info;
use uuid::Uuid;

use parley_types::events::{ChangeEvent, ChangeOp, RowChange};
use parley_types::models::{
    Ban, Category, Channel, DirectMessage, Friendship, FriendshipState, Membership, Message,
    MessageTable, PinnedMessage, PresenceStatus, Profile, Reaction, RoleAssignment, Server,
};
use parley_types::{StoreError, StoreResult};

use crate::feed::{Feed, FeedHub, FeedSubscription, Interest};
use crate::migrations;
use crate::{
    ConversationStore, DirectoryStore, MessageOps, PresenceStore, ProfileStore, ReactionStore,
    RosterStore, SocialStore,
};

/// SQLite-backed reference backend. Stands in for the managed platform:
/// every successful mutation is followed by a change event on the hub, the
/// same way the platform's replication feed would report it.
pub struct LocalStore {
    conn: Mutex<Connection>,
    feed: FeedHub,
}

impl LocalStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run(&conn)?;

        info!("local store opened at {}", path.display());
        Ok(Self { conn: Mutex::new(conn), feed: FeedHub::new() })
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run(&conn)?;
        Ok(Self { conn: Mutex::new(conn), feed: FeedHub::new() })
    }

    pub fn feed(&self) -> FeedHub {
        self.feed.clone()
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> StoreResult<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Transient(anyhow::anyhow!("connection lock poisoned: {e}")))?;
        f(&conn).map_err(map_sqlite_err)
    }

    fn publish(&self, op: ChangeOp, row: RowChange) {
        self.feed.publish(ChangeEvent::new(op, row));
    }
}

impl Feed for LocalStore {
    fn subscribe(&self, interest: Interest) -> FeedSubscription {
        self.feed.subscribe(interest)
    }
}

fn map_sqlite_err(e: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &e {
        if failure.code == rusqlite::ErrorCode::ConstraintViolation {
            return StoreError::Conflict;
        }
    }
    StoreError::Transient(anyhow::Error::new(e))
}

// -- Column helpers --
//
// Every id and timestamp is stored as TEXT; a row that fails to parse is a
// corrupt store and surfaces as a conversion error rather than a default.

fn conv_err(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| conv_err(idx, e))
}

fn uuid_opt_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(s) => s.parse().map(Some).map_err(|e| conv_err(idx, e)),
        None => Ok(None),
    }
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conv_err(idx, e))
}

fn time_opt_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| conv_err(idx, e)),
        None => Ok(None),
    }
}

fn enum_col<T: std::str::FromStr>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    s.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unrecognized value '{s}'").into(),
        )
    })
}

fn opt_time(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(|t| t.to_rfc3339())
}

// -- Row mappers --

fn map_profile(row: &Row<'_>) -> rusqlite::Result<Profile> {
    Ok(Profile {
        id: uuid_col(row, 0)?,
        username: row.get(1)?,
        avatar_url: row.get(2)?,
        status: enum_col(row, 3)?,
        last_seen: time_opt_col(row, 4)?,
        created_at: time_col(row, 5)?,
    })
}

fn map_server(row: &Row<'_>) -> rusqlite::Result<Server> {
    Ok(Server {
        id: uuid_col(row, 0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        icon: row.get(3)?,
        is_private: row.get(4)?,
        owner_id: uuid_col(row, 5)?,
        created_at: time_col(row, 6)?,
    })
}

fn map_category(row: &Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category {
        id: uuid_col(row, 0)?,
        server_id: uuid_col(row, 1)?,
        name: row.get(2)?,
        position: row.get(3)?,
        created_at: time_col(row, 4)?,
    })
}

fn map_channel(row: &Row<'_>) -> rusqlite::Result<Channel> {
    Ok(Channel {
        id: uuid_col(row, 0)?,
        server_id: uuid_col(row, 1)?,
        category_id: uuid_opt_col(row, 2)?,
        name: row.get(3)?,
        kind: enum_col(row, 4)?,
        position: row.get(5)?,
        created_at: time_col(row, 6)?,
    })
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: uuid_col(row, 0)?,
        channel_id: uuid_col(row, 1)?,
        author_id: uuid_col(row, 2)?,
        content: row.get(3)?,
        media_url: row.get(4)?,
        created_at: time_col(row, 5)?,
        edited_at: time_opt_col(row, 6)?,
    })
}

fn map_direct_message(row: &Row<'_>) -> rusqlite::Result<DirectMessage> {
    Ok(DirectMessage {
        id: uuid_col(row, 0)?,
        sender_id: uuid_col(row, 1)?,
        receiver_id: uuid_col(row, 2)?,
        content: row.get(3)?,
        media_url: row.get(4)?,
        read: row.get(5)?,
        created_at: time_col(row, 6)?,
        edited_at: time_opt_col(row, 7)?,
    })
}

fn map_reaction(row: &Row<'_>) -> rusqlite::Result<Reaction> {
    Ok(Reaction {
        id: uuid_col(row, 0)?,
        message_id: uuid_col(row, 1)?,
        table: enum_col(row, 2)?,
        user_id: uuid_col(row, 3)?,
        emoji: row.get(4)?,
        created_at: time_col(row, 5)?,
    })
}

fn map_membership(row: &Row<'_>) -> rusqlite::Result<Membership> {
    Ok(Membership {
        id: uuid_col(row, 0)?,
        server_id: uuid_col(row, 1)?,
        user_id: uuid_col(row, 2)?,
        joined_at: time_col(row, 3)?,
    })
}

fn map_role(row: &Row<'_>) -> rusqlite::Result<RoleAssignment> {
    Ok(RoleAssignment {
        id: uuid_col(row, 0)?,
        server_id: uuid_col(row, 1)?,
        user_id: uuid_col(row, 2)?,
        role: enum_col(row, 3)?,
        created_at: time_col(row, 4)?,
    })
}

fn map_ban(row: &Row<'_>) -> rusqlite::Result<Ban> {
    Ok(Ban {
        id: uuid_col(row, 0)?,
        server_id: uuid_col(row, 1)?,
        user_id: uuid_col(row, 2)?,
        banned_by: uuid_col(row, 3)?,
        reason: row.get(4)?,
        created_at: time_col(row, 5)?,
    })
}

fn map_pin(row: &Row<'_>) -> rusqlite::Result<PinnedMessage> {
    Ok(PinnedMessage {
        id: uuid_col(row, 0)?,
        channel_id: uuid_col(row, 1)?,
        message_id: uuid_col(row, 2)?,
        pinned_by: uuid_col(row, 3)?,
        pinned_at: time_col(row, 4)?,
    })
}

fn map_friendship(row: &Row<'_>) -> rusqlite::Result<Friendship> {
    Ok(Friendship {
        id: uuid_col(row, 0)?,
        user_id: uuid_col(row, 1)?,
        friend_id: uuid_col(row, 2)?,
        state: enum_col(row, 3)?,
        created_at: time_col(row, 4)?,
    })
}

// -- Single-row lookups used to publish full payloads after writes --

fn query_profile(conn: &Connection, id: Uuid) -> rusqlite::Result<Option<Profile>> {
    conn.query_row(
        "SELECT id, username, avatar_url, status, last_seen, created_at
         FROM profiles WHERE id = ?1",
        [id.to_string()],
        map_profile,
    )
    .optional()
}

fn query_message(conn: &Connection, id: Uuid) -> rusqlite::Result<Option<Message>> {
    conn.query_row(
        "SELECT id, channel_id, author_id, content, media_url, created_at, edited_at
         FROM messages WHERE id = ?1",
        [id.to_string()],
        map_message,
    )
    .optional()
}

fn query_direct_message(conn: &Connection, id: Uuid) -> rusqlite::Result<Option<DirectMessage>> {
    conn.query_row(
        "SELECT id, sender_id, receiver_id, content, media_url, read, created_at, edited_at
         FROM direct_messages WHERE id = ?1",
        [id.to_string()],
        map_direct_message,
    )
    .optional()
}

fn query_channel(conn: &Connection, id: Uuid) -> rusqlite::Result<Option<Channel>> {
    conn.query_row(
        "SELECT id, server_id, category_id, name, kind, position, created_at
         FROM channels WHERE id = ?1",
        [id.to_string()],
        map_channel,
    )
    .optional()
}

fn query_category(conn: &Connection, id: Uuid) -> rusqlite::Result<Option<Category>> {
    conn.query_row(
        "SELECT id, server_id, name, position, created_at
         FROM channel_categories WHERE id = ?1",
        [id.to_string()],
        map_category,
    )
    .optional()
}

fn query_friendship(conn: &Connection, id: Uuid) -> rusqlite::Result<Option<Friendship>> {
    conn.query_row(
        "SELECT id, user_id, friend_id, state, created_at
         FROM friendships WHERE id = ?1",
        [id.to_string()],
        map_friendship,
    )
    .optional()
}

#[async_trait]
impl ProfileStore for LocalStore {
    async fn profile(&self, user_id: Uuid) -> StoreResult<Option<Profile>> {
        self.with_conn(|conn| query_profile(conn, user_id))
    }

    async fn profile_by_username(&self, username: &str) -> StoreResult<Option<Profile>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, username, avatar_url, status, last_seen, created_at
                 FROM profiles WHERE username = ?1",
                [username],
                map_profile,
            )
            .optional()
        })
    }

    async fn upsert_profile(&self, profile: Profile) -> StoreResult<()> {
        let existed = self.with_conn(|conn| {
            let existed = query_profile(conn, profile.id)?.is_some();
            conn.execute(
                "INSERT INTO profiles (id, username, avatar_url, status, last_seen, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                     username = excluded.username,
                     avatar_url = excluded.avatar_url,
                     status = excluded.status,
                     last_seen = excluded.last_seen",
                params![
                    profile.id.to_string(),
                    profile.username,
                    profile.avatar_url,
                    profile.status.as_str(),
                    opt_time(profile.last_seen),
                    profile.created_at.to_rfc3339(),
                ],
            )?;
            Ok(existed)
        })?;
        let op = if existed { ChangeOp::Update } else { ChangeOp::Insert };
        self.publish(op, RowChange::Profile(profile));
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for LocalStore {
    async fn channel_messages(&self, channel_id: Uuid) -> StoreResult<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, channel_id, author_id, content, media_url, created_at, edited_at
                 FROM messages
                 WHERE channel_id = ?1
                 ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt
                .query_map([channel_id.to_string()], map_message)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    async fn direct_messages(&self, a: Uuid, b: Uuid) -> StoreResult<Vec<DirectMessage>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sender_id, receiver_id, content, media_url, read, created_at, edited_at
                 FROM direct_messages
                 WHERE (sender_id = ?1 AND receiver_id = ?2)
                    OR (sender_id = ?2 AND receiver_id = ?1)
                 ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt
                .query_map(params![a.to_string(), b.to_string()], map_direct_message)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    async fn mark_direct_read(&self, receiver: Uuid, sender: Uuid) -> StoreResult<u64> {
        let flipped = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sender_id, receiver_id, content, media_url, read, created_at, edited_at
                 FROM direct_messages
                 WHERE receiver_id = ?1 AND sender_id = ?2 AND read = 0",
            )?;
            let rows = stmt
                .query_map(
                    params![receiver.to_string(), sender.to_string()],
                    map_direct_message,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            if !rows.is_empty() {
                conn.execute(
                    "UPDATE direct_messages SET read = 1
                     WHERE receiver_id = ?1 AND sender_id = ?2 AND read = 0",
                    params![receiver.to_string(), sender.to_string()],
                )?;
            }
            Ok(rows)
        })?;

        let count = flipped.len() as u64;
        for mut dm in flipped {
            dm.read = true;
            self.publish(ChangeOp::Update, RowChange::DirectMessage(dm));
        }
        Ok(count)
    }

    async fn unread_count(&self, receiver: Uuid, sender: Uuid) -> StoreResult<u64> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM direct_messages
                 WHERE receiver_id = ?1 AND sender_id = ?2 AND read = 0",
                params![receiver.to_string(), sender.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n as u64)
        })
    }
}

#[async_trait]
impl MessageOps for LocalStore {
    async fn insert_message(&self, message: Message) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, channel_id, author_id, content, media_url, created_at, edited_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    message.id.to_string(),
                    message.channel_id.to_string(),
                    message.author_id.to_string(),
                    message.content,
                    message.media_url,
                    message.created_at.to_rfc3339(),
                    opt_time(message.edited_at),
                ],
            )?;
            Ok(())
        })?;
        self.publish(ChangeOp::Insert, RowChange::Message(message));
        Ok(())
    }

    async fn edit_message(
        &self,
        id: Uuid,
        content: &str,
        edited_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let updated = self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE messages SET content = ?2, edited_at = ?3 WHERE id = ?1",
                params![id.to_string(), content, edited_at.to_rfc3339()],
            )?;
            if n == 0 { Ok(None) } else { query_message(conn, id) }
        })?;
        let message = updated.ok_or(StoreError::NotFound("message"))?;
        self.publish(ChangeOp::Update, RowChange::Message(message));
        Ok(())
    }

    async fn delete_message(&self, id: Uuid) -> StoreResult<()> {
        let deleted = self.with_conn(|conn| {
            let Some(row) = query_message(conn, id)? else {
                return Ok(None);
            };
            conn.execute("DELETE FROM messages WHERE id = ?1", [id.to_string()])?;
            Ok(Some(row))
        })?;
        let message = deleted.ok_or(StoreError::NotFound("message"))?;
        self.publish(ChangeOp::Delete, RowChange::Message(message));
        Ok(())
    }

    async fn insert_direct_message(&self, message: DirectMessage) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO direct_messages
                     (id, sender_id, receiver_id, content, media_url, read, created_at, edited_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    message.id.to_string(),
                    message.sender_id.to_string(),
                    message.receiver_id.to_string(),
                    message.content,
                    message.media_url,
                    message.read,
                    message.created_at.to_rfc3339(),
                    opt_time(message.edited_at),
                ],
            )?;
            Ok(())
        })?;
        self.publish(ChangeOp::Insert, RowChange::DirectMessage(message));
        Ok(())
    }

    async fn edit_direct_message(
        &self,
        id: Uuid,
        content: &str,
        edited_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let updated = self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE direct_messages SET content = ?2, edited_at = ?3 WHERE id = ?1",
                params![id.to_string(), content, edited_at.to_rfc3339()],
            )?;
            if n == 0 { Ok(None) } else { query_direct_message(conn, id) }
        })?;
        let message = updated.ok_or(StoreError::NotFound("message"))?;
        self.publish(ChangeOp::Update, RowChange::DirectMessage(message));
        Ok(())
    }

    async fn delete_direct_message(&self, id: Uuid) -> StoreResult<()> {
        let deleted = self.with_conn(|conn| {
            let Some(row) = query_direct_message(conn, id)? else {
                return Ok(None);
            };
            conn.execute("DELETE FROM direct_messages WHERE id = ?1", [id.to_string()])?;
            Ok(Some(row))
        })?;
        let message = deleted.ok_or(StoreError::NotFound("message"))?;
        self.publish(ChangeOp::Delete, RowChange::DirectMessage(message));
        Ok(())
    }

    async fn pins(&self, channel_id: Uuid) -> StoreResult<Vec<PinnedMessage>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, channel_id, message_id, pinned_by, pinned_at
                 FROM pinned_messages
                 WHERE channel_id = ?1
                 ORDER BY pinned_at DESC, id ASC",
            )?;
            let rows = stmt
                .query_map([channel_id.to_string()], map_pin)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    async fn insert_pin(&self, pin: PinnedMessage) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pinned_messages (id, channel_id, message_id, pinned_by, pinned_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    pin.id.to_string(),
                    pin.channel_id.to_string(),
                    pin.message_id.to_string(),
                    pin.pinned_by.to_string(),
                    pin.pinned_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        self.publish(ChangeOp::Insert, RowChange::Pin(pin));
        Ok(())
    }

    async fn delete_pin(&self, id: Uuid) -> StoreResult<()> {
        let deleted = self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, channel_id, message_id, pinned_by, pinned_at
                     FROM pinned_messages WHERE id = ?1",
                    [id.to_string()],
                    map_pin,
                )
                .optional()?;
            let Some(row) = row else {
                return Ok(None);
            };
            conn.execute("DELETE FROM pinned_messages WHERE id = ?1", [id.to_string()])?;
            Ok(Some(row))
        })?;
        let pin = deleted.ok_or(StoreError::NotFound("pin"))?;
        self.publish(ChangeOp::Delete, RowChange::Pin(pin));
        Ok(())
    }
}

#[async_trait]
impl ReactionStore for LocalStore {
    async fn reactions_for(
        &self,
        message_id: Uuid,
        table: MessageTable,
    ) -> StoreResult<Vec<Reaction>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, message_id, message_table, user_id, emoji, created_at
                 FROM message_reactions
                 WHERE message_id = ?1 AND message_table = ?2
                 ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt
                .query_map(params![message_id.to_string(), table.as_str()], map_reaction)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    async fn find_reaction(
        &self,
        message_id: Uuid,
        table: MessageTable,
        user_id: Uuid,
        emoji: &str,
    ) -> StoreResult<Option<Uuid>> {
        self.with_conn(|conn| {
            let id = conn
                .query_row(
                    "SELECT id FROM message_reactions
                     WHERE message_id = ?1 AND message_table = ?2 AND user_id = ?3 AND emoji = ?4",
                    params![message_id.to_string(), table.as_str(), user_id.to_string(), emoji],
                    |row| uuid_col(row, 0),
                )
                .optional()?;
            Ok(id)
        })
    }

    async fn insert_reaction(&self, reaction: Reaction) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO message_reactions
                     (id, message_id, message_table, user_id, emoji, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    reaction.id.to_string(),
                    reaction.message_id.to_string(),
                    reaction.table.as_str(),
                    reaction.user_id.to_string(),
                    reaction.emoji,
                    reaction.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        self.publish(ChangeOp::Insert, RowChange::Reaction(reaction));
        Ok(())
    }

    async fn delete_reaction(&self, id: Uuid) -> StoreResult<()> {
        let deleted = self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, message_id, message_table, user_id, emoji, created_at
                     FROM message_reactions WHERE id = ?1",
                    [id.to_string()],
                    map_reaction,
                )
                .optional()?;
            let Some(row) = row else {
                return Ok(None);
            };
            conn.execute("DELETE FROM message_reactions WHERE id = ?1", [id.to_string()])?;
            Ok(Some(row))
        })?;
        let reaction = deleted.ok_or(StoreError::NotFound("reaction"))?;
        self.publish(ChangeOp::Delete, RowChange::Reaction(reaction));
        Ok(())
    }
}

#[async_trait]
impl PresenceStore for LocalStore {
    async fn set_presence(
        &self,
        user_id: Uuid,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    ) -> StoreResult<()> {
        let updated = self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE profiles SET status = ?2, last_seen = ?3 WHERE id = ?1",
                params![user_id.to_string(), status.as_str(), last_seen.to_rfc3339()],
            )?;
            if n == 0 { Ok(None) } else { query_profile(conn, user_id) }
        })?;
        let profile = updated.ok_or(StoreError::NotFound("profile"))?;
        self.publish(ChangeOp::Update, RowChange::Profile(profile));
        Ok(())
    }
}

#[async_trait]
impl RosterStore for LocalStore {
    async fn memberships(&self, server_id: Uuid) -> StoreResult<Vec<Membership>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, server_id, user_id, joined_at
                 FROM server_members
                 WHERE server_id = ?1
                 ORDER BY joined_at ASC, id ASC",
            )?;
            let rows = stmt
                .query_map([server_id.to_string()], map_membership)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    async fn profiles_by_ids(&self, ids: &[Uuid]) -> StoreResult<Vec<Profile>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        self.with_conn(|conn| {
            let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
            let sql = format!(
                "SELECT id, username, avatar_url, status, last_seen, created_at
                 FROM profiles WHERE id IN ({})",
                placeholders.join(", ")
            );
            let id_strings: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
            let params: Vec<&dyn rusqlite::types::ToSql> =
                id_strings.iter().map(|id| id as &dyn rusqlite::types::ToSql).collect();

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params.as_slice(), map_profile)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

#[async_trait]
impl DirectoryStore for LocalStore {
    async fn servers(&self) -> StoreResult<Vec<Server>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, description, icon, is_private, owner_id, created_at
                 FROM servers ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt.query_map([], map_server)?.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    async fn server(&self, id: Uuid) -> StoreResult<Option<Server>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name, description, icon, is_private, owner_id, created_at
                 FROM servers WHERE id = ?1",
                [id.to_string()],
                map_server,
            )
            .optional()
        })
    }

    async fn insert_server(&self, server: Server) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO servers (id, name, description, icon, is_private, owner_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    server.id.to_string(),
                    server.name,
                    server.description,
                    server.icon,
                    server.is_private,
                    server.owner_id.to_string(),
                    server.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        self.publish(ChangeOp::Insert, RowChange::Server(server));
        Ok(())
    }

    async fn channels(&self, server_id: Uuid) -> StoreResult<Vec<Channel>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, server_id, category_id, name, kind, position, created_at
                 FROM channels
                 WHERE server_id = ?1
                 ORDER BY position ASC, created_at ASC, id ASC",
            )?;
            let rows = stmt
                .query_map([server_id.to_string()], map_channel)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    async fn categories(&self, server_id: Uuid) -> StoreResult<Vec<Category>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, server_id, name, position, created_at
                 FROM channel_categories
                 WHERE server_id = ?1
                 ORDER BY position ASC, created_at ASC, id ASC",
            )?;
            let rows = stmt
                .query_map([server_id.to_string()], map_category)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    async fn insert_channel(&self, channel: Channel) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO channels (id, server_id, category_id, name, kind, position, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    channel.id.to_string(),
                    channel.server_id.to_string(),
                    channel.category_id.map(|id| id.to_string()),
                    channel.name,
                    channel.kind.as_str(),
                    channel.position,
                    channel.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        self.publish(ChangeOp::Insert, RowChange::Channel(channel));
        Ok(())
    }

    async fn insert_category(&self, category: Category) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO channel_categories (id, server_id, name, position, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    category.id.to_string(),
                    category.server_id.to_string(),
                    category.name,
                    category.position,
                    category.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        self.publish(ChangeOp::Insert, RowChange::Category(category));
        Ok(())
    }

    async fn set_channel_position(&self, id: Uuid, position: i64) -> StoreResult<()> {
        let updated = self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE channels SET position = ?2 WHERE id = ?1",
                params![id.to_string(), position],
            )?;
            if n == 0 { Ok(None) } else { query_channel(conn, id) }
        })?;
        let channel = updated.ok_or(StoreError::NotFound("channel"))?;
        self.publish(ChangeOp::Update, RowChange::Channel(channel));
        Ok(())
    }

    async fn set_category_position(&self, id: Uuid, position: i64) -> StoreResult<()> {
        let updated = self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE channel_categories SET position = ?2 WHERE id = ?1",
                params![id.to_string(), position],
            )?;
            if n == 0 { Ok(None) } else { query_category(conn, id) }
        })?;
        let category = updated.ok_or(StoreError::NotFound("category"))?;
        self.publish(ChangeOp::Update, RowChange::Category(category));
        Ok(())
    }
}

#[async_trait]
impl SocialStore for LocalStore {
    async fn join_server(&self, membership: Membership) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO server_members (id, server_id, user_id, joined_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    membership.id.to_string(),
                    membership.server_id.to_string(),
                    membership.user_id.to_string(),
                    membership.joined_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        self.publish(ChangeOp::Insert, RowChange::Membership(membership));
        Ok(())
    }

    async fn leave_server(&self, server_id: Uuid, user_id: Uuid) -> StoreResult<()> {
        let deleted = self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, server_id, user_id, joined_at
                     FROM server_members WHERE server_id = ?1 AND user_id = ?2",
                    params![server_id.to_string(), user_id.to_string()],
                    map_membership,
                )
                .optional()?;
            let Some(row) = row else {
                return Ok(None);
            };
            conn.execute(
                "DELETE FROM server_members WHERE id = ?1",
                [row.id.to_string()],
            )?;
            Ok(Some(row))
        })?;
        let membership = deleted.ok_or(StoreError::NotFound("membership"))?;
        self.publish(ChangeOp::Delete, RowChange::Membership(membership));
        Ok(())
    }

    async fn role_row(
        &self,
        server_id: Uuid,
        user_id: Uuid,
    ) -> StoreResult<Option<RoleAssignment>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, server_id, user_id, role, created_at
                 FROM server_member_roles WHERE server_id = ?1 AND user_id = ?2",
                params![server_id.to_string(), user_id.to_string()],
                map_role,
            )
            .optional()
        })
    }

    async fn assign_role(&self, assignment: RoleAssignment) -> StoreResult<()> {
        let existed = self.with_conn(|conn| {
            let existed: Option<String> = conn
                .query_row(
                    "SELECT id FROM server_member_roles WHERE server_id = ?1 AND user_id = ?2",
                    params![assignment.server_id.to_string(), assignment.user_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            conn.execute(
                "INSERT INTO server_member_roles (id, server_id, user_id, role, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(server_id, user_id) DO UPDATE SET role = excluded.role",
                params![
                    assignment.id.to_string(),
                    assignment.server_id.to_string(),
                    assignment.user_id.to_string(),
                    assignment.role.as_str(),
                    assignment.created_at.to_rfc3339(),
                ],
            )?;
            Ok(existed.is_some())
        })?;
        let op = if existed { ChangeOp::Update } else { ChangeOp::Insert };
        self.publish(op, RowChange::Role(assignment));
        Ok(())
    }

    async fn bans(&self, server_id: Uuid) -> StoreResult<Vec<Ban>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, server_id, user_id, banned_by, reason, created_at
                 FROM server_bans WHERE server_id = ?1
                 ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt
                .query_map([server_id.to_string()], map_ban)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    async fn insert_ban(&self, ban: Ban) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO server_bans (id, server_id, user_id, banned_by, reason, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    ban.id.to_string(),
                    ban.server_id.to_string(),
                    ban.user_id.to_string(),
                    ban.banned_by.to_string(),
                    ban.reason,
                    ban.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        self.publish(ChangeOp::Insert, RowChange::Ban(ban));
        Ok(())
    }

    async fn friendships_of(&self, user_id: Uuid) -> StoreResult<Vec<Friendship>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, friend_id, state, created_at
                 FROM friendships
                 WHERE user_id = ?1 OR friend_id = ?1
                 ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt
                .query_map([user_id.to_string()], map_friendship)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    async fn insert_friendship(&self, friendship: Friendship) -> StoreResult<()> {
        // The pair is unique regardless of direction; the UNIQUE constraint
        // only covers one, so the reverse direction is checked explicitly.
        let reverse_exists = self.with_conn(|conn| {
            let id: Option<String> = conn
                .query_row(
                    "SELECT id FROM friendships WHERE user_id = ?1 AND friend_id = ?2",
                    params![friendship.friend_id.to_string(), friendship.user_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(id.is_some())
        })?;
        if reverse_exists {
            return Err(StoreError::Conflict);
        }

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO friendships (id, user_id, friend_id, state, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    friendship.id.to_string(),
                    friendship.user_id.to_string(),
                    friendship.friend_id.to_string(),
                    friendship.state.as_str(),
                    friendship.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        self.publish(ChangeOp::Insert, RowChange::Friendship(friendship));
        Ok(())
    }

    async fn set_friendship_state(&self, id: Uuid, state: FriendshipState) -> StoreResult<()> {
        let updated = self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE friendships SET state = ?2 WHERE id = ?1",
                params![id.to_string(), state.as_str()],
            )?;
            if n == 0 { Ok(None) } else { query_friendship(conn, id) }
        })?;
        let friendship = updated.ok_or(StoreError::NotFound("friendship"))?;
        self.publish(ChangeOp::Update, RowChange::Friendship(friendship));
        Ok(())
    }

    async fn delete_friendship(&self, id: Uuid) -> StoreResult<()> {
        let deleted = self.with_conn(|conn| {
            let Some(row) = query_friendship(conn, id)? else {
                return Ok(None);
            };
            conn.execute("DELETE FROM friendships WHERE id = ?1", [id.to_string()])?;
            Ok(Some(row))
        })?;
        let friendship = deleted.ok_or(StoreError::NotFound("friendship"))?;
        self.publish(ChangeOp::Delete, RowChange::Friendship(friendship));
        Ok(())
    }
}
