use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS profiles (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            avatar_url  TEXT,
            status      TEXT NOT NULL DEFAULT 'offline',
            last_seen   TEXT,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS servers (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            description TEXT,
            icon        TEXT,
            is_private  INTEGER NOT NULL DEFAULT 0,
            owner_id    TEXT NOT NULL REFERENCES profiles(id),
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS channel_categories (
            id          TEXT PRIMARY KEY,
            server_id   TEXT NOT NULL REFERENCES servers(id),
            name        TEXT NOT NULL,
            position    INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS channels (
            id          TEXT PRIMARY KEY,
            server_id   TEXT NOT NULL REFERENCES servers(id),
            category_id TEXT REFERENCES channel_categories(id),
            name        TEXT NOT NULL,
            kind        TEXT NOT NULL DEFAULT 'text',
            position    INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id          TEXT PRIMARY KEY,
            channel_id  TEXT NOT NULL REFERENCES channels(id),
            author_id   TEXT NOT NULL REFERENCES profiles(id),
            content     TEXT NOT NULL,
            media_url   TEXT,
            created_at  TEXT NOT NULL,
            edited_at   TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_messages_channel
            ON messages(channel_id, created_at);

        CREATE TABLE IF NOT EXISTS direct_messages (
            id          TEXT PRIMARY KEY,
            sender_id   TEXT NOT NULL REFERENCES profiles(id),
            receiver_id TEXT NOT NULL REFERENCES profiles(id),
            content     TEXT NOT NULL,
            media_url   TEXT,
            read        INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL,
            edited_at   TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_direct_messages_pair
            ON direct_messages(sender_id, receiver_id, created_at);

        CREATE TABLE IF NOT EXISTS message_reactions (
            id            TEXT PRIMARY KEY,
            message_id    TEXT NOT NULL,
            message_table TEXT NOT NULL DEFAULT 'messages',
            user_id       TEXT NOT NULL REFERENCES profiles(id),
            emoji         TEXT NOT NULL,
            created_at    TEXT NOT NULL,
            UNIQUE(message_id, message_table, user_id, emoji)
        );

        CREATE INDEX IF NOT EXISTS idx_reactions_message
            ON message_reactions(message_id, message_table);

        CREATE TABLE IF NOT EXISTS server_members (
            id          TEXT PRIMARY KEY,
            server_id   TEXT NOT NULL REFERENCES servers(id),
            user_id     TEXT NOT NULL REFERENCES profiles(id),
            joined_at   TEXT NOT NULL,
            UNIQUE(server_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS server_member_roles (
            id          TEXT PRIMARY KEY,
            server_id   TEXT NOT NULL REFERENCES servers(id),
            user_id     TEXT NOT NULL REFERENCES profiles(id),
            role        TEXT NOT NULL DEFAULT 'member',
            created_at  TEXT NOT NULL,
            UNIQUE(server_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS server_bans (
            id          TEXT PRIMARY KEY,
            server_id   TEXT NOT NULL REFERENCES servers(id),
            user_id     TEXT NOT NULL REFERENCES profiles(id),
            banned_by   TEXT NOT NULL REFERENCES profiles(id),
            reason      TEXT,
            created_at  TEXT NOT NULL,
            UNIQUE(server_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS pinned_messages (
            id          TEXT PRIMARY KEY,
            channel_id  TEXT NOT NULL REFERENCES channels(id),
            message_id  TEXT NOT NULL,
            pinned_by   TEXT NOT NULL REFERENCES profiles(id),
            pinned_at   TEXT NOT NULL,
            UNIQUE(channel_id, message_id)
        );

        CREATE TABLE IF NOT EXISTS friendships (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL REFERENCES profiles(id),
            friend_id   TEXT NOT NULL REFERENCES profiles(id),
            state       TEXT NOT NULL DEFAULT 'pending',
            created_at  TEXT NOT NULL,
            UNIQUE(user_id, friend_id)
        );
        ",
    )?;

    info!("store migrations complete");
    Ok(())
}
