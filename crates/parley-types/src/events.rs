use serde::{Deserialize, Serialize};

use crate::models::{
    Ban, Category, Channel, DirectMessage, Friendship, Membership, Message, PinnedMessage,
    Profile, Reaction, RoleAssignment, Server,
};

/// Collections the store exposes. Feed subscriptions are scoped to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Profiles,
    Servers,
    Categories,
    Channels,
    Messages,
    DirectMessages,
    Reactions,
    Memberships,
    Roles,
    Bans,
    Pins,
    Friendships,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// The row payload carried by a change notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "table", content = "row", rename_all = "snake_case")]
pub enum RowChange {
    Profile(Profile),
    Server(Server),
    Category(Category),
    Channel(Channel),
    Message(Message),
    DirectMessage(DirectMessage),
    Reaction(Reaction),
    Membership(Membership),
    Role(RoleAssignment),
    Ban(Ban),
    Pin(PinnedMessage),
    Friendship(Friendship),
}

impl RowChange {
    pub fn table(&self) -> Table {
        match self {
            Self::Profile(_) => Table::Profiles,
            Self::Server(_) => Table::Servers,
            Self::Category(_) => Table::Categories,
            Self::Channel(_) => Table::Channels,
            Self::Message(_) => Table::Messages,
            Self::DirectMessage(_) => Table::DirectMessages,
            Self::Reaction(_) => Table::Reactions,
            Self::Membership(_) => Table::Memberships,
            Self::Role(_) => Table::Roles,
            Self::Ban(_) => Table::Bans,
            Self::Pin(_) => Table::Pins,
            Self::Friendship(_) => Table::Friendships,
        }
    }
}

/// One row-level change delivered by the feed. Delivery order is not
/// guaranteed to match write order; consumers refetch rather than replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    #[serde(flatten)]
    pub row: RowChange,
}

impl ChangeEvent {
    pub fn new(op: ChangeOp, row: RowChange) -> Self {
        Self { op, row }
    }

    pub fn table(&self) -> Table {
        self.row.table()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PresenceStatus;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn change_events_round_trip_with_table_tag() {
        let event = ChangeEvent::new(
            ChangeOp::Insert,
            RowChange::Profile(Profile {
                id: Uuid::new_v4(),
                username: "alice".into(),
                avatar_url: None,
                status: PresenceStatus::Online,
                last_seen: None,
                created_at: Utc::now(),
            }),
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["op"], "insert");
        assert_eq!(json["table"], "profile");
        assert_eq!(json["row"]["username"], "alice");

        let back: ChangeEvent = serde_json::from_value(json).unwrap();
        assert!(matches!(back.row, RowChange::Profile(ref p) if p.username == "alice"));
        assert_eq!(back.table(), Table::Profiles);
    }
}
