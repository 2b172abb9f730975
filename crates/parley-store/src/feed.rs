use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use parley_types::events::{ChangeEvent, RowChange, Table};

/// Single-column equality predicate — the whole filter language the change
/// feed supports. Predicates that would need an OR across columns (the
/// symmetric DM pair) cannot be expressed and are applied client-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnFilter {
    ChannelId(Uuid),
    MessageId(Uuid),
    ServerId(Uuid),
    UserId(Uuid),
}

/// What a subscriber wants delivered: one table, optionally narrowed by a
/// column filter.
#[derive(Debug, Clone, Copy)]
pub struct Interest {
    pub table: Table,
    pub filter: Option<ColumnFilter>,
}

impl Interest {
    pub fn table(table: Table) -> Self {
        Self { table, filter: None }
    }

    pub fn filtered(table: Table, filter: ColumnFilter) -> Self {
        Self { table, filter: Some(filter) }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.table() != self.table {
            return false;
        }
        let Some(filter) = self.filter else {
            return true;
        };
        match (&event.row, filter) {
            (RowChange::Message(m), ColumnFilter::ChannelId(id)) => m.channel_id == id,
            (RowChange::Pin(p), ColumnFilter::ChannelId(id)) => p.channel_id == id,
            (RowChange::Reaction(r), ColumnFilter::MessageId(id)) => r.message_id == id,
            (RowChange::Channel(c), ColumnFilter::ServerId(id)) => c.server_id == id,
            (RowChange::Category(c), ColumnFilter::ServerId(id)) => c.server_id == id,
            (RowChange::Membership(m), ColumnFilter::ServerId(id)) => m.server_id == id,
            (RowChange::Role(r), ColumnFilter::ServerId(id)) => r.server_id == id,
            (RowChange::Ban(b), ColumnFilter::ServerId(id)) => b.server_id == id,
            (RowChange::Profile(p), ColumnFilter::UserId(id)) => p.id == id,
            _ => false,
        }
    }
}

/// What `FeedSubscription::next` yields.
#[derive(Debug, Clone)]
pub enum FeedSignal {
    /// A change matching the subscription's interest.
    Change(ChangeEvent),
    /// The subscriber fell behind and events were dropped. Consumers that
    /// refetch on every event treat this exactly like a matching change.
    Resync,
}

/// Capability to subscribe to row-level change notifications.
pub trait Feed: Send + Sync {
    fn subscribe(&self, interest: Interest) -> FeedSubscription;
}

/// Fans change events out to every live subscription.
#[derive(Clone)]
pub struct FeedHub {
    tx: broadcast::Sender<ChangeEvent>,
}

impl FeedHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Deliver an event to all current subscribers. No subscribers is fine.
    pub fn publish(&self, event: ChangeEvent) {
        debug!(table = ?event.table(), op = ?event.op, "change event");
        let _ = self.tx.send(event);
    }
}

impl Default for FeedHub {
    fn default() -> Self {
        Self::new()
    }
}

impl Feed for FeedHub {
    fn subscribe(&self, interest: Interest) -> FeedSubscription {
        debug!(?interest, "feed subscribe");
        FeedSubscription { rx: Some(self.tx.subscribe()), interest }
    }
}

/// One live subscription. Events not matching the interest are discarded
/// before the caller sees them.
pub struct FeedSubscription {
    rx: Option<broadcast::Receiver<ChangeEvent>>,
    interest: Interest,
}

impl FeedSubscription {
    /// Next matching signal, or `None` once unsubscribed or the hub is gone.
    pub async fn next(&mut self) -> Option<FeedSignal> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) if self.interest.matches(&event) => {
                    return Some(FeedSignal::Change(event));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "feed subscriber lagged, forcing resync");
                    return Some(FeedSignal::Resync);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// Stop delivery. Safe to call any number of times.
    pub fn unsubscribe(&mut self) {
        self.rx = None;
    }

    pub fn is_active(&self) -> bool {
        self.rx.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parley_types::events::ChangeOp;
    use parley_types::models::Message;

    fn message_event(channel_id: Uuid) -> ChangeEvent {
        ChangeEvent::new(
            ChangeOp::Insert,
            RowChange::Message(Message {
                id: Uuid::new_v4(),
                channel_id,
                author_id: Uuid::new_v4(),
                content: "hi".into(),
                media_url: None,
                created_at: Utc::now(),
                edited_at: None,
            }),
        )
    }

    #[tokio::test]
    async fn filtered_subscription_discards_other_channels() {
        let hub = FeedHub::new();
        let channel = Uuid::new_v4();
        let mut sub = hub.subscribe(Interest::filtered(
            Table::Messages,
            ColumnFilter::ChannelId(channel),
        ));

        hub.publish(message_event(Uuid::new_v4()));
        hub.publish(message_event(channel));

        match sub.next().await {
            Some(FeedSignal::Change(event)) => match event.row {
                RowChange::Message(m) => assert_eq!(m.channel_id, channel),
                other => panic!("unexpected row: {other:?}"),
            },
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unfiltered_subscription_sees_whole_table() {
        let hub = FeedHub::new();
        let mut sub = hub.subscribe(Interest::table(Table::Messages));
        hub.publish(message_event(Uuid::new_v4()));
        assert!(matches!(sub.next().await, Some(FeedSignal::Change(_))));
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_stops_delivery() {
        let hub = FeedHub::new();
        let mut sub = hub.subscribe(Interest::table(Table::Messages));
        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());

        hub.publish(message_event(Uuid::new_v4()));
        assert!(sub.next().await.is_none());
    }

    #[test]
    fn interest_ignores_other_tables() {
        let interest = Interest::table(Table::Reactions);
        assert!(!interest.matches(&message_event(Uuid::new_v4())));
    }
}
