use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use parley_store::MessageOps;
use parley_sync::pins::{PinView, resolve_pins};
use parley_sync::Entry;
use parley_types::models::{DirectMessage, Message, MessageTable, PinnedMessage};
use parley_types::StoreResult;

/// Body used when a DM carries media and no text.
const ATTACHMENT_PLACEHOLDER: &str = "\u{1F4CE} attachment";

/// Message, DM and pin actions for the local user. Author-only edit/delete
/// is the store's access policy, not re-checked here.
pub struct Messages<S> {
    store: Arc<S>,
    user: Uuid,
}

impl<S> Messages<S>
where
    S: MessageOps + Send + Sync,
{
    pub fn new(store: Arc<S>, user: Uuid) -> Self {
        Self { store, user }
    }

    /// Post to a channel. A blank message with no media is silently
    /// dropped, mirroring the composer's submit guard.
    pub async fn send_to_channel(
        &self,
        channel_id: Uuid,
        content: &str,
        media_url: Option<String>,
    ) -> StoreResult<Option<Message>> {
        let content = content.trim();
        if content.is_empty() && media_url.is_none() {
            return Ok(None);
        }
        let message = Message {
            id: Uuid::new_v4(),
            channel_id,
            author_id: self.user,
            content: content.to_owned(),
            media_url,
            created_at: Utc::now(),
            edited_at: None,
        };
        self.store.insert_message(message.clone()).await?;
        Ok(Some(message))
    }

    /// Send a DM. Media-only messages get a placeholder body so the
    /// conversation list has something to preview.
    pub async fn send_direct(
        &self,
        receiver_id: Uuid,
        content: &str,
        media_url: Option<String>,
    ) -> StoreResult<Option<DirectMessage>> {
        let content = content.trim();
        if content.is_empty() && media_url.is_none() {
            return Ok(None);
        }
        let body = if content.is_empty() { ATTACHMENT_PLACEHOLDER } else { content };
        let message = DirectMessage {
            id: Uuid::new_v4(),
            sender_id: self.user,
            receiver_id,
            content: body.to_owned(),
            media_url,
            read: false,
            created_at: Utc::now(),
            edited_at: None,
        };
        self.store.insert_direct_message(message.clone()).await?;
        Ok(Some(message))
    }

    /// Rewrite a message's content, stamping `edited_at`.
    pub async fn edit(&self, table: MessageTable, id: Uuid, content: &str) -> StoreResult<()> {
        let now = Utc::now();
        match table {
            MessageTable::Messages => self.store.edit_message(id, content, now).await,
            MessageTable::DirectMessages => {
                self.store.edit_direct_message(id, content, now).await
            }
        }
    }

    pub async fn delete(&self, table: MessageTable, id: Uuid) -> StoreResult<()> {
        match table {
            MessageTable::Messages => self.store.delete_message(id).await,
            MessageTable::DirectMessages => self.store.delete_direct_message(id).await,
        }
    }

    /// Pin a message to its channel. A second pin of the same message is a
    /// `Conflict`.
    pub async fn pin(&self, channel_id: Uuid, message_id: Uuid) -> StoreResult<PinnedMessage> {
        let pin = PinnedMessage {
            id: Uuid::new_v4(),
            channel_id,
            message_id,
            pinned_by: self.user,
            pinned_at: Utc::now(),
        };
        self.store.insert_pin(pin.clone()).await?;
        Ok(pin)
    }

    pub async fn unpin(&self, pin_id: Uuid) -> StoreResult<()> {
        self.store.delete_pin(pin_id).await
    }

    /// The channel's pin board, joined against the current conversation
    /// view. Pins whose message is gone render a placeholder.
    pub async fn pin_board(
        &self,
        channel_id: Uuid,
        entries: &[Entry],
    ) -> StoreResult<Vec<PinView>> {
        let pins = self.store.pins(channel_id).await?;
        Ok(resolve_pins(&pins, entries))
    }
}
