use chrono::{DateTime, Utc};
use uuid::Uuid;

use parley_types::models::PinnedMessage;

use crate::conversation::Entry;

/// Placeholder text rendered for a pin whose message no longer exists.
pub const DELETED_PLACEHOLDER: &str = "message deleted";

/// One pin joined against the current message view. Pins reference
/// messages; they don't copy them, so the message may be gone by the time
/// the board renders.
#[derive(Debug, Clone, PartialEq)]
pub struct PinView {
    pub pin_id: Uuid,
    pub message_id: Uuid,
    pub pinned_by: Uuid,
    pub pinned_at: DateTime<Utc>,
    pub message: Option<Entry>,
}

impl PinView {
    /// A pin whose referenced message was deleted after pinning.
    pub fn is_dangling(&self) -> bool {
        self.message.is_none()
    }

    /// What the board shows for this pin. Dangling pins render as a
    /// placeholder, never as an error.
    pub fn display_content(&self) -> &str {
        self.message
            .as_ref()
            .map(|m| m.content.as_str())
            .unwrap_or(DELETED_PLACEHOLDER)
    }
}

/// Join pin references against the loaded message view, preserving the
/// pins' order (newest first as fetched).
pub fn resolve_pins(pins: &[PinnedMessage], entries: &[Entry]) -> Vec<PinView> {
    pins.iter()
        .map(|pin| PinView {
            pin_id: pin.id,
            message_id: pin.message_id,
            pinned_by: pin.pinned_by,
            pinned_at: pin.pinned_at,
            message: entries.iter().find(|e| e.id == pin.message_id).cloned(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: Uuid, content: &str) -> Entry {
        Entry {
            id,
            author_id: Uuid::new_v4(),
            content: content.into(),
            media_url: None,
            created_at: Utc::now(),
            edited_at: None,
        }
    }

    fn pin(message_id: Uuid) -> PinnedMessage {
        PinnedMessage {
            id: Uuid::new_v4(),
            channel_id: Uuid::new_v4(),
            message_id,
            pinned_by: Uuid::new_v4(),
            pinned_at: Utc::now(),
        }
    }

    #[test]
    fn resolved_pin_carries_its_message() {
        let message = entry(Uuid::new_v4(), "pin me");
        let pins = vec![pin(message.id)];

        let board = resolve_pins(&pins, &[message.clone()]);
        assert_eq!(board.len(), 1);
        assert!(!board[0].is_dangling());
        assert_eq!(board[0].display_content(), "pin me");
    }

    #[test]
    fn dangling_pin_renders_placeholder() {
        let deleted_id = Uuid::new_v4();
        let pins = vec![pin(deleted_id)];

        // The referenced message is no longer in the view.
        let board = resolve_pins(&pins, &[]);
        assert_eq!(board.len(), 1);
        assert!(board[0].is_dangling());
        assert_eq!(board[0].display_content(), DELETED_PLACEHOLDER);
    }

    #[test]
    fn board_preserves_pin_order() {
        let first = pin(Uuid::new_v4());
        let second = pin(Uuid::new_v4());
        let board = resolve_pins(&[first.clone(), second.clone()], &[]);
        assert_eq!(board[0].pin_id, first.id);
        assert_eq!(board[1].pin_id, second.id);
    }
}
