//! The synchronization core: keeps a client's view of messages, reactions,
//! membership and presence consistent with the shared remote state.
//!
//! Every component follows the same shape: one authoritative fetch, one
//! change-feed subscription, and a refetch whenever anything in scope moves.
//! Views are derived from store reads, never reconstructed from the event
//! stream — event delivery order is not trusted.

pub mod conversation;
pub mod pins;
pub mod presence;
pub mod reactions;
pub mod roster;

pub use conversation::{ConversationHandle, ConversationSync, Entry, Scope, derive_view};
pub use pins::{PinView, resolve_pins};
pub use presence::{PresenceConfig, PresenceTracker};
pub use reactions::{ReactionGroup, ReactionHandle, ReactionSync, Reactions, aggregate};
pub use roster::{MemberView, Roster, RosterHandle, RosterSync};
