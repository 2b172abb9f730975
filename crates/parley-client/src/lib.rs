//! Client glue around the synchronization core: the session entry point
//! and the plain service methods UI dialogs call. No rendering here — every
//! function returns data or a result the UI layer can display.

pub mod directory;
pub mod friends;
pub mod messages;
pub mod session;

pub use directory::{ChannelTree, Directory};
pub use friends::{DmConversation, FriendEntry, FriendError, FriendOverview, Friends};
pub use messages::Messages;
pub use session::Session;
