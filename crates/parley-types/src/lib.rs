pub mod error;
pub mod events;
pub mod models;

pub use error::{StoreError, StoreResult};
pub use events::{ChangeEvent, ChangeOp, RowChange, Table};
