//! Services layer for shared business logic.

pub mod outbox;

pub use outbox::{OutboxStore, UnsyncedCursor};
