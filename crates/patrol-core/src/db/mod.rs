//! Database layer for the on-device outbox

mod connection;
mod migrations;
mod repository;

pub use connection::Database;
pub use repository::{LibSqlOutboxRepository, OutboxPosition};
