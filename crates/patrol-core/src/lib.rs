//! patrol-core - Core library for Patrol
//!
//! This crate holds the durable outbox, connectivity monitoring and the sync
//! orchestrator shared by the patrol CLI and the ingestion API.

pub mod config;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod state;
pub mod sync;
pub mod util;
pub mod wire;

pub use error::{Error, Result};
pub use models::{EventKind, OfflineId, OperatorId, PendingCounts, PendingEvent};
