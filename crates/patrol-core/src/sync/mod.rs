//! Outbox synchronization: the ingestion client, the single-flight
//! orchestrator and the worker that feeds it triggers.

mod client;
mod orchestrator;
mod worker;

pub use client::{HttpIngestionClient, IngestionClient, SubmitError, SubmitResult};
pub use orchestrator::{
    HaltReason, KindReport, SyncEvent, SyncOrchestrator, SyncOutcome, SyncReport,
};
pub use worker::{SyncHandle, SyncTrigger, SyncWorker};
