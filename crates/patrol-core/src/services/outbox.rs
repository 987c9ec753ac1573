//! Shared outbox service used by capture actions and the sync orchestrator.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::db::{Database, LibSqlOutboxRepository, OutboxPosition};
use crate::models::{
    EventKind, LocalId, NewCheckIn, NewIncidentReport, PendingCheckIn, PendingCounts,
    PendingEvent, PendingIncidentReport,
};
use crate::Result;

const DEFAULT_PAGE_SIZE: usize = 32;

/// Thread-safe handle to the durable local outbox.
///
/// This is the only writer of the `synced` flag. Clones share one connection.
#[derive(Clone)]
pub struct OutboxStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl OutboxStore {
    /// Open the outbox at the given filesystem path, creating parent directories.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database::open(&db_path).await?;
        tracing::debug!("Opened outbox at {}", db_path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory outbox (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    /// Filesystem location of the outbox, if it is on disk.
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Durably record a scan. Errors must reach the operator.
    pub async fn append_check_in(&self, check_in: &NewCheckIn) -> Result<PendingCheckIn> {
        let record = {
            let db = self.db.lock().await;
            let repo = LibSqlOutboxRepository::new(db.connection());
            repo.append_check_in(check_in).await
        }
        .inspect_err(|error| {
            tracing::error!(kind = "check_in", %error, "Failed to persist captured check-in");
        })?;

        tracing::info!(
            kind = "check_in",
            local_id = record.local_id.get(),
            offline_id = %record.offline_id,
            "Captured check-in"
        );
        Ok(record)
    }

    /// Durably record an incident report. Errors must reach the operator.
    pub async fn append_incident_report(
        &self,
        report: &NewIncidentReport,
    ) -> Result<PendingIncidentReport> {
        let record = {
            let db = self.db.lock().await;
            let repo = LibSqlOutboxRepository::new(db.connection());
            repo.append_incident_report(report).await
        }
        .inspect_err(|error| {
            tracing::error!(
                kind = "incident_report",
                %error,
                "Failed to persist captured incident report"
            );
        })?;

        tracing::info!(
            kind = "incident_report",
            local_id = record.local_id.get(),
            offline_id = %record.offline_id,
            attachments = record.attachment_refs.len(),
            "Captured incident report"
        );
        Ok(record)
    }

    /// Lazy oldest-first cursor over unsynced records of one kind.
    pub fn unsynced(&self, kind: EventKind) -> UnsyncedCursor {
        UnsyncedCursor::new(self.clone(), kind, DEFAULT_PAGE_SIZE)
    }

    async fn unsynced_page(
        &self,
        kind: EventKind,
        position: OutboxPosition,
        limit: usize,
    ) -> Result<Vec<PendingEvent>> {
        let db = self.db.lock().await;
        let repo = LibSqlOutboxRepository::new(db.connection());
        repo.list_unsynced(kind, position, limit).await
    }

    /// Flag a record as accepted. Marking an already-synced record is a no-op.
    pub async fn mark_synced(&self, kind: EventKind, local_id: LocalId) -> Result<bool> {
        let db = self.db.lock().await;
        let repo = LibSqlOutboxRepository::new(db.connection());
        repo.mark_synced(kind, local_id).await
    }

    /// Take or renew the drain lease shared by every process using this file.
    ///
    /// Returns `false` while another holder's lease is still live.
    pub async fn acquire_drain_lease(&self, holder: &str, ttl: Duration) -> Result<bool> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let db = self.db.lock().await;
        let repo = LibSqlOutboxRepository::new(db.connection());
        repo.try_acquire_lease(holder, now_ms, ttl_ms).await
    }

    pub async fn release_drain_lease(&self, holder: &str) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlOutboxRepository::new(db.connection());
        repo.release_lease(holder).await
    }

    /// Count unsynced records of one kind.
    pub async fn count_unsynced(&self, kind: EventKind) -> Result<u64> {
        let db = self.db.lock().await;
        let repo = LibSqlOutboxRepository::new(db.connection());
        repo.count_unsynced(kind).await
    }

    /// Count unsynced records of every kind.
    pub async fn pending_counts(&self) -> Result<PendingCounts> {
        let db = self.db.lock().await;
        let repo = LibSqlOutboxRepository::new(db.connection());
        Ok(PendingCounts {
            check_ins: repo.count_unsynced(EventKind::CheckIn).await?,
            incident_reports: repo.count_unsynced(EventKind::IncidentReport).await?,
        })
    }

    /// Fetch one record by local id.
    pub async fn get(&self, kind: EventKind, local_id: LocalId) -> Result<Option<PendingEvent>> {
        let db = self.db.lock().await;
        let repo = LibSqlOutboxRepository::new(db.connection());
        repo.get(kind, local_id).await
    }

    /// Local history of one kind, newest first.
    pub async fn history(&self, kind: EventKind, limit: usize) -> Result<Vec<PendingEvent>> {
        let db = self.db.lock().await;
        let repo = LibSqlOutboxRepository::new(db.connection());
        repo.history(kind, limit).await
    }
}

/// Restartable, page-at-a-time walk over unsynced records, oldest first.
///
/// The store lock is only held while a page is fetched, so captures can
/// proceed while a drain is submitting records.
pub struct UnsyncedCursor {
    store: OutboxStore,
    kind: EventKind,
    page_size: usize,
    position: OutboxPosition,
    buffer: VecDeque<PendingEvent>,
    exhausted: bool,
}

impl UnsyncedCursor {
    fn new(store: OutboxStore, kind: EventKind, page_size: usize) -> Self {
        Self {
            store,
            kind,
            page_size: page_size.max(1),
            position: OutboxPosition::START,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Use a different page size (mostly for tests).
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub const fn kind(&self) -> EventKind {
        self.kind
    }

    /// Next unsynced record, or `None` once the kind is drained.
    pub async fn next(&mut self) -> Result<Option<PendingEvent>> {
        if self.buffer.is_empty() && !self.exhausted {
            let page = self
                .store
                .unsynced_page(self.kind, self.position, self.page_size)
                .await?;
            if page.len() < self.page_size {
                self.exhausted = true;
            }
            self.buffer.extend(page);
        }

        let next = self.buffer.pop_front();
        if let Some(event) = &next {
            self.position = OutboxPosition::after(event);
        }
        Ok(next)
    }

    /// Start again from the oldest unsynced record.
    pub fn restart(&mut self) {
        self.position = OutboxPosition::START;
        self.buffer.clear();
        self.exhausted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn drain(cursor: &mut UnsyncedCursor) -> Vec<PendingEvent> {
        let mut events = Vec::new();
        while let Some(event) = cursor.next().await.unwrap() {
            events.push(event);
        }
        events
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cursor_walks_all_pages_oldest_first() {
        let store = OutboxStore::open_in_memory().await.unwrap();
        for captured_at in [5, 1, 4, 2, 3] {
            store
                .append_check_in(&NewCheckIn::new("tag").captured_at(captured_at))
                .await
                .unwrap();
        }

        let mut cursor = store.unsynced(EventKind::CheckIn).with_page_size(2);
        let times: Vec<i64> = drain(&mut cursor)
            .await
            .iter()
            .map(PendingEvent::captured_at)
            .collect();
        assert_eq!(times, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cursor_restart_skips_records_synced_meanwhile() {
        let store = OutboxStore::open_in_memory().await.unwrap();
        let first = store
            .append_check_in(&NewCheckIn::new("a").captured_at(1))
            .await
            .unwrap();
        store
            .append_check_in(&NewCheckIn::new("b").captured_at(2))
            .await
            .unwrap();

        let mut cursor = store.unsynced(EventKind::CheckIn);
        assert_eq!(drain(&mut cursor).await.len(), 2);

        store
            .mark_synced(EventKind::CheckIn, first.local_id)
            .await
            .unwrap();
        cursor.restart();
        let remaining = drain(&mut cursor).await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].captured_at(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_counts_cover_both_kinds() {
        let store = OutboxStore::open_in_memory().await.unwrap();
        store
            .append_check_in(&NewCheckIn::new("a"))
            .await
            .unwrap();
        store
            .append_incident_report(&NewIncidentReport::new("smoke"))
            .await
            .unwrap();

        let counts = store.pending_counts().await.unwrap();
        assert_eq!(counts.check_ins, 1);
        assert_eq!(counts.incident_reports, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_path_creates_parent_directories() {
        let tmp = tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("outbox.db");

        let store = OutboxStore::open_path(&db_path).await.unwrap();
        store
            .append_check_in(&NewCheckIn::new("tag"))
            .await
            .unwrap();
        assert!(db_path.exists());
        assert_eq!(store.path(), Some(db_path.as_path()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn capture_failure_is_returned_to_caller() {
        let store = OutboxStore::open_in_memory().await.unwrap();
        let err = store
            .append_check_in(&NewCheckIn::new(""))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("tag id cannot be empty"));
    }
}
