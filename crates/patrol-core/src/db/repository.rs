//! Outbox repository implementation

use libsql::{params, Connection, Row, Value};

use crate::error::{Error, Result};
use crate::models::{
    CheckInStatus, EventKind, LocalId, NewCheckIn, NewIncidentReport, OfflineId, OperatorId,
    PendingCheckIn, PendingEvent, PendingIncidentReport,
};
use crate::util::normalize_text_option;

const CHECK_IN_COLUMNS: &str =
    "local_id, offline_id, tag_id, captured_at, status, notes, synced, operator_id";
const INCIDENT_REPORT_COLUMNS: &str =
    "local_id, offline_id, description, attachment_refs, captured_at, synced, operator_id";

/// Position of the last record handed out by an unsynced listing.
///
/// Listings resume strictly after this `(captured_at, local_id)` pair, so a
/// record marked synced between two pages never shifts the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxPosition {
    pub captured_at: i64,
    pub local_id: LocalId,
}

impl OutboxPosition {
    /// Position before every record
    pub const START: Self = Self {
        captured_at: i64::MIN,
        local_id: LocalId::new(i64::MIN),
    };

    #[must_use]
    pub const fn after(event: &PendingEvent) -> Self {
        Self {
            captured_at: event.captured_at(),
            local_id: event.local_id(),
        }
    }
}

/// libSQL-backed access to the outbox tables
pub struct LibSqlOutboxRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlOutboxRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Append a check-in with a fresh offline id, unsynced
    pub async fn append_check_in(&self, check_in: &NewCheckIn) -> Result<PendingCheckIn> {
        let tag_id = check_in.tag_id.trim();
        if tag_id.is_empty() {
            return Err(Error::InvalidInput("tag id cannot be empty".into()));
        }
        let notes = normalize_text_option(check_in.notes.clone());
        let offline_id = OfflineId::new();

        self.conn
            .execute(
                "INSERT INTO check_ins (offline_id, tag_id, captured_at, status, notes, operator_id, synced)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
                params![
                    offline_id.as_str(),
                    tag_id,
                    check_in.captured_at,
                    check_in.status.as_str(),
                    optional_text(notes.as_deref()),
                    check_in.operator_id.as_str()
                ],
            )
            .await?;

        Ok(PendingCheckIn {
            local_id: LocalId::new(self.conn.last_insert_rowid()),
            offline_id,
            tag_id: tag_id.to_string(),
            captured_at: check_in.captured_at,
            status: check_in.status,
            notes,
            operator_id: check_in.operator_id.clone(),
            synced: false,
        })
    }

    /// Append an incident report with a fresh offline id, unsynced
    pub async fn append_incident_report(
        &self,
        report: &NewIncidentReport,
    ) -> Result<PendingIncidentReport> {
        let description = report.description.trim();
        if description.is_empty() {
            return Err(Error::InvalidInput(
                "report description cannot be empty".into(),
            ));
        }
        let attachment_refs: Vec<String> = report
            .attachment_refs
            .iter()
            .map(|reference| reference.trim().to_string())
            .filter(|reference| !reference.is_empty())
            .collect();
        let encoded_refs = serde_json::to_string(&attachment_refs)?;
        let offline_id = OfflineId::new();

        self.conn
            .execute(
                "INSERT INTO incident_reports (offline_id, description, attachment_refs, captured_at, operator_id, synced)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0)",
                params![
                    offline_id.as_str(),
                    description,
                    encoded_refs,
                    report.captured_at,
                    report.operator_id.as_str()
                ],
            )
            .await?;

        Ok(PendingIncidentReport {
            local_id: LocalId::new(self.conn.last_insert_rowid()),
            offline_id,
            description: description.to_string(),
            attachment_refs,
            captured_at: report.captured_at,
            operator_id: report.operator_id.clone(),
            synced: false,
        })
    }

    /// List unsynced records of one kind strictly after `position`, oldest first
    pub async fn list_unsynced(
        &self,
        kind: EventKind,
        position: OutboxPosition,
        limit: usize,
    ) -> Result<Vec<PendingEvent>> {
        let sql = format!(
            "SELECT {columns} FROM {table}
             WHERE synced = 0
               AND (captured_at > ?1 OR (captured_at = ?1 AND local_id > ?2))
             ORDER BY captured_at ASC, local_id ASC
             LIMIT ?3",
            columns = columns(kind),
            table = kind.table(),
        );

        let rows = self
            .conn
            .query(
                &sql,
                params![
                    position.captured_at,
                    position.local_id.get(),
                    i64::try_from(limit).unwrap_or(i64::MAX)
                ],
            )
            .await?;
        collect_events(kind, rows).await
    }

    /// Flag a record as accepted by the endpoint.
    ///
    /// Returns `true` when this call flipped the flag and `false` when the
    /// record was already synced.
    pub async fn mark_synced(&self, kind: EventKind, local_id: LocalId) -> Result<bool> {
        let sql = format!(
            "UPDATE {table} SET synced = 1 WHERE local_id = ?1 AND synced = 0",
            table = kind.table()
        );
        let changed = self.conn.execute(&sql, params![local_id.get()]).await?;
        if changed > 0 {
            return Ok(true);
        }

        if self.get(kind, local_id).await?.is_some() {
            Ok(false)
        } else {
            Err(Error::NotFound(format!("{kind} #{local_id}")))
        }
    }

    /// Count unsynced records of one kind
    pub async fn count_unsynced(&self, kind: EventKind) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {table} WHERE synced = 0",
            table = kind.table()
        );
        let mut rows = self.conn.query(&sql, ()).await?;
        let count = match rows.next().await? {
            Some(row) => row.get::<i64>(0)?,
            None => 0,
        };
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Fetch one record by local id
    pub async fn get(&self, kind: EventKind, local_id: LocalId) -> Result<Option<PendingEvent>> {
        let sql = format!(
            "SELECT {columns} FROM {table} WHERE local_id = ?1",
            columns = columns(kind),
            table = kind.table(),
        );
        let rows = self.conn.query(&sql, params![local_id.get()]).await?;
        Ok(collect_events(kind, rows).await?.into_iter().next())
    }

    /// List records of one kind newest first, synced or not
    pub async fn history(&self, kind: EventKind, limit: usize) -> Result<Vec<PendingEvent>> {
        let sql = format!(
            "SELECT {columns} FROM {table}
             ORDER BY captured_at DESC, local_id DESC
             LIMIT ?1",
            columns = columns(kind),
            table = kind.table(),
        );
        let rows = self
            .conn
            .query(&sql, params![i64::try_from(limit).unwrap_or(i64::MAX)])
            .await?;
        collect_events(kind, rows).await
    }

    /// Take or renew the single drain lease for `holder`.
    ///
    /// Succeeds when the lease is free, expired at `now_ms`, or already held by
    /// `holder`. The upsert is one statement, so two connections to the same
    /// file cannot both win.
    pub async fn try_acquire_lease(&self, holder: &str, now_ms: i64, ttl_ms: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "INSERT INTO sync_lease (id, holder, expires_at) VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE
                    SET holder = excluded.holder, expires_at = excluded.expires_at
                    WHERE sync_lease.holder = ?1 OR sync_lease.expires_at <= ?3",
                params![holder, now_ms.saturating_add(ttl_ms), now_ms],
            )
            .await?;
        Ok(changed > 0)
    }

    /// Give the lease up if `holder` still owns it
    pub async fn release_lease(&self, holder: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM sync_lease WHERE id = 1 AND holder = ?1",
                params![holder],
            )
            .await?;
        Ok(())
    }
}

const fn columns(kind: EventKind) -> &'static str {
    match kind {
        EventKind::CheckIn => CHECK_IN_COLUMNS,
        EventKind::IncidentReport => INCIDENT_REPORT_COLUMNS,
    }
}

async fn collect_events(kind: EventKind, mut rows: libsql::Rows) -> Result<Vec<PendingEvent>> {
    let mut events = Vec::new();
    while let Some(row) = rows.next().await? {
        let event = match kind {
            EventKind::CheckIn => PendingEvent::CheckIn(parse_check_in(&row)?),
            EventKind::IncidentReport => PendingEvent::IncidentReport(parse_incident_report(&row)?),
        };
        events.push(event);
    }
    Ok(events)
}

fn parse_check_in(row: &Row) -> Result<PendingCheckIn> {
    Ok(PendingCheckIn {
        local_id: LocalId::new(row.get::<i64>(0)?),
        offline_id: parse_offline_id(&row.get::<String>(1)?)?,
        tag_id: row.get::<String>(2)?,
        captured_at: row.get::<i64>(3)?,
        status: row.get::<String>(4)?.parse::<CheckInStatus>()?,
        notes: text_or_none(row.get_value(5)?),
        synced: row.get::<i64>(6)? != 0,
        operator_id: OperatorId::new(row.get::<String>(7)?),
    })
}

fn parse_incident_report(row: &Row) -> Result<PendingIncidentReport> {
    Ok(PendingIncidentReport {
        local_id: LocalId::new(row.get::<i64>(0)?),
        offline_id: parse_offline_id(&row.get::<String>(1)?)?,
        description: row.get::<String>(2)?,
        attachment_refs: serde_json::from_str(&row.get::<String>(3)?)?,
        captured_at: row.get::<i64>(4)?,
        synced: row.get::<i64>(5)? != 0,
        operator_id: OperatorId::new(row.get::<String>(6)?),
    })
}

fn parse_offline_id(raw: &str) -> Result<OfflineId> {
    raw.parse()
        .map_err(|_| Error::Database(format!("invalid offline id in outbox: {raw}")))
}

fn optional_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |text| Value::Text(text.to_string()))
}

fn text_or_none(value: Value) -> Option<String> {
    match value {
        Value::Text(text) => Some(text),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_append_check_in_starts_unsynced() {
        let db = setup().await;
        let repo = LibSqlOutboxRepository::new(db.connection());

        let record = repo
            .append_check_in(&NewCheckIn::new("  tag-1 ").with_notes("door ajar"))
            .await
            .unwrap();
        assert_eq!(record.tag_id, "tag-1");
        assert_eq!(record.notes.as_deref(), Some("door ajar"));
        assert!(!record.synced);

        let fetched = repo
            .get(EventKind::CheckIn, record.local_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched, PendingEvent::CheckIn(record));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_append_rejects_blank_input() {
        let db = setup().await;
        let repo = LibSqlOutboxRepository::new(db.connection());

        assert!(matches!(
            repo.append_check_in(&NewCheckIn::new("   ")).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            repo.append_incident_report(&NewIncidentReport::new(" "))
                .await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_incident_report_keeps_attachment_order() {
        let db = setup().await;
        let repo = LibSqlOutboxRepository::new(db.connection());

        let report = repo
            .append_incident_report(
                &NewIncidentReport::new("Pipe leak")
                    .with_attachment("img-2")
                    .with_attachment("img-1"),
            )
            .await
            .unwrap();

        let fetched = repo
            .get(EventKind::IncidentReport, report.local_id)
            .await
            .unwrap();
        match fetched {
            Some(PendingEvent::IncidentReport(stored)) => {
                assert_eq!(stored.attachment_refs, vec!["img-2", "img-1"]);
            }
            other => panic!("expected incident report, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_list_unsynced_orders_by_capture_time() {
        let db = setup().await;
        let repo = LibSqlOutboxRepository::new(db.connection());

        repo.append_check_in(&NewCheckIn::new("late").captured_at(300))
            .await
            .unwrap();
        repo.append_check_in(&NewCheckIn::new("early").captured_at(100))
            .await
            .unwrap();
        repo.append_check_in(&NewCheckIn::new("middle").captured_at(200))
            .await
            .unwrap();

        let events = repo
            .list_unsynced(EventKind::CheckIn, OutboxPosition::START, 10)
            .await
            .unwrap();
        let times: Vec<i64> = events.iter().map(PendingEvent::captured_at).collect();
        assert_eq!(times, vec![100, 200, 300]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_list_unsynced_resumes_after_position() {
        let db = setup().await;
        let repo = LibSqlOutboxRepository::new(db.connection());

        for _ in 0..3 {
            repo.append_check_in(&NewCheckIn::new("same").captured_at(50))
                .await
                .unwrap();
        }

        let first_page = repo
            .list_unsynced(EventKind::CheckIn, OutboxPosition::START, 2)
            .await
            .unwrap();
        assert_eq!(first_page.len(), 2);

        let resume = OutboxPosition::after(&first_page[1]);
        let second_page = repo
            .list_unsynced(EventKind::CheckIn, resume, 2)
            .await
            .unwrap();
        assert_eq!(second_page.len(), 1);
        assert!(second_page[0].local_id() > first_page[1].local_id());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_mark_synced_is_idempotent() {
        let db = setup().await;
        let repo = LibSqlOutboxRepository::new(db.connection());

        let record = repo
            .append_check_in(&NewCheckIn::new("tag"))
            .await
            .unwrap();
        assert!(repo
            .mark_synced(EventKind::CheckIn, record.local_id)
            .await
            .unwrap());
        assert!(!repo
            .mark_synced(EventKind::CheckIn, record.local_id)
            .await
            .unwrap());

        assert_eq!(repo.count_unsynced(EventKind::CheckIn).await.unwrap(), 0);
        let unsynced = repo
            .list_unsynced(EventKind::CheckIn, OutboxPosition::START, 10)
            .await
            .unwrap();
        assert!(unsynced.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_mark_synced_unknown_record() {
        let db = setup().await;
        let repo = LibSqlOutboxRepository::new(db.connection());

        let err = repo
            .mark_synced(EventKind::IncidentReport, LocalId::new(99))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_counts_are_per_kind() {
        let db = setup().await;
        let repo = LibSqlOutboxRepository::new(db.connection());

        repo.append_check_in(&NewCheckIn::new("a")).await.unwrap();
        repo.append_check_in(&NewCheckIn::new("b")).await.unwrap();
        repo.append_incident_report(&NewIncidentReport::new("fire door"))
            .await
            .unwrap();

        assert_eq!(repo.count_unsynced(EventKind::CheckIn).await.unwrap(), 2);
        assert_eq!(
            repo.count_unsynced(EventKind::IncidentReport)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_history_is_newest_first_and_includes_synced() {
        let db = setup().await;
        let repo = LibSqlOutboxRepository::new(db.connection());

        let old = repo
            .append_check_in(&NewCheckIn::new("old").captured_at(10))
            .await
            .unwrap();
        repo.append_check_in(&NewCheckIn::new("new").captured_at(20))
            .await
            .unwrap();
        repo.mark_synced(EventKind::CheckIn, old.local_id)
            .await
            .unwrap();

        let history = repo.history(EventKind::CheckIn, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].captured_at(), 20);
        assert!(history[1].is_synced());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_records_keep_capturing_operator() {
        let db = setup().await;
        let repo = LibSqlOutboxRepository::new(db.connection());

        let scan = repo
            .append_check_in(&NewCheckIn::new("tag").captured_by(OperatorId::new("bob")))
            .await
            .unwrap();
        let report = repo
            .append_incident_report(
                &NewIncidentReport::new("leak").captured_by(OperatorId::new("alice")),
            )
            .await
            .unwrap();

        let stored_scan = repo.get(EventKind::CheckIn, scan.local_id).await.unwrap().unwrap();
        let stored_report = repo
            .get(EventKind::IncidentReport, report.local_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored_scan.operator_id().as_str(), "bob");
        assert_eq!(stored_report.operator_id().as_str(), "alice");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_lease_is_exclusive_until_expiry() {
        let db = setup().await;
        let repo = LibSqlOutboxRepository::new(db.connection());

        assert!(repo.try_acquire_lease("a", 0, 100).await.unwrap());
        assert!(!repo.try_acquire_lease("b", 50, 100).await.unwrap());
        // Renewal by the holder extends the lease
        assert!(repo.try_acquire_lease("a", 60, 100).await.unwrap());
        assert!(!repo.try_acquire_lease("b", 120, 100).await.unwrap());
        assert!(repo.try_acquire_lease("b", 160, 100).await.unwrap());

        repo.release_lease("a").await.unwrap();
        assert!(!repo.try_acquire_lease("c", 170, 100).await.unwrap());
        repo.release_lease("b").await.unwrap();
        assert!(repo.try_acquire_lease("c", 170, 100).await.unwrap());
    }
}
