//! Idempotent ingestion store.
//!
//! Every submission is keyed by the client's offline id: a repeated
//! submission returns the existing record instead of inserting a second one.
//! Unknown operators and tags are resolved by fallback provisioning, and each
//! fallback is written to `audit_events`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use libsql::params::IntoParams;
use libsql::{Builder, Connection, Database, Value};
use patrol_core::wire::{CheckInSubmission, IncidentReportSubmission, IngestReceipt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::AppError;
use crate::schema;

pub const SYSTEM_OPERATOR_ID: &str = "system_admin";
const ADMIN_ROLE: &str = "ADMIN";
const DEFAULT_ROLE: &str = "PATROL";
const PLACEHOLDER_ADDRESS: &str = "pending configuration";

/// Reference-resolution rules applied during ingestion.
#[derive(Debug, Clone, Copy)]
pub struct IngestPolicy {
    pub auto_provision: bool,
    pub report_locate_window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditKind {
    /// Unknown operator attributed to an existing admin.
    OperatorFallback,
    /// No operator existed at all; a placeholder admin was created.
    OperatorProvisioned,
    LocationProvisioned,
}

impl AuditKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OperatorFallback => "operator_fallback",
            Self::OperatorProvisioned => "operator_provisioned",
            Self::LocationProvisioned => "location_provisioned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    pub id: i64,
    pub kind: String,
    pub subject: String,
    pub detail: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Location {
    pub id: i64,
    pub tag_id: String,
    pub name: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Operator {
    pub id: String,
    pub name: String,
    pub role_code: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocationRegistration {
    pub tag_id: String,
    pub name: String,
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperatorRegistration {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub role_code: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestTotals {
    pub check_ins: i64,
    pub incident_reports: i64,
    pub audit_events: i64,
}

struct StoreInner {
    _db: Database,
    conn: Mutex<Connection>,
    policy: IngestPolicy,
}

#[derive(Clone)]
pub struct IngestStore {
    inner: Arc<StoreInner>,
}

impl IngestStore {
    pub async fn open(path: &Path, policy: IngestPolicy) -> Result<Self, AppError> {
        let db = Builder::new_local(path.to_string_lossy().as_ref())
            .build()
            .await?;
        Self::from_libsql(db, policy).await
    }

    #[cfg(test)]
    pub async fn open_in_memory(policy: IngestPolicy) -> Result<Self, AppError> {
        let db = Builder::new_local(":memory:").build().await?;
        Self::from_libsql(db, policy).await
    }

    async fn from_libsql(db: Database, policy: IngestPolicy) -> Result<Self, AppError> {
        let conn = db.connect()?;
        conn.execute("PRAGMA journal_mode = WAL;", ()).await.ok();
        conn.execute("PRAGMA foreign_keys = ON;", ()).await?;
        schema::run(&conn).await?;
        Ok(Self {
            inner: Arc::new(StoreInner {
                _db: db,
                conn: Mutex::new(conn),
                policy,
            }),
        })
    }

    pub async fn ingest_check_in(
        &self,
        submission: &CheckInSubmission,
    ) -> Result<IngestReceipt, AppError> {
        let offline_id = required(&submission.offline_id, "offline_id")?;
        let tag_id = required(&submission.tag_id, "tag_id")?;
        if submission.captured_at <= 0 {
            return Err(AppError::bad_request("captured_at must be a positive timestamp"));
        }

        let conn = self.inner.conn.lock().await;
        if let Some(id) = record_id(&conn, "check_ins", offline_id).await? {
            tracing::info!(kind = "check_in", offline_id, record_id = id, "Duplicate submission");
            return Ok(receipt(id, true));
        }

        let id = with_transaction(&conn, async {
            let location = self.resolve_location(&conn, tag_id).await?;
            let operator = resolve_operator(&conn, &submission.operator_id).await?;
            let notes = submission.notes.as_deref().map(str::trim).unwrap_or_default();
            conn.execute(
                "INSERT INTO check_ins (offline_id, location_id, location_name, location_address,
                    operator_id, status, notes, captured_at, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(offline_id) DO NOTHING",
                libsql::params![
                    offline_id,
                    location.id,
                    location.name.as_str(),
                    location.address.as_str(),
                    operator.as_str(),
                    submission.status.as_str(),
                    notes,
                    submission.captured_at,
                    now_ms(),
                ],
            )
            .await?;
            record_id(&conn, "check_ins", offline_id)
                .await?
                .ok_or_else(|| AppError::internal("check-in missing after insert"))
        })
        .await?;

        tracing::info!(kind = "check_in", offline_id, record_id = id, "Ingested check-in");
        Ok(receipt(id, false))
    }

    pub async fn ingest_incident_report(
        &self,
        submission: &IncidentReportSubmission,
    ) -> Result<IngestReceipt, AppError> {
        let offline_id = required(&submission.offline_id, "offline_id")?;
        let description = required(&submission.description, "description")?;
        if submission.captured_at <= 0 {
            return Err(AppError::bad_request("captured_at must be a positive timestamp"));
        }
        let attachment_refs: Vec<&str> = submission
            .attachment_refs
            .iter()
            .map(|reference| reference.trim())
            .filter(|reference| !reference.is_empty())
            .collect();
        let attachment_refs = serde_json::to_string(&attachment_refs)?;

        let conn = self.inner.conn.lock().await;
        if let Some(id) = record_id(&conn, "incident_reports", offline_id).await? {
            tracing::info!(
                kind = "incident_report",
                offline_id,
                record_id = id,
                "Duplicate submission"
            );
            return Ok(receipt(id, true));
        }

        let id = with_transaction(&conn, async {
            let operator = resolve_operator(&conn, &submission.operator_id).await?;
            let location_id = self
                .locate_report(&conn, &operator, submission.captured_at)
                .await?;
            conn.execute(
                "INSERT INTO incident_reports (offline_id, description, attachment_refs,
                    location_id, operator_id, captured_at, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(offline_id) DO NOTHING",
                libsql::params![
                    offline_id,
                    description,
                    attachment_refs.as_str(),
                    location_id.map_or(Value::Null, Value::Integer),
                    operator.as_str(),
                    submission.captured_at,
                    now_ms(),
                ],
            )
            .await?;
            record_id(&conn, "incident_reports", offline_id)
                .await?
                .ok_or_else(|| AppError::internal("incident report missing after insert"))
        })
        .await?;

        tracing::info!(
            kind = "incident_report",
            offline_id,
            record_id = id,
            "Ingested incident report"
        );
        Ok(receipt(id, false))
    }

    /// Create or rename a location. Existing check-ins keep their snapshots.
    pub async fn register_location(
        &self,
        registration: &LocationRegistration,
    ) -> Result<Location, AppError> {
        let tag_id = required(&registration.tag_id, "tag_id")?;
        let name = required(&registration.name, "name")?;
        let conn = self.inner.conn.lock().await;
        conn.execute(
            "INSERT INTO locations (tag_id, name, address, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(tag_id) DO UPDATE SET name = excluded.name, address = excluded.address",
            libsql::params![tag_id, name, registration.address.trim(), now_ms()],
        )
        .await?;
        find_location(&conn, tag_id)
            .await?
            .ok_or_else(|| AppError::internal("location missing after upsert"))
    }

    pub async fn register_operator(
        &self,
        registration: &OperatorRegistration,
    ) -> Result<Operator, AppError> {
        let id = required(&registration.id, "id")?;
        let name = required(&registration.name, "name")?;
        let role_code = registration
            .role_code
            .as_deref()
            .map(str::trim)
            .filter(|role| !role.is_empty())
            .unwrap_or(DEFAULT_ROLE)
            .to_ascii_uppercase();

        let conn = self.inner.conn.lock().await;
        conn.execute(
            "INSERT INTO operators (id, name, role_code, created_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, role_code = excluded.role_code",
            libsql::params![id, name, role_code.as_str(), now_ms()],
        )
        .await?;
        Ok(Operator {
            id: id.to_string(),
            name: name.to_string(),
            role_code,
        })
    }

    pub async fn totals(&self) -> Result<IngestTotals, AppError> {
        let conn = self.inner.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT (SELECT COUNT(*) FROM check_ins),
                        (SELECT COUNT(*) FROM incident_reports),
                        (SELECT COUNT(*) FROM audit_events)",
                (),
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(IngestTotals::default());
        };
        Ok(IngestTotals {
            check_ins: row.get(0)?,
            incident_reports: row.get(1)?,
            audit_events: row.get(2)?,
        })
    }

    /// Audit events, newest first.
    pub async fn audit_events(&self, limit: u32) -> Result<Vec<AuditEvent>, AppError> {
        let conn = self.inner.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT id, kind, subject, detail, created_at FROM audit_events
                 ORDER BY id DESC LIMIT ?1",
                libsql::params![i64::from(limit)],
            )
            .await?;
        let mut events = Vec::new();
        while let Some(row) = rows.next().await? {
            events.push(AuditEvent {
                id: row.get(0)?,
                kind: row.get(1)?,
                subject: row.get(2)?,
                detail: row.get(3)?,
                created_at: row.get(4)?,
            });
        }
        Ok(events)
    }

    async fn resolve_location(&self, conn: &Connection, tag_id: &str) -> Result<Location, AppError> {
        if let Some(location) = find_location(conn, tag_id).await? {
            return Ok(location);
        }
        if !self.inner.policy.auto_provision {
            return Err(AppError::unprocessable(format!(
                "tag {tag_id} is not registered to a location"
            )));
        }

        let prefix: String = tag_id.chars().take(6).collect();
        let name = format!("Unregistered tag ({prefix})");
        conn.execute(
            "INSERT INTO locations (tag_id, name, address, created_at) VALUES (?1, ?2, ?3, ?4)",
            libsql::params![tag_id, name.as_str(), PLACEHOLDER_ADDRESS, now_ms()],
        )
        .await?;
        let id = conn.last_insert_rowid();
        record_audit(
            conn,
            AuditKind::LocationProvisioned,
            tag_id,
            &format!("created placeholder location {id} \"{name}\""),
        )
        .await?;
        tracing::warn!(tag_id, location_id = id, "Provisioned placeholder location");

        Ok(Location {
            id,
            tag_id: tag_id.to_string(),
            name,
            address: PLACEHOLDER_ADDRESS.to_string(),
        })
    }

    /// Location of the operator's latest check-in inside the locate window,
    /// else the first known location.
    async fn locate_report(
        &self,
        conn: &Connection,
        operator_id: &str,
        captured_at: i64,
    ) -> Result<Option<i64>, AppError> {
        let window_ms =
            i64::try_from(self.inner.policy.report_locate_window.as_millis()).unwrap_or(i64::MAX);
        let since = captured_at.saturating_sub(window_ms);
        let recent = query_i64(
            conn,
            "SELECT location_id FROM check_ins
             WHERE operator_id = ?1 AND captured_at BETWEEN ?2 AND ?3
             ORDER BY captured_at DESC, id DESC LIMIT 1",
            libsql::params![operator_id, since, captured_at],
        )
        .await?;
        if recent.is_some() {
            return Ok(recent);
        }
        query_i64(conn, "SELECT id FROM locations ORDER BY id LIMIT 1", ()).await
    }
}

async fn with_transaction<T, F>(conn: &Connection, work: F) -> Result<T, AppError>
where
    F: std::future::Future<Output = Result<T, AppError>>,
{
    conn.execute("BEGIN IMMEDIATE", ()).await?;
    let result = match work.await {
        Ok(value) => conn.execute("COMMIT", ()).await.map(|_| value).map_err(AppError::from),
        Err(error) => Err(error),
    };
    if result.is_err() {
        conn.execute("ROLLBACK", ()).await.ok();
    }
    result
}

/// The requested operator when known; otherwise the first admin, then the
/// first operator of any role, provisioning a placeholder admin only when
/// there are no operators at all.
async fn resolve_operator(conn: &Connection, requested: &str) -> Result<String, AppError> {
    let requested = requested.trim();
    if !requested.is_empty()
        && query_i64(
            conn,
            "SELECT 1 FROM operators WHERE id = ?1",
            libsql::params![requested],
        )
        .await?
        .is_some()
    {
        return Ok(requested.to_string());
    }
    let subject = if requested.is_empty() {
        "<blank>"
    } else {
        requested
    };

    let fallback = match first_operator(conn, Some(ADMIN_ROLE)).await? {
        Some(admin) => Some(admin),
        None => first_operator(conn, None).await?,
    };
    if let Some(fallback) = fallback {
        record_audit(
            conn,
            AuditKind::OperatorFallback,
            subject,
            &format!("unknown operator attributed to {fallback}"),
        )
        .await?;
        tracing::warn!(requested = subject, %fallback, "Unknown operator");
        return Ok(fallback);
    }

    conn.execute(
        "INSERT INTO operators (id, name, role_code, created_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET role_code = excluded.role_code",
        libsql::params![
            SYSTEM_OPERATOR_ID,
            "System generated operator",
            ADMIN_ROLE,
            now_ms()
        ],
    )
    .await?;
    record_audit(
        conn,
        AuditKind::OperatorProvisioned,
        subject,
        &format!("no operator existed; provisioned {SYSTEM_OPERATOR_ID}"),
    )
    .await?;
    tracing::warn!(requested = subject, "Provisioned placeholder admin operator");
    Ok(SYSTEM_OPERATOR_ID.to_string())
}

/// Earliest registered operator, optionally restricted to one role.
async fn first_operator(conn: &Connection, role: Option<&str>) -> Result<Option<String>, AppError> {
    let mut rows = match role {
        Some(role) => {
            conn.query(
                "SELECT id FROM operators WHERE role_code = ?1 ORDER BY created_at, rowid LIMIT 1",
                libsql::params![role],
            )
            .await?
        }
        None => {
            conn.query(
                "SELECT id FROM operators ORDER BY created_at, rowid LIMIT 1",
                (),
            )
            .await?
        }
    };
    match rows.next().await? {
        Some(row) => Ok(Some(row.get::<String>(0)?)),
        None => Ok(None),
    }
}

async fn record_audit(
    conn: &Connection,
    kind: AuditKind,
    subject: &str,
    detail: &str,
) -> Result<(), AppError> {
    conn.execute(
        "INSERT INTO audit_events (kind, subject, detail, created_at) VALUES (?1, ?2, ?3, ?4)",
        libsql::params![kind.as_str(), subject, detail, now_ms()],
    )
    .await?;
    Ok(())
}

async fn find_location(conn: &Connection, tag_id: &str) -> Result<Option<Location>, AppError> {
    let mut rows = conn
        .query(
            "SELECT id, tag_id, name, address FROM locations WHERE tag_id = ?1",
            libsql::params![tag_id],
        )
        .await?;
    let Some(row) = rows.next().await? else {
        return Ok(None);
    };
    Ok(Some(Location {
        id: row.get(0)?,
        tag_id: row.get(1)?,
        name: row.get(2)?,
        address: row.get(3)?,
    }))
}

async fn record_id(
    conn: &Connection,
    table: &'static str,
    offline_id: &str,
) -> Result<Option<i64>, AppError> {
    query_i64(
        conn,
        &format!("SELECT id FROM {table} WHERE offline_id = ?1"),
        libsql::params![offline_id],
    )
    .await
}

async fn query_i64(
    conn: &Connection,
    sql: &str,
    params: impl IntoParams,
) -> Result<Option<i64>, AppError> {
    let mut rows = conn.query(sql, params).await?;
    match rows.next().await? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

fn required<'a>(value: &'a str, field: &str) -> Result<&'a str, AppError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(AppError::bad_request(format!("{field} is required")))
    } else {
        Ok(trimmed)
    }
}

const fn receipt(server_record_id: i64, duplicate: bool) -> IngestReceipt {
    IngestReceipt {
        accepted: true,
        server_record_id,
        duplicate,
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
impl IngestStore {
    /// `(location_id, location_name, operator_id)` stored for a check-in.
    pub async fn check_in_snapshot(&self, offline_id: &str) -> (i64, String, String) {
        let conn = self.inner.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT location_id, location_name, operator_id FROM check_ins WHERE offline_id = ?1",
                libsql::params![offline_id],
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().expect("check-in stored");
        (row.get(0).unwrap(), row.get(1).unwrap(), row.get(2).unwrap())
    }

    pub async fn report_location(&self, offline_id: &str) -> Option<i64> {
        let conn = self.inner.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT location_id FROM incident_reports WHERE offline_id = ?1",
                libsql::params![offline_id],
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().expect("report stored");
        row.get::<Option<i64>>(0).unwrap()
    }
}
