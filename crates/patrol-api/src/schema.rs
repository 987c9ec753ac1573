//! Server-side schema migrations.

use libsql::Connection;

const CURRENT_VERSION: i64 = 1;

pub async fn run(conn: &Connection) -> Result<(), libsql::Error> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
        (),
    )
    .await?;

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;
    let version: i64 = match rows.next().await? {
        Some(row) => row.get(0)?,
        None => 0,
    };

    if version < 1 {
        apply(conn, 1, V1).await?;
        tracing::info!(version = CURRENT_VERSION, "Applied ingestion schema");
    }
    Ok(())
}

async fn apply(conn: &Connection, version: i64, statements: &[&str]) -> Result<(), libsql::Error> {
    conn.execute("BEGIN TRANSACTION", ()).await?;
    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e);
        }
    }
    if let Err(e) = conn
        .execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            libsql::params![version],
        )
        .await
    {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e);
    }
    conn.execute("COMMIT", ()).await?;
    Ok(())
}

const V1: &[&str] = &[
    "CREATE TABLE operators (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        role_code TEXT NOT NULL DEFAULT 'PATROL',
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE locations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tag_id TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        address TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE check_ins (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        offline_id TEXT NOT NULL UNIQUE,
        location_id INTEGER NOT NULL REFERENCES locations(id),
        location_name TEXT NOT NULL,
        location_address TEXT NOT NULL,
        operator_id TEXT NOT NULL REFERENCES operators(id),
        status TEXT NOT NULL CHECK (status IN ('NORMAL', 'ABNORMAL')),
        notes TEXT NOT NULL DEFAULT '',
        captured_at INTEGER NOT NULL,
        received_at INTEGER NOT NULL
    )",
    "CREATE INDEX idx_check_ins_operator_time ON check_ins(operator_id, captured_at)",
    "CREATE TABLE incident_reports (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        offline_id TEXT NOT NULL UNIQUE,
        description TEXT NOT NULL,
        attachment_refs TEXT NOT NULL DEFAULT '[]',
        location_id INTEGER REFERENCES locations(id),
        operator_id TEXT NOT NULL REFERENCES operators(id),
        status TEXT NOT NULL DEFAULT 'PENDING',
        captured_at INTEGER NOT NULL,
        received_at INTEGER NOT NULL
    )",
    "CREATE TABLE audit_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        subject TEXT NOT NULL,
        detail TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
];
