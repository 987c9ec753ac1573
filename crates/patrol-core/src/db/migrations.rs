//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }
    if version < 3 {
        migrate_v3(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Run a list of statements in one transaction, rolling back on the first failure
async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn
        .execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            libsql::params![i64::from(version)],
        )
        .await
    {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated outbox database to version {version}");
    Ok(())
}

/// Migration to version 1: outbox tables
async fn migrate_v1(conn: &Connection) -> Result<()> {
    apply(
        conn,
        1,
        &[
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            "CREATE TABLE IF NOT EXISTS check_ins (
                local_id INTEGER PRIMARY KEY AUTOINCREMENT,
                offline_id TEXT NOT NULL UNIQUE,
                tag_id TEXT NOT NULL,
                captured_at INTEGER NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('NORMAL', 'ABNORMAL')),
                notes TEXT,
                synced INTEGER NOT NULL DEFAULT 0 CHECK (synced IN (0, 1))
            )",
            "CREATE INDEX IF NOT EXISTS idx_check_ins_pending
                ON check_ins(synced, captured_at, local_id)",
            "CREATE TABLE IF NOT EXISTS incident_reports (
                local_id INTEGER PRIMARY KEY AUTOINCREMENT,
                offline_id TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL,
                attachment_refs TEXT NOT NULL DEFAULT '[]',
                captured_at INTEGER NOT NULL,
                synced INTEGER NOT NULL DEFAULT 0 CHECK (synced IN (0, 1))
            )",
            "CREATE INDEX IF NOT EXISTS idx_incident_reports_pending
                ON incident_reports(synced, captured_at, local_id)",
        ],
    )
    .await
}

/// Migration to version 2: the synced flag may never be cleared
async fn migrate_v2(conn: &Connection) -> Result<()> {
    apply(
        conn,
        2,
        &[
            "CREATE TRIGGER IF NOT EXISTS check_ins_synced_monotone
             BEFORE UPDATE OF synced ON check_ins
             FOR EACH ROW
             WHEN OLD.synced = 1 AND NEW.synced = 0
             BEGIN
                 SELECT RAISE(ABORT, 'synced flag cannot be cleared');
             END",
            "CREATE TRIGGER IF NOT EXISTS incident_reports_synced_monotone
             BEFORE UPDATE OF synced ON incident_reports
             FOR EACH ROW
             WHEN OLD.synced = 1 AND NEW.synced = 0
             BEGIN
                 SELECT RAISE(ABORT, 'synced flag cannot be cleared');
             END",
        ],
    )
    .await
}

/// Migration to version 3: capturing operator per record, and the drain lease
///
/// Rows captured before this version belonged to whoever was signed in, which
/// the device never recorded; they are attributed to the guest operator.
async fn migrate_v3(conn: &Connection) -> Result<()> {
    apply(
        conn,
        3,
        &[
            "ALTER TABLE check_ins ADD COLUMN operator_id TEXT NOT NULL DEFAULT 'guest_user'",
            "ALTER TABLE incident_reports ADD COLUMN operator_id TEXT NOT NULL DEFAULT 'guest_user'",
            "CREATE TABLE IF NOT EXISTS sync_lease (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                holder TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )",
        ],
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsql::Builder;

    async fn setup() -> Connection {
        let db = Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations_idempotent() {
        let conn = setup().await;
        run(&conn).await.unwrap();
        run(&conn).await.unwrap();

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_synced_flag_cannot_be_cleared() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO check_ins (offline_id, tag_id, captured_at, status, synced)
             VALUES ('x', 'tag', 1, 'NORMAL', 1)",
            (),
        )
        .await
        .unwrap();

        let result = conn
            .execute("UPDATE check_ins SET synced = 0 WHERE offline_id = 'x'", ())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_offline_id_is_unique_per_kind() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        let insert = "INSERT INTO incident_reports (offline_id, description, captured_at)
                      VALUES ('dup', 'leak', 1)";
        conn.execute(insert, ()).await.unwrap();
        assert!(conn.execute(insert, ()).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_v3_attributes_existing_rows_to_guest() {
        let conn = setup().await;
        migrate_v1(&conn).await.unwrap();
        migrate_v2(&conn).await.unwrap();
        conn.execute(
            "INSERT INTO check_ins (offline_id, tag_id, captured_at, status)
             VALUES ('legacy', 'tag', 1, 'NORMAL')",
            (),
        )
        .await
        .unwrap();

        run(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT operator_id FROM check_ins WHERE offline_id = 'legacy'", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<String>(0).unwrap(), "guest_user");
        assert_eq!(get_version(&conn).await.unwrap(), 3);
    }
}
