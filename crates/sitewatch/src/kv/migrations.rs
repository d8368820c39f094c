use chrono::Utc;
use libsql::Connection;

use super::KvError;

/// Schema version - increment when making schema changes
const SCHEMA_VERSION: i64 = 1;

/// Bring the key-value tables up to [`SCHEMA_VERSION`].
pub async fn run_migrations(conn: &Connection) -> Result<(), KvError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL,
            description TEXT
        )",
        (),
    )
    .await?;

    let current_version = get_current_version(conn).await?;

    if current_version >= SCHEMA_VERSION {
        tracing::debug!(version = current_version, "key-value schema is up to date");
        return Ok(());
    }

    tracing::info!(from = current_version, to = SCHEMA_VERSION, "migrating key-value schema");

    if current_version < 1 {
        run_migration_v1(conn).await?;
        record_migration(conn, 1, "Hashes and sorted sets").await?;
    }

    Ok(())
}

async fn get_current_version(conn: &Connection) -> Result<i64, KvError> {
    let mut rows = conn.query("SELECT MAX(version) FROM schema_migrations", ()).await?;

    if let Some(row) = rows.next().await? {
        let version: Option<i64> = row.get(0)?;
        Ok(version.unwrap_or(0))
    } else {
        Ok(0)
    }
}

async fn record_migration(conn: &Connection, version: i64, description: &str) -> Result<(), KvError> {
    conn.execute(
        "INSERT INTO schema_migrations (version, applied_at, description) VALUES (?1, ?2, ?3)",
        libsql::params![version, Utc::now().timestamp(), description],
    )
    .await?;

    tracing::info!(version, description, "applied key-value migration");
    Ok(())
}

/// Migration v1: one table per value kind, keyed by (key, field/member)
async fn run_migration_v1(conn: &Connection) -> Result<(), KvError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS kv_hashes (
            key TEXT NOT NULL,
            field TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (key, field)
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS kv_zsets (
            key TEXT NOT NULL,
            member TEXT NOT NULL,
            score REAL NOT NULL,
            PRIMARY KEY (key, member)
        )",
        (),
    )
    .await?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_kv_zsets_score ON kv_zsets (key, score, member)", ())
        .await?;

    Ok(())
}
