//! Durable key-value backend on a local libsql database.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use deadpool::managed::Object;
use libsql::{Builder, Connection, TransactionBehavior, params};
use tracing::{debug, warn};

use super::migrations::run_migrations;
use super::pool::{LibsqlManager, LibsqlPool};
use super::{Guard, KvError, KvStore, Op, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Hash,
    ZSet,
}

/// [`KvStore`] persisted in two tables, one for hash fields and one for
/// sorted-set members. Each transaction runs inside an `IMMEDIATE` SQLite
/// transaction so guards and writes see the same snapshot.
#[derive(Clone)]
pub struct LibsqlKv {
    pool: LibsqlPool,
}

impl LibsqlKv {
    /// Open (or create) the database file and bring its schema up to date.
    pub async fn open(path: impl AsRef<Path>, max_connections: usize) -> Result<Self, KvError> {
        let path = path.as_ref();
        let database = Builder::new_local(path).build().await?;
        let pool = LibsqlPool::builder(LibsqlManager::new(database))
            .max_size(max_connections.max(1))
            .build()
            .map_err(|e| KvError::Pool(e.to_string()))?;

        let kv = Self { pool };
        let conn = kv.conn().await?;
        conn.query("PRAGMA journal_mode = WAL", ()).await?;
        run_migrations(&conn).await?;

        debug!(path = %path.display(), max_connections, "opened libsql key-value store");
        Ok(kv)
    }

    async fn conn(&self) -> Result<Object<LibsqlManager>, KvError> {
        self.pool.get().await.map_err(|e| KvError::Pool(e.to_string()))
    }
}

async fn kind_of(conn: &Connection, key: &str) -> Result<Option<Kind>, KvError> {
    let mut rows = conn
        .query(
            "SELECT
                EXISTS(SELECT 1 FROM kv_hashes WHERE key = ?1),
                EXISTS(SELECT 1 FROM kv_zsets WHERE key = ?1)",
            params![key],
        )
        .await?;

    let Some(row) = rows.next().await? else {
        return Ok(None);
    };
    if row.get::<i64>(0)? != 0 {
        Ok(Some(Kind::Hash))
    } else if row.get::<i64>(1)? != 0 {
        Ok(Some(Kind::ZSet))
    } else {
        Ok(None)
    }
}

async fn zcard_of(conn: &Connection, key: &str) -> Result<u64, KvError> {
    if kind_of(conn, key).await? == Some(Kind::Hash) {
        return Err(KvError::WrongType(key.to_string()));
    }

    let mut rows = conn.query("SELECT COUNT(*) FROM kv_zsets WHERE key = ?1", params![key]).await?;
    match rows.next().await? {
        Some(row) => Ok(row.get::<i64>(0)?.max(0) as u64),
        None => Ok(0),
    }
}

async fn zmembers_of(conn: &Connection, key: &str) -> Result<Vec<String>, KvError> {
    expect_kind(conn, key, Kind::ZSet).await?;

    let mut rows = conn
        .query("SELECT member FROM kv_zsets WHERE key = ?1 ORDER BY score ASC, member ASC", params![key])
        .await?;
    let mut members = Vec::new();
    while let Some(row) = rows.next().await? {
        members.push(row.get::<String>(0)?);
    }
    Ok(members)
}

/// Fail with `WrongType` when `key` currently holds the other kind of value
async fn expect_kind(conn: &Connection, key: &str, wanted: Kind) -> Result<(), KvError> {
    match kind_of(conn, key).await? {
        Some(kind) if kind != wanted => Err(KvError::WrongType(key.to_string())),
        _ => Ok(()),
    }
}

async fn check_guard(conn: &Connection, guard: &Guard) -> Result<(), KvError> {
    let holds = match guard {
        Guard::Exists(key) => kind_of(conn, key).await?.is_some(),
        Guard::Absent(key) => kind_of(conn, key).await?.is_none(),
        Guard::ZCardBelow { key, limit } => zcard_of(conn, key).await? < *limit,
        Guard::ZMembers { key, members } => {
            let mut current = zmembers_of(conn, key).await?;
            let mut expected = members.clone();
            current.sort_unstable();
            expected.sort_unstable();
            current == expected
        }
    };

    if holds { Ok(()) } else { Err(KvError::Precondition(guard.clone())) }
}

async fn apply(conn: &Connection, op: Op) -> Result<(), KvError> {
    match op {
        Op::HSet { key, fields } => {
            expect_kind(conn, &key, Kind::Hash).await?;
            for (field, value) in fields {
                conn.execute(
                    "INSERT INTO kv_hashes (key, field, value) VALUES (?1, ?2, ?3)
                     ON CONFLICT (key, field) DO UPDATE SET value = excluded.value",
                    params![key.as_str(), field, value],
                )
                .await?;
            }
        }
        Op::ZAdd { key, score, member } => {
            expect_kind(conn, &key, Kind::ZSet).await?;
            conn.execute(
                "INSERT INTO kv_zsets (key, member, score) VALUES (?1, ?2, ?3)
                 ON CONFLICT (key, member) DO UPDATE SET score = excluded.score",
                params![key, member, score],
            )
            .await?;
        }
        Op::ZRem { key, member } => {
            expect_kind(conn, &key, Kind::ZSet).await?;
            conn.execute("DELETE FROM kv_zsets WHERE key = ?1 AND member = ?2", params![key, member])
                .await?;
        }
        Op::Del(key) => {
            conn.execute("DELETE FROM kv_hashes WHERE key = ?1", params![key.as_str()]).await?;
            conn.execute("DELETE FROM kv_zsets WHERE key = ?1", params![key]).await?;
        }
    }
    Ok(())
}

async fn apply_all(conn: &Connection, guards: &[Guard], ops: Vec<Op>) -> Result<(), KvError> {
    for guard in guards {
        check_guard(conn, guard).await?;
    }
    for op in ops {
        apply(conn, op).await?;
    }
    Ok(())
}

#[async_trait]
impl KvStore for LibsqlKv {
    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let conn = self.conn().await?;
        Ok(kind_of(&conn, key).await?.is_some())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError> {
        let conn = self.conn().await?;
        expect_kind(&conn, key, Kind::Hash).await?;

        let mut rows = conn
            .query("SELECT value FROM kv_hashes WHERE key = ?1 AND field = ?2", params![key, field])
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get::<String>(0)?)),
            None => Ok(None),
        }
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        let conn = self.conn().await?;
        expect_kind(&conn, key, Kind::Hash).await?;

        let mut rows = conn.query("SELECT field, value FROM kv_hashes WHERE key = ?1", params![key]).await?;
        let mut fields = HashMap::new();
        while let Some(row) = rows.next().await? {
            fields.insert(row.get::<String>(0)?, row.get::<String>(1)?);
        }
        Ok(fields)
    }

    async fn zcard(&self, key: &str) -> Result<u64, KvError> {
        let conn = self.conn().await?;
        zcard_of(&conn, key).await
    }

    async fn zrange(&self, key: &str) -> Result<Vec<String>, KvError> {
        let conn = self.conn().await?;
        zmembers_of(&conn, key).await
    }

    async fn exec(&self, tx: Transaction) -> Result<(), KvError> {
        let (guards, ops) = tx.into_parts();
        let conn = self.conn().await?;
        let sql_tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).await?;

        match apply_all(&sql_tx, &guards, ops).await {
            Ok(()) => {
                sql_tx.commit().await?;
                Ok(())
            }
            Err(err) => {
                if let Err(rollback_err) = sql_tx.rollback().await {
                    warn!(error = %rollback_err, "failed to roll back key-value transaction");
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_temp() -> (TempDir, LibsqlKv) {
        let dir = tempfile::tempdir().unwrap();
        let kv = LibsqlKv::open(dir.path().join("kv.db"), 4).await.unwrap();
        (dir, kv)
    }

    #[tokio::test]
    async fn test_hash_roundtrip_and_overwrite() {
        let (_dir, kv) = open_temp().await;
        kv.exec(Transaction::new().hset("project:1", [("name", "a"), ("admin_key", "k")]))
            .await
            .unwrap();
        kv.exec(Transaction::new().hset("project:1", [("name", "b")])).await.unwrap();

        let all = kv.hget_all("project:1").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["name"], "b");
        assert!(kv.exists("project:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_guard_failure_rolls_back() {
        let (_dir, kv) = open_temp().await;
        kv.exec(Transaction::new().zadd("idx", 1.0, "a")).await.unwrap();

        let tx = Transaction::new()
            .require_zcard_below("idx", 1)
            .zadd("idx", 2.0, "b")
            .hset("info:b", [("url", "http://b")]);
        assert!(matches!(kv.exec(tx).await, Err(KvError::Precondition(_))));

        assert_eq!(kv.zrange("idx").await.unwrap(), ["a"]);
        assert!(!kv.exists("info:b").await.unwrap());
    }

    #[tokio::test]
    async fn test_wrong_type_is_rejected() {
        let (_dir, kv) = open_temp().await;
        kv.exec(Transaction::new().hset("h", [("f", "v")])).await.unwrap();

        let err = kv.exec(Transaction::new().zadd("h", 1.0, "m")).await.unwrap_err();
        assert!(matches!(err, KvError::WrongType(key) if key == "h"));
        assert!(matches!(kv.zrange("h").await, Err(KvError::WrongType(_))));
    }

    #[tokio::test]
    async fn test_del_and_zrem() {
        let (_dir, kv) = open_temp().await;
        let tx = Transaction::new().zadd("z", 2.0, "b").zadd("z", 1.0, "a").hset("h", [("f", "v")]);
        kv.exec(tx).await.unwrap();

        kv.exec(Transaction::new().zrem("z", "a").del("h")).await.unwrap();
        assert_eq!(kv.zrange("z").await.unwrap(), ["b"]);
        assert_eq!(kv.zcard("z").await.unwrap(), 1);
        assert!(!kv.exists("h").await.unwrap());
    }

    #[tokio::test]
    async fn test_zmembers_guard_pins_snapshot() {
        let (_dir, kv) = open_temp().await;
        kv.exec(Transaction::new().zadd("z", 1.0, "a")).await.unwrap();
        let snapshot = kv.zrange("z").await.unwrap();

        kv.exec(Transaction::new().zadd("z", 2.0, "b")).await.unwrap();
        let stale = Transaction::new().require_zmembers("z", snapshot).del("z");
        assert!(matches!(kv.exec(stale).await, Err(KvError::Precondition(_))));

        let fresh = Transaction::new().require_zmembers("z", ["b", "a"]).del("z");
        kv.exec(fresh).await.unwrap();
        assert!(!kv.exists("z").await.unwrap());
    }

    #[tokio::test]
    async fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.db");
        {
            let kv = LibsqlKv::open(&path, 2).await.unwrap();
            kv.exec(Transaction::new().hset("h", [("f", "v")])).await.unwrap();
        }

        let kv = LibsqlKv::open(&path, 2).await.unwrap();
        assert_eq!(kv.hget("h", "f").await.unwrap().as_deref(), Some("v"));
    }
}
