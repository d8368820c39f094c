//! Key-value substrate behind the tenant store
//!
//! The model follows a small subset of Redis: string-keyed hashes and
//! score-ordered sets, plus transactions that apply a batch of writes
//! atomically after checking a list of guards. A key holds either a hash or
//! a sorted set, never both.

pub mod memory;
mod migrations;
mod pool;
pub mod sqlite;

pub use memory::MemoryKv;
pub use pool::{LibsqlManager, LibsqlPool};
pub use sqlite::LibsqlKv;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by a key-value backend
#[derive(Debug, Error)]
pub enum KvError {
    #[error("libsql error: {0}")]
    Backend(#[from] libsql::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    /// A transaction guard did not hold; nothing was written
    #[error("precondition failed: {0}")]
    Precondition(Guard),

    #[error("key {0} holds the wrong kind of value")]
    WrongType(String),
}

/// Condition checked inside a transaction before any write is applied
#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    Exists(String),
    Absent(String),
    /// The sorted set under `key` has fewer than `limit` members
    ZCardBelow { key: String, limit: u64 },
    /// The sorted set under `key` holds exactly `members`, in any order
    ZMembers { key: String, members: Vec<String> },
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Guard::Exists(key) => write!(f, "{key} must exist"),
            Guard::Absent(key) => write!(f, "{key} must not exist"),
            Guard::ZCardBelow { key, limit } => write!(f, "{key} must hold fewer than {limit} members"),
            Guard::ZMembers { key, members } => {
                write!(f, "{key} must hold exactly the {} members read earlier", members.len())
            }
        }
    }
}

/// Single write inside a transaction
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    HSet { key: String, fields: Vec<(String, String)> },
    ZAdd { key: String, score: f64, member: String },
    ZRem { key: String, member: String },
    Del(String),
}

impl Op {
    pub fn key(&self) -> &str {
        match self {
            Op::HSet { key, .. } | Op::ZAdd { key, .. } | Op::ZRem { key, .. } | Op::Del(key) => key,
        }
    }
}

/// Atomic unit of work: all guards hold and every op applies, or nothing does.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    guards: Vec<Guard>,
    ops: Vec<Op>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require_exists(mut self, key: impl Into<String>) -> Self {
        self.guards.push(Guard::Exists(key.into()));
        self
    }

    pub fn require_absent(mut self, key: impl Into<String>) -> Self {
        self.guards.push(Guard::Absent(key.into()));
        self
    }

    pub fn require_zcard_below(mut self, key: impl Into<String>, limit: u64) -> Self {
        self.guards.push(Guard::ZCardBelow { key: key.into(), limit });
        self
    }

    /// Pin a sorted set to a snapshot taken before the transaction was built
    pub fn require_zmembers<M: Into<String>>(
        mut self,
        key: impl Into<String>,
        members: impl IntoIterator<Item = M>,
    ) -> Self {
        let members = members.into_iter().map(Into::into).collect();
        self.guards.push(Guard::ZMembers { key: key.into(), members });
        self
    }

    pub fn hset<F, V>(mut self, key: impl Into<String>, fields: impl IntoIterator<Item = (F, V)>) -> Self
    where
        F: Into<String>,
        V: Into<String>,
    {
        let fields = fields.into_iter().map(|(f, v)| (f.into(), v.into())).collect();
        self.ops.push(Op::HSet { key: key.into(), fields });
        self
    }

    pub fn zadd(mut self, key: impl Into<String>, score: f64, member: impl Into<String>) -> Self {
        self.ops.push(Op::ZAdd { key: key.into(), score, member: member.into() });
        self
    }

    pub fn zrem(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(Op::ZRem { key: key.into(), member: member.into() });
        self
    }

    pub fn del(mut self, key: impl Into<String>) -> Self {
        self.ops.push(Op::Del(key.into()));
        self
    }

    pub fn guards(&self) -> &[Guard] {
        &self.guards
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn into_parts(self) -> (Vec<Guard>, Vec<Op>) {
        (self.guards, self.ops)
    }
}

/// Key-value backend shared by every task of the process.
///
/// Implementations must be safe for concurrent use without external locking.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, KvError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError>;

    /// All fields of a hash; empty when the key does not exist
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, KvError>;

    async fn zcard(&self, key: &str) -> Result<u64, KvError>;

    /// Members of a sorted set, lowest score first
    async fn zrange(&self, key: &str) -> Result<Vec<String>, KvError>;

    /// Apply a transaction atomically
    async fn exec(&self, tx: Transaction) -> Result<(), KvError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_builder_keeps_order() {
        let tx = Transaction::new()
            .require_absent("a")
            .hset("a", [("name", "x")])
            .zadd("idx", 1.0, "a")
            .del("b");

        assert_eq!(tx.guards(), &[Guard::Absent("a".into())]);
        let keys: Vec<&str> = tx.ops().iter().map(Op::key).collect();
        assert_eq!(keys, ["a", "idx", "b"]);
    }
}
