//! In-memory key-value backend.
//!
//! Keeps the whole keyspace in one map behind a read-write lock. Suitable for
//! tests and single-process deployments; data is lost on restart.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{Guard, KvError, KvStore, Op, Transaction};

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Hash(HashMap<String, String>),
    ZSet(HashMap<String, f64>),
}

type Keyspace = HashMap<String, Value>;

/// In-memory implementation of [`KvStore`].
///
/// Transactions take the write lock once, check every guard, stage all ops
/// against copies of the touched keys and only then publish the result, so a
/// failing op leaves the keyspace untouched.
#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    keyspace: Arc<RwLock<Keyspace>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored
    pub fn len(&self) -> usize {
        self.keyspace.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keyspace.read().is_empty()
    }
}

fn zcard_of(keyspace: &Keyspace, key: &str) -> Result<u64, KvError> {
    match keyspace.get(key) {
        None => Ok(0),
        Some(Value::ZSet(members)) => Ok(members.len() as u64),
        Some(Value::Hash(_)) => Err(KvError::WrongType(key.to_string())),
    }
}

fn check_guard(keyspace: &Keyspace, guard: &Guard) -> Result<(), KvError> {
    let holds = match guard {
        Guard::Exists(key) => keyspace.contains_key(key),
        Guard::Absent(key) => !keyspace.contains_key(key),
        Guard::ZCardBelow { key, limit } => zcard_of(keyspace, key)? < *limit,
        Guard::ZMembers { key, members } => match keyspace.get(key) {
            None => members.is_empty(),
            Some(Value::ZSet(current)) => {
                current.len() == members.len() && members.iter().all(|member| current.contains_key(member))
            }
            Some(Value::Hash(_)) => return Err(KvError::WrongType(key.clone())),
        },
    };

    if holds { Ok(()) } else { Err(KvError::Precondition(guard.clone())) }
}

fn apply(slot: &mut Option<Value>, op: Op) -> Result<(), KvError> {
    match op {
        Op::HSet { key, fields } => match slot {
            None => *slot = Some(Value::Hash(fields.into_iter().collect())),
            Some(Value::Hash(hash)) => hash.extend(fields),
            Some(Value::ZSet(_)) => return Err(KvError::WrongType(key)),
        },
        Op::ZAdd { key, score, member } => match slot {
            None => *slot = Some(Value::ZSet(HashMap::from([(member, score)]))),
            Some(Value::ZSet(members)) => {
                members.insert(member, score);
            }
            Some(Value::Hash(_)) => return Err(KvError::WrongType(key)),
        },
        Op::ZRem { key, member } => match slot {
            None => {}
            Some(Value::ZSet(members)) => {
                members.remove(&member);
                if members.is_empty() {
                    *slot = None;
                }
            }
            Some(Value::Hash(_)) => return Err(KvError::WrongType(key)),
        },
        Op::Del(_) => *slot = None,
    }
    Ok(())
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.keyspace.read().contains_key(key))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, KvError> {
        match self.keyspace.read().get(key) {
            None => Ok(None),
            Some(Value::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(Value::ZSet(_)) => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        match self.keyspace.read().get(key) {
            None => Ok(HashMap::new()),
            Some(Value::Hash(hash)) => Ok(hash.clone()),
            Some(Value::ZSet(_)) => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn zcard(&self, key: &str) -> Result<u64, KvError> {
        zcard_of(&self.keyspace.read(), key)
    }

    async fn zrange(&self, key: &str) -> Result<Vec<String>, KvError> {
        match self.keyspace.read().get(key) {
            None => Ok(Vec::new()),
            Some(Value::ZSet(members)) => {
                let mut ranked: Vec<(&String, f64)> =
                    members.iter().map(|(member, score)| (member, *score)).collect();
                ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
                Ok(ranked.into_iter().map(|(member, _)| member.clone()).collect())
            }
            Some(Value::Hash(_)) => Err(KvError::WrongType(key.to_string())),
        }
    }

    async fn exec(&self, tx: Transaction) -> Result<(), KvError> {
        let (guards, ops) = tx.into_parts();
        let mut keyspace = self.keyspace.write();

        for guard in &guards {
            check_guard(&keyspace, guard)?;
        }

        let mut staged: HashMap<String, Option<Value>> = HashMap::new();
        for op in ops {
            let slot = staged
                .entry(op.key().to_string())
                .or_insert_with_key(|key| keyspace.get(key).cloned());
            apply(slot, op)?;
        }

        for (key, value) in staged {
            match value {
                Some(value) => {
                    keyspace.insert(key, value);
                }
                None => {
                    keyspace.remove(&key);
                }
            }
        }
        Ok(())
    }
}
