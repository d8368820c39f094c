use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Authority carried by an API key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    ReadOnly,
    Admin,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::ReadOnly => "read_only",
            KeyType::Admin => "admin",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown key type: {0}")]
pub struct UnknownKeyType(pub String);

impl FromStr for KeyType {
    type Err = UnknownKeyType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read_only" => Ok(KeyType::ReadOnly),
            "admin" => Ok(KeyType::Admin),
            other => Err(UnknownKeyType(other.to_string())),
        }
    }
}

/// A project-scoped API key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKey {
    /// Opaque key material, 64 hex characters when generated here
    pub key: String,

    pub kind: KeyType,

    pub project_id: String,

    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    /// Generate fresh key material for a project.
    pub fn generate(project_id: impl Into<String>, kind: KeyType) -> Self {
        Self {
            key: generate_key_material(),
            kind,
            project_id: project_id.into(),
            created_at: Utc::now().trunc_subsecs(0),
        }
    }

    pub fn admin(project_id: impl Into<String>) -> Self {
        Self::generate(project_id, KeyType::Admin)
    }

    pub fn read_only(project_id: impl Into<String>) -> Self {
        Self::generate(project_id, KeyType::ReadOnly)
    }

    pub fn is_admin(&self) -> bool {
        self.kind == KeyType::Admin
    }
}

fn generate_key_material() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

/// A tenant: owns endpoints and API keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,

    pub name: String,

    /// The single key with full authority over the project
    pub admin_key: String,
}

impl Project {
    /// Create a project with a generated id together with its admin key.
    pub fn new(name: impl Into<String>) -> (Self, ApiKey) {
        let id = Uuid::new_v4().to_string();
        let admin_key = ApiKey::admin(id.clone());
        let project = Self { id, name: name.into(), admin_key: admin_key.key.clone() };
        (project, admin_key)
    }
}
