//! Tenant-scoped persistence for projects, API keys and endpoints.
//!
//! Every write that touches more than one key is submitted as a single
//! [`Transaction`]; quota and uniqueness checks are repeated as transaction
//! guards so a concurrent writer can never push a count past its limit.
//! Every call is bounded by the store's deadline.

mod keys;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{ApiKey, Endpoint, EndpointInfo, EndpointStatus, KeyType, NewEndpoint, Project};
use crate::error::{Result, StoreError};
use crate::kv::{Guard, KvError, KvStore, Transaction};
use crate::validation::{validate_endpoint_url, validate_name};

/// Deadline applied to every store call unless overridden
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(5);

/// Times `delete_project` rebuilds its transaction after a concurrent write
const DELETE_ATTEMPTS: u32 = 3;

/// Per-project quotas
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    pub max_endpoints: u64,
    pub max_read_only_keys: u64,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self { max_endpoints: 100, max_read_only_keys: 10 }
    }
}

/// Result of a bulk read: the records that could be read plus the number of
/// index entries that were skipped because their records were missing or
/// malformed.
#[derive(Debug, Clone, PartialEq)]
pub struct Listing<T> {
    pub items: Vec<T>,
    pub skipped: usize,
}

impl<T> Listing<T> {
    fn new() -> Self {
        Self { items: Vec::new(), skipped: 0 }
    }

    pub fn is_complete(&self) -> bool {
        self.skipped == 0
    }
}

/// Handle to the tenant store. Cheap to clone; clones share the backend.
#[derive(Clone)]
pub struct TenantStore {
    kv: Arc<dyn KvStore>,
    limits: StoreLimits,
    deadline: Duration,
}

/// Sorted-set score for a creation time
fn creation_score(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

/// Turn a failed guard into the store error its caller expects; any other
/// backend failure becomes `Internal`.
fn guard_error(err: KvError, map: impl FnOnce(&Guard) -> StoreError) -> StoreError {
    match err {
        KvError::Precondition(guard) => map(&guard),
        other => other.into(),
    }
}

fn parse_endpoint_info(project_id: &str, id: &str, mut fields: HashMap<String, String>) -> Option<EndpointInfo> {
    let url = fields.remove(keys::URL).filter(|url| !url.is_empty())?;
    Some(EndpointInfo {
        id: id.to_string(),
        name: fields.remove(keys::NAME).unwrap_or_default(),
        url,
        project_id: fields.remove(keys::PROJECT_ID).unwrap_or_else(|| project_id.to_string()),
    })
}

fn parse_endpoint_status(id: &str, mut fields: HashMap<String, String>) -> Option<EndpointStatus> {
    Some(EndpointStatus {
        id: id.to_string(),
        status: fields.remove(keys::STATUS)?.parse().ok()?,
        last_checked_at: fields.remove(keys::LAST_CHECKED)?,
        response_time: fields.remove(keys::RESPONSE_TIME)?,
    })
}

fn parse_api_key(project_id: &str, key: &str, fields: &HashMap<String, String>) -> Option<ApiKey> {
    let kind = fields.get(keys::KEY_TYPE)?.parse::<KeyType>().ok()?;
    let created_at = DateTime::parse_from_rfc3339(fields.get(keys::CREATED_AT)?).ok()?;
    Some(ApiKey {
        key: key.to_string(),
        kind,
        project_id: project_id.to_string(),
        created_at: created_at.with_timezone(&Utc),
    })
}

fn status_fields(status: &EndpointStatus) -> [(&'static str, String); 3] {
    [
        (keys::STATUS, status.status.to_string()),
        (keys::LAST_CHECKED, status.last_checked_at.clone()),
        (keys::RESPONSE_TIME, status.response_time.clone()),
    ]
}

fn key_fields(key: &ApiKey) -> [(&'static str, String); 2] {
    [(keys::KEY_TYPE, key.kind.to_string()), (keys::CREATED_AT, key.created_at.to_rfc3339())]
}

impl TenantStore {
    pub fn new(kv: Arc<dyn KvStore>, limits: StoreLimits) -> Self {
        Self { kv, limits, deadline: DEFAULT_DEADLINE }
    }

    /// Use a different deadline for every call made through this handle
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn limits(&self) -> StoreLimits {
        self.limits
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    async fn bounded<T>(&self, operation: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.deadline, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, deadline_ms = self.deadline.as_millis() as u64, "storage call timed out");
                Err(StoreError::Internal(format!("{operation} timed out after {:?}", self.deadline)))
            }
        }
    }

    async fn require_project(&self, project_id: &str) -> Result<()> {
        if self.kv.exists(&keys::project(project_id)).await? {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("project {project_id}")))
        }
    }

    // ---- projects ----

    /// Store a new project together with its admin key.
    pub async fn create_project(&self, project: &Project) -> Result<()> {
        self.bounded("create_project", async {
            validate_name("project name", &project.name)?;
            if project.admin_key.is_empty() {
                return Err(StoreError::BadRequest("admin key cannot be empty".into()));
            }

            let admin_index = keys::admin_key(&project.admin_key);
            if self.kv.exists(&admin_index).await? {
                return Err(StoreError::Conflict("admin key already in use".into()));
            }

            let now = Utc::now();
            let admin = ApiKey {
                key: project.admin_key.clone(),
                kind: KeyType::Admin,
                project_id: project.id.clone(),
                created_at: now,
            };
            let tx = Transaction::new()
                .require_absent(admin_index.as_str())
                .require_absent(keys::project(&project.id))
                .hset(keys::project(&project.id), [
                    (keys::NAME, project.name.as_str()),
                    (keys::ADMIN_KEY, project.admin_key.as_str()),
                ])
                .hset(admin_index.as_str(), [(keys::PROJECT_ID, project.id.as_str())])
                .hset(keys::api_key(&project.id, &admin.key), key_fields(&admin))
                .zadd(keys::project_keys(&project.id), creation_score(now), admin.key.as_str());

            self.kv.exec(tx).await.map_err(|err| {
                guard_error(err, |guard| match guard {
                    Guard::Absent(key) if *key == admin_index => {
                        StoreError::Conflict("admin key already in use".into())
                    }
                    _ => StoreError::Conflict(format!("project {} already exists", project.id)),
                })
            })?;

            info!(project_id = %project.id, "created project");
            Ok(())
        })
        .await
    }

    pub async fn get_project_id_by_admin_key(&self, admin_key: &str) -> Result<String> {
        self.bounded("get_project_id_by_admin_key", async {
            self.kv
                .hget(&keys::admin_key(admin_key), keys::PROJECT_ID)
                .await?
                .ok_or_else(|| StoreError::NotFound("admin key".into()))
        })
        .await
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Project> {
        self.bounded("get_project", async {
            let mut fields = self.kv.hget_all(&keys::project(project_id)).await?;
            if fields.is_empty() {
                return Err(StoreError::NotFound(format!("project {project_id}")));
            }

            let admin_key = fields
                .remove(keys::ADMIN_KEY)
                .ok_or_else(|| StoreError::Internal(format!("project {project_id} has no admin key")))?;
            Ok(Project {
                id: project_id.to_string(),
                name: fields.remove(keys::NAME).unwrap_or_default(),
                admin_key,
            })
        })
        .await
    }

    pub async fn rename_project(&self, project_id: &str, name: &str) -> Result<()> {
        self.bounded("rename_project", async {
            validate_name("project name", name)?;

            let tx = Transaction::new()
                .require_exists(keys::project(project_id))
                .hset(keys::project(project_id), [(keys::NAME, name)]);
            self.kv
                .exec(tx)
                .await
                .map_err(|err| guard_error(err, |_| StoreError::NotFound(format!("project {project_id}"))))
        })
        .await
    }

    /// Remove a project with every key and endpoint in its indexes.
    ///
    /// Both indexes are pinned to the snapshot the deletion was built from. A
    /// key or endpoint added in between fails the transaction, which is then
    /// rebuilt from fresh reads.
    pub async fn delete_project(&self, project_id: &str) -> Result<()> {
        self.bounded("delete_project", async {
            for attempt in 1..=DELETE_ATTEMPTS {
                let fields = self.kv.hget_all(&keys::project(project_id)).await?;
                if fields.is_empty() {
                    return Err(StoreError::NotFound(format!("project {project_id}")));
                }

                let api_keys = self.kv.zrange(&keys::project_keys(project_id)).await?;
                let endpoint_ids = self.kv.zrange(&keys::endpoints(project_id)).await?;

                let mut tx = Transaction::new()
                    .require_exists(keys::project(project_id))
                    .require_zmembers(keys::project_keys(project_id), api_keys.iter().map(String::as_str))
                    .require_zmembers(keys::endpoints(project_id), endpoint_ids.iter().map(String::as_str))
                    .del(keys::project(project_id));
                if let Some(admin_key) = fields.get(keys::ADMIN_KEY) {
                    tx = tx.del(keys::admin_key(admin_key));
                }
                for key in &api_keys {
                    tx = tx.del(keys::api_key(project_id, key));
                }
                tx = tx.del(keys::project_keys(project_id));
                for id in &endpoint_ids {
                    tx = tx.del(keys::endpoint_info(project_id, id)).del(keys::endpoint_status(project_id, id));
                }
                tx = tx.del(keys::endpoints(project_id));

                match self.kv.exec(tx).await {
                    Ok(()) => {
                        info!(project_id, keys = api_keys.len(), endpoints = endpoint_ids.len(), "deleted project");
                        return Ok(());
                    }
                    Err(KvError::Precondition(Guard::ZMembers { key, .. })) => {
                        debug!(project_id, index = %key, attempt, "index changed during project deletion, retrying");
                    }
                    Err(err) => {
                        return Err(guard_error(err, |_| StoreError::NotFound(format!("project {project_id}"))));
                    }
                }
            }

            warn!(project_id, attempts = DELETE_ATTEMPTS, "project kept changing during deletion");
            Err(StoreError::Conflict(format!("project {project_id} is being modified concurrently")))
        })
        .await
    }

    // ---- api keys ----

    /// Replace a project's admin key.
    pub async fn rotate_admin_key(&self, old: &ApiKey, new: &ApiKey) -> Result<()> {
        self.bounded("rotate_admin_key", async {
            if old.project_id != new.project_id {
                return Err(StoreError::BadRequest("keys belong to different projects".into()));
            }
            if !new.is_admin() {
                return Err(StoreError::BadRequest("replacement key must be an admin key".into()));
            }

            let project_id = new.project_id.as_str();
            let old_index = keys::admin_key(&old.key);
            let new_index = keys::admin_key(&new.key);

            match self.kv.hget(&old_index, keys::PROJECT_ID).await? {
                Some(mapped) if mapped == project_id => {}
                _ => return Err(StoreError::NotFound("admin key".into())),
            }
            if self.kv.exists(&new_index).await? {
                return Err(StoreError::Conflict("admin key already in use".into()));
            }

            let tx = Transaction::new()
                .require_exists(keys::project(project_id))
                .require_exists(old_index.as_str())
                .require_absent(new_index.as_str())
                .del(old_index.as_str())
                .del(keys::api_key(project_id, &old.key))
                .zrem(keys::project_keys(project_id), old.key.as_str())
                .hset(new_index.as_str(), [(keys::PROJECT_ID, project_id)])
                .hset(keys::api_key(project_id, &new.key), key_fields(new))
                .zadd(keys::project_keys(project_id), creation_score(new.created_at), new.key.as_str())
                .hset(keys::project(project_id), [(keys::ADMIN_KEY, new.key.as_str())]);

            self.kv.exec(tx).await.map_err(|err| {
                guard_error(err, |guard| match guard {
                    Guard::Absent(_) => StoreError::Conflict("admin key already in use".into()),
                    _ => StoreError::NotFound("admin key".into()),
                })
            })?;

            info!(project_id, "rotated admin key");
            Ok(())
        })
        .await
    }

    /// Attach a read-only key to its project, subject to the key quota.
    pub async fn add_read_only_key(&self, key: &ApiKey) -> Result<()> {
        self.bounded("add_read_only_key", async {
            if key.kind != KeyType::ReadOnly {
                return Err(StoreError::BadRequest("key is not a read-only key".into()));
            }
            let project_id = key.project_id.as_str();
            self.require_project(project_id).await?;

            // the index also holds the admin key
            let max_keys = self.limits.max_read_only_keys + 1;
            let index = keys::project_keys(project_id);
            if self.kv.zcard(&index).await? >= max_keys {
                return Err(StoreError::Conflict(format!(
                    "project {project_id} already has {} read-only keys",
                    self.limits.max_read_only_keys
                )));
            }

            let tx = Transaction::new()
                .require_exists(keys::project(project_id))
                .require_absent(keys::api_key(project_id, &key.key))
                .require_zcard_below(index.as_str(), max_keys)
                .hset(keys::api_key(project_id, &key.key), key_fields(key))
                .zadd(index.as_str(), creation_score(key.created_at), key.key.as_str());

            self.kv.exec(tx).await.map_err(|err| {
                guard_error(err, |guard| match guard {
                    Guard::Absent(_) => StoreError::Conflict("key already exists".into()),
                    Guard::ZCardBelow { .. } => StoreError::Conflict(format!(
                        "project {project_id} already has {} read-only keys",
                        self.limits.max_read_only_keys
                    )),
                    _ => StoreError::NotFound(format!("project {project_id}")),
                })
            })?;

            debug!(project_id, "added read-only key");
            Ok(())
        })
        .await
    }

    pub async fn remove_read_only_key(&self, project_id: &str, key: &str) -> Result<()> {
        self.bounded("remove_read_only_key", async {
            let info = keys::api_key(project_id, key);
            match self.kv.hget(&info, keys::KEY_TYPE).await?.as_deref() {
                None => return Err(StoreError::NotFound("api key".into())),
                Some("admin") => {
                    return Err(StoreError::BadRequest("the admin key cannot be removed".into()));
                }
                Some(_) => {}
            }

            let tx = Transaction::new()
                .require_exists(info.as_str())
                .del(info.as_str())
                .zrem(keys::project_keys(project_id), key);
            self.kv
                .exec(tx)
                .await
                .map_err(|err| guard_error(err, |_| StoreError::NotFound("api key".into())))?;

            debug!(project_id, "removed read-only key");
            Ok(())
        })
        .await
    }

    /// Every key of a project, oldest first.
    pub async fn get_api_keys(&self, project_id: &str) -> Result<Listing<ApiKey>> {
        self.bounded("get_api_keys", async {
            self.require_project(project_id).await?;

            let mut listing = Listing::new();
            for key in self.kv.zrange(&keys::project_keys(project_id)).await? {
                let fields = match self.kv.hget_all(&keys::api_key(project_id, &key)).await {
                    Ok(fields) => fields,
                    Err(err) => {
                        warn!(project_id, error = %err, "failed to read api key, skipping");
                        listing.skipped += 1;
                        continue;
                    }
                };
                match parse_api_key(project_id, &key, &fields) {
                    Some(api_key) => listing.items.push(api_key),
                    None => {
                        warn!(project_id, "api key record missing or malformed, skipping");
                        listing.skipped += 1;
                    }
                }
            }
            Ok(listing)
        })
        .await
    }

    pub async fn get_read_only_keys(&self, project_id: &str) -> Result<Listing<ApiKey>> {
        let mut listing = self.get_api_keys(project_id).await?;
        listing.items.retain(|key| key.kind == KeyType::ReadOnly);
        Ok(listing)
    }

    // ---- endpoints ----

    /// Create an endpoint with a generated id and an `Unknown` status.
    pub async fn create_endpoint(&self, new: NewEndpoint) -> Result<EndpointInfo> {
        self.bounded("create_endpoint", async {
            validate_name("endpoint name", &new.name)?;
            validate_endpoint_url(&new.url)?;

            let project_id = new.project_id.as_str();
            self.require_project(project_id).await?;

            let index = keys::endpoints(project_id);
            let max = self.limits.max_endpoints;
            if self.kv.zcard(&index).await? >= max {
                return Err(StoreError::Conflict(format!("project {project_id} already has {max} endpoints")));
            }

            let info = EndpointInfo {
                id: Uuid::new_v4().to_string(),
                name: new.name.clone(),
                url: new.url.clone(),
                project_id: project_id.to_string(),
            };
            let status = EndpointStatus::unknown(info.id.as_str());

            let tx = Transaction::new()
                .require_exists(keys::project(project_id))
                .require_zcard_below(index.as_str(), max)
                .zadd(index.as_str(), creation_score(Utc::now()), info.id.as_str())
                .hset(keys::endpoint_info(project_id, &info.id), [
                    (keys::NAME, info.name.as_str()),
                    (keys::URL, info.url.as_str()),
                    (keys::PROJECT_ID, project_id),
                ])
                .hset(keys::endpoint_status(project_id, &info.id), status_fields(&status));

            self.kv.exec(tx).await.map_err(|err| {
                guard_error(err, |guard| match guard {
                    Guard::ZCardBelow { .. } => {
                        StoreError::Conflict(format!("project {project_id} already has {max} endpoints"))
                    }
                    _ => StoreError::NotFound(format!("project {project_id}")),
                })
            })?;

            info!(project_id, endpoint_id = %info.id, url = %info.url, "created endpoint");
            Ok(info)
        })
        .await
    }

    pub async fn get_endpoint_info(&self, project_id: &str, endpoint_id: &str) -> Result<EndpointInfo> {
        self.bounded("get_endpoint_info", self.read_endpoint_info(project_id, endpoint_id)).await
    }

    pub async fn get_endpoint_status(&self, project_id: &str, endpoint_id: &str) -> Result<EndpointStatus> {
        self.bounded("get_endpoint_status", self.read_endpoint_status(project_id, endpoint_id)).await
    }

    pub async fn get_endpoint(&self, project_id: &str, endpoint_id: &str) -> Result<Endpoint> {
        self.bounded("get_endpoint", async {
            let info = self.read_endpoint_info(project_id, endpoint_id).await?;
            let status = self.read_endpoint_status(project_id, endpoint_id).await?;
            Ok(Endpoint::from_parts(info, status))
        })
        .await
    }

    async fn read_endpoint_info(&self, project_id: &str, endpoint_id: &str) -> Result<EndpointInfo> {
        let fields = self.kv.hget_all(&keys::endpoint_info(project_id, endpoint_id)).await?;
        if fields.is_empty() {
            return Err(StoreError::NotFound(format!("endpoint {endpoint_id}")));
        }
        parse_endpoint_info(project_id, endpoint_id, fields)
            .ok_or_else(|| StoreError::Internal(format!("endpoint {endpoint_id} info is malformed")))
    }

    async fn read_endpoint_status(&self, project_id: &str, endpoint_id: &str) -> Result<EndpointStatus> {
        let fields = self.kv.hget_all(&keys::endpoint_status(project_id, endpoint_id)).await?;
        if fields.is_empty() {
            return Err(StoreError::NotFound(format!("endpoint {endpoint_id}")));
        }
        parse_endpoint_status(endpoint_id, fields)
            .ok_or_else(|| StoreError::Internal(format!("endpoint {endpoint_id} status is malformed")))
    }

    /// Every endpoint of a project joined with its latest status, oldest first.
    pub async fn get_endpoints(&self, project_id: &str) -> Result<Listing<Endpoint>> {
        self.bounded("get_endpoints", async {
            self.require_project(project_id).await?;

            let mut listing = Listing::new();
            for id in self.kv.zrange(&keys::endpoints(project_id)).await? {
                let info = self.read_endpoint_info(project_id, &id).await;
                let status = self.read_endpoint_status(project_id, &id).await;
                match (info, status) {
                    (Ok(info), Ok(status)) => listing.items.push(Endpoint::from_parts(info, status)),
                    (Err(err), _) | (_, Err(err)) => {
                        warn!(project_id, endpoint_id = %id, error = %err, "skipping unreadable endpoint");
                        listing.skipped += 1;
                    }
                }
            }
            Ok(listing)
        })
        .await
    }

    /// Configuration of every probe target of a project. A missing project
    /// yields an empty listing.
    pub async fn get_endpoints_for_monitoring(&self, project_id: &str) -> Result<Listing<EndpointInfo>> {
        self.bounded("get_endpoints_for_monitoring", async {
            let mut listing = Listing::new();
            for id in self.kv.zrange(&keys::endpoints(project_id)).await? {
                match self.read_endpoint_info(project_id, &id).await {
                    Ok(info) => listing.items.push(info),
                    Err(err) => {
                        warn!(project_id, endpoint_id = %id, error = %err, "skipping endpoint without a probe target");
                        listing.skipped += 1;
                    }
                }
            }
            Ok(listing)
        })
        .await
    }

    /// Partially update an endpoint: an empty `name` or `url` keeps the stored
    /// value. Concurrent updates of different fields are last-writer-wins per
    /// field.
    pub async fn update_endpoint_info(&self, update: &EndpointInfo) -> Result<EndpointInfo> {
        self.bounded("update_endpoint_info", async {
            if update.name.is_empty() && update.url.is_empty() {
                return Err(StoreError::BadRequest("nothing to update".into()));
            }
            if !update.name.is_empty() {
                validate_name("endpoint name", &update.name)?;
            }
            if !update.url.is_empty() {
                validate_endpoint_url(&update.url)?;
            }

            let project_id = update.project_id.as_str();
            let mut current = self.read_endpoint_info(project_id, &update.id).await?;
            if !update.name.is_empty() {
                current.name = update.name.clone();
            }
            if !update.url.is_empty() {
                current.url = update.url.clone();
            }

            let info_key = keys::endpoint_info(project_id, &update.id);
            let tx = Transaction::new()
                .require_exists(info_key.as_str())
                .hset(info_key.as_str(), [(keys::NAME, current.name.as_str()), (keys::URL, current.url.as_str())]);
            self.kv
                .exec(tx)
                .await
                .map_err(|err| guard_error(err, |_| StoreError::NotFound(format!("endpoint {}", update.id))))?;

            debug!(project_id, endpoint_id = %update.id, "updated endpoint");
            Ok(current)
        })
        .await
    }

    /// Overwrite the status fields of an existing endpoint.
    pub async fn update_endpoint_status(&self, project_id: &str, status: &EndpointStatus) -> Result<()> {
        self.bounded("update_endpoint_status", async {
            let tx = Transaction::new()
                .require_exists(keys::endpoint_info(project_id, &status.id))
                .hset(keys::endpoint_status(project_id, &status.id), status_fields(status));
            self.kv
                .exec(tx)
                .await
                .map_err(|err| guard_error(err, |_| StoreError::NotFound(format!("endpoint {}", status.id))))
        })
        .await
    }

    pub async fn delete_endpoint(&self, project_id: &str, endpoint_id: &str) -> Result<()> {
        self.bounded("delete_endpoint", async {
            self.require_project(project_id).await?;

            let tx = Transaction::new()
                .require_exists(keys::endpoint_info(project_id, endpoint_id))
                .zrem(keys::endpoints(project_id), endpoint_id)
                .del(keys::endpoint_info(project_id, endpoint_id))
                .del(keys::endpoint_status(project_id, endpoint_id));
            self.kv
                .exec(tx)
                .await
                .map_err(|err| guard_error(err, |_| StoreError::NotFound(format!("endpoint {endpoint_id}"))))?;

            info!(project_id, endpoint_id, "deleted endpoint");
            Ok(())
        })
        .await
    }
}
