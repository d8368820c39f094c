use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::*;
use crate::domain::ProbeStatus;
use crate::kv::{KvError, LibsqlKv, MemoryKv};

fn store_with(limits: StoreLimits) -> (MemoryKv, TenantStore) {
    let kv = MemoryKv::new();
    let store = TenantStore::new(Arc::new(kv.clone()), limits);
    (kv, store)
}

fn store() -> (MemoryKv, TenantStore) {
    store_with(StoreLimits::default())
}

async fn seeded(store: &TenantStore) -> Project {
    let (project, _) = Project::new("acme");
    store.create_project(&project).await.unwrap();
    project
}

#[tokio::test]
async fn test_create_and_read_project() {
    let (_, store) = store();
    let project = seeded(&store).await;

    assert_eq!(store.get_project(&project.id).await.unwrap(), project);
    assert_eq!(store.get_project_id_by_admin_key(&project.admin_key).await.unwrap(), project.id);

    let keys = store.get_api_keys(&project.id).await.unwrap();
    assert!(keys.is_complete());
    assert_eq!(keys.items.len(), 1);
    assert!(keys.items[0].is_admin());
    assert!(store.get_read_only_keys(&project.id).await.unwrap().items.is_empty());
}

#[tokio::test]
async fn test_duplicate_admin_key_conflicts_without_partial_state() {
    let (kv, store) = store();
    let first = seeded(&store).await;
    let keys_before = kv.len();

    let second = Project { id: "other".into(), name: "copycat".into(), admin_key: first.admin_key.clone() };
    let err = store.create_project(&second).await.unwrap_err();

    assert!(err.is_conflict());
    assert_eq!(kv.len(), keys_before);
    assert!(store.get_project("other").await.unwrap_err().is_not_found());
    assert_eq!(store.get_project_id_by_admin_key(&first.admin_key).await.unwrap(), first.id);
}

#[tokio::test]
async fn test_rename_project() {
    let (_, store) = store();
    let project = seeded(&store).await;

    store.rename_project(&project.id, "renamed").await.unwrap();
    assert_eq!(store.get_project(&project.id).await.unwrap().name, "renamed");

    assert!(matches!(store.rename_project(&project.id, "").await, Err(StoreError::BadRequest(_))));
    assert!(store.rename_project("missing", "x").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_endpoint_roundtrip_starts_unknown() {
    let (_, store) = store();
    let project = seeded(&store).await;

    let info = store
        .create_endpoint(NewEndpoint::new(&project.id, "home", "https://example.com"))
        .await
        .unwrap();
    assert!(!info.id.is_empty());

    let listing = store.get_endpoints(&project.id).await.unwrap();
    assert_eq!(listing.items.len(), 1);
    let endpoint = &listing.items[0];
    assert_eq!(endpoint.id, info.id);
    assert_eq!(endpoint.url, "https://example.com");
    assert_eq!(endpoint.status, ProbeStatus::Unknown);
    assert_eq!(endpoint.last_checked_at, "Never");
    assert_eq!(endpoint.response_time, "0");
}

#[tokio::test]
async fn test_create_endpoint_rejects_bad_input_and_missing_project() {
    let (_, store) = store();
    let project = seeded(&store).await;

    let bad_url = store.create_endpoint(NewEndpoint::new(&project.id, "x", "ftp://example.com")).await;
    assert!(matches!(bad_url, Err(StoreError::BadRequest(_))));

    let no_name = store.create_endpoint(NewEndpoint::new(&project.id, "", "http://example.com")).await;
    assert!(matches!(no_name, Err(StoreError::BadRequest(_))));

    let missing = store.create_endpoint(NewEndpoint::new("ghost", "x", "http://example.com")).await;
    assert!(missing.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_endpoint_quota_conflict_keeps_count() {
    let (_, store) = store_with(StoreLimits { max_endpoints: 2, max_read_only_keys: 1 });
    let project = seeded(&store).await;

    for name in ["a", "b"] {
        store
            .create_endpoint(NewEndpoint::new(&project.id, name, "http://example.com"))
            .await
            .unwrap();
    }

    let err = store
        .create_endpoint(NewEndpoint::new(&project.id, "c", "http://example.com"))
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(store.get_endpoints(&project.id).await.unwrap().items.len(), 2);
}

#[tokio::test]
async fn test_concurrent_creates_never_exceed_quota() {
    let (_, store) = store_with(StoreLimits { max_endpoints: 5, max_read_only_keys: 1 });
    let project = seeded(&store).await;

    let mut handles = Vec::new();
    for i in 0..20 {
        let store = store.clone();
        let project_id = project.id.clone();
        handles.push(tokio::spawn(async move {
            store
                .create_endpoint(NewEndpoint::new(project_id, format!("e{i}"), "http://example.com"))
                .await
        }));
    }

    let mut created = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => created += 1,
            Err(err) => assert!(err.is_conflict()),
        }
    }
    assert_eq!(created, 5);
    assert_eq!(store.get_endpoints_for_monitoring(&project.id).await.unwrap().items.len(), 5);
}

#[tokio::test]
async fn test_delete_endpoint_removes_info_and_status() {
    let (_, store) = store();
    let project = seeded(&store).await;
    let info = store
        .create_endpoint(NewEndpoint::new(&project.id, "a", "http://example.com"))
        .await
        .unwrap();

    store.delete_endpoint(&project.id, &info.id).await.unwrap();

    assert!(store.get_endpoint_info(&project.id, &info.id).await.unwrap_err().is_not_found());
    assert!(store.get_endpoint_status(&project.id, &info.id).await.unwrap_err().is_not_found());
    assert!(store.get_endpoints(&project.id).await.unwrap().items.is_empty());
    assert!(store.delete_endpoint(&project.id, &info.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_partial_update_keeps_other_field() {
    let (_, store) = store();
    let project = seeded(&store).await;
    let info = store
        .create_endpoint(NewEndpoint::new(&project.id, "a", "http://a.example.com"))
        .await
        .unwrap();

    let rename = EndpointInfo { name: "renamed".into(), url: String::new(), ..info.clone() };
    store.update_endpoint_info(&rename).await.unwrap();
    let stored = store.get_endpoint_info(&project.id, &info.id).await.unwrap();
    assert_eq!(stored.name, "renamed");
    assert_eq!(stored.url, "http://a.example.com");

    let move_url = EndpointInfo { name: String::new(), url: "http://b.example.com".into(), ..info.clone() };
    store.update_endpoint_info(&move_url).await.unwrap();
    let stored = store.get_endpoint_info(&project.id, &info.id).await.unwrap();
    assert_eq!(stored.name, "renamed");
    assert_eq!(stored.url, "http://b.example.com");

    let empty = EndpointInfo { name: String::new(), url: String::new(), ..info };
    assert!(matches!(store.update_endpoint_info(&empty).await, Err(StoreError::BadRequest(_))));
}

#[tokio::test]
async fn test_status_update_requires_endpoint() {
    let (kv, store) = store();
    let project = seeded(&store).await;
    let info = store
        .create_endpoint(NewEndpoint::new(&project.id, "a", "http://example.com"))
        .await
        .unwrap();

    let status = EndpointStatus {
        id: info.id.clone(),
        status: ProbeStatus::Success(200),
        last_checked_at: "2024-01-01T00:00:00.000Z".into(),
        response_time: "2024-01-01T00:00:00.120Z".into(),
    };
    store.update_endpoint_status(&project.id, &status).await.unwrap();
    assert_eq!(store.get_endpoint_status(&project.id, &info.id).await.unwrap(), status);
    assert_eq!(store.get_endpoint_info(&project.id, &info.id).await.unwrap(), info);

    store.delete_endpoint(&project.id, &info.id).await.unwrap();
    let keys_after_delete = kv.len();
    assert!(store.update_endpoint_status(&project.id, &status).await.unwrap_err().is_not_found());
    assert_eq!(kv.len(), keys_after_delete);
}

#[tokio::test]
async fn test_read_only_key_quota_and_removal() {
    let (_, store) = store_with(StoreLimits { max_endpoints: 10, max_read_only_keys: 2 });
    let project = seeded(&store).await;

    let first = ApiKey::read_only(&project.id);
    let second = ApiKey::read_only(&project.id);
    store.add_read_only_key(&first).await.unwrap();
    store.add_read_only_key(&second).await.unwrap();

    let third = ApiKey::read_only(&project.id);
    assert!(store.add_read_only_key(&third).await.unwrap_err().is_conflict());
    assert!(store.add_read_only_key(&first).await.unwrap_err().is_conflict());
    assert_eq!(store.get_read_only_keys(&project.id).await.unwrap().items.len(), 2);

    store.remove_read_only_key(&project.id, &first.key).await.unwrap();
    store.add_read_only_key(&third).await.unwrap();

    let keys: Vec<String> = store
        .get_read_only_keys(&project.id)
        .await
        .unwrap()
        .items
        .into_iter()
        .map(|key| key.key)
        .collect();
    assert_eq!(keys.len(), 2);
    assert!(keys.contains(&second.key) && keys.contains(&third.key));

    assert!(store.remove_read_only_key(&project.id, &first.key).await.unwrap_err().is_not_found());
    assert!(matches!(
        store.remove_read_only_key(&project.id, &project.admin_key).await,
        Err(StoreError::BadRequest(_))
    ));
}

#[tokio::test]
async fn test_add_key_validation() {
    let (_, store) = store();
    let project = seeded(&store).await;

    let admin = ApiKey::admin(&project.id);
    assert!(matches!(store.add_read_only_key(&admin).await, Err(StoreError::BadRequest(_))));

    let orphan = ApiKey::read_only("ghost");
    assert!(store.add_read_only_key(&orphan).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_rotate_admin_key() {
    let (_, store) = store();
    let project = seeded(&store).await;
    let old = store
        .get_api_keys(&project.id)
        .await
        .unwrap()
        .items
        .into_iter()
        .find(ApiKey::is_admin)
        .unwrap();
    let new = ApiKey::admin(&project.id);

    let foreign = ApiKey::admin("elsewhere");
    assert!(matches!(store.rotate_admin_key(&old, &foreign).await, Err(StoreError::BadRequest(_))));
    let read_only = ApiKey::read_only(&project.id);
    assert!(matches!(store.rotate_admin_key(&old, &read_only).await, Err(StoreError::BadRequest(_))));

    store.rotate_admin_key(&old, &new).await.unwrap();

    assert_eq!(store.get_project(&project.id).await.unwrap().admin_key, new.key);
    assert_eq!(store.get_project_id_by_admin_key(&new.key).await.unwrap(), project.id);
    assert!(store.get_project_id_by_admin_key(&old.key).await.unwrap_err().is_not_found());

    let keys = store.get_api_keys(&project.id).await.unwrap().items;
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].key, new.key);

    assert!(store.rotate_admin_key(&old, &ApiKey::admin(&project.id)).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_rotate_to_taken_key_conflicts() {
    let (_, store) = store();
    let a = seeded(&store).await;
    let b = seeded(&store).await;

    let old = ApiKey { key: a.admin_key.clone(), ..ApiKey::admin(&a.id) };
    let taken = ApiKey { key: b.admin_key.clone(), ..ApiKey::admin(&a.id) };
    assert!(store.rotate_admin_key(&old, &taken).await.unwrap_err().is_conflict());
    assert_eq!(store.get_project(&a.id).await.unwrap().admin_key, a.admin_key);
}

#[tokio::test]
async fn test_delete_project_leaves_nothing_behind() {
    let (kv, store) = store();
    let project = seeded(&store).await;
    store.add_read_only_key(&ApiKey::read_only(&project.id)).await.unwrap();
    for name in ["a", "b"] {
        store
            .create_endpoint(NewEndpoint::new(&project.id, name, "http://example.com"))
            .await
            .unwrap();
    }

    store.delete_project(&project.id).await.unwrap();

    assert!(kv.is_empty());
    assert!(store.get_project(&project.id).await.unwrap_err().is_not_found());
    assert!(store.delete_project(&project.id).await.unwrap_err().is_not_found());
}

/// Write committed by another client while a deletion is being built
enum SideWrite {
    Key(ApiKey),
    Endpoint(NewEndpoint),
}

/// Backend that commits one queued write right after each read of `index`
struct InterleavingKv {
    inner: MemoryKv,
    side: TenantStore,
    index: String,
    queued: parking_lot::Mutex<Vec<SideWrite>>,
}

impl InterleavingKv {
    fn new(inner: &MemoryKv, index: String, writes: Vec<SideWrite>) -> Self {
        Self {
            inner: inner.clone(),
            side: TenantStore::new(Arc::new(inner.clone()), StoreLimits::default()),
            index,
            queued: parking_lot::Mutex::new(writes),
        }
    }
}

#[async_trait]
impl KvStore for InterleavingKv {
    async fn exists(&self, key: &str) -> std::result::Result<bool, KvError> {
        self.inner.exists(key).await
    }

    async fn hget(&self, key: &str, field: &str) -> std::result::Result<Option<String>, KvError> {
        self.inner.hget(key, field).await
    }

    async fn hget_all(&self, key: &str) -> std::result::Result<HashMap<String, String>, KvError> {
        self.inner.hget_all(key).await
    }

    async fn zcard(&self, key: &str) -> std::result::Result<u64, KvError> {
        self.inner.zcard(key).await
    }

    async fn zrange(&self, key: &str) -> std::result::Result<Vec<String>, KvError> {
        let members = self.inner.zrange(key).await?;
        if key == self.index {
            let write = self.queued.lock().pop();
            match write {
                Some(SideWrite::Key(api_key)) => self.side.add_read_only_key(&api_key).await.unwrap(),
                Some(SideWrite::Endpoint(endpoint)) => {
                    self.side.create_endpoint(endpoint).await.unwrap();
                }
                None => {}
            }
        }
        Ok(members)
    }

    async fn exec(&self, tx: Transaction) -> std::result::Result<(), KvError> {
        self.inner.exec(tx).await
    }
}

#[tokio::test]
async fn test_delete_project_sweeps_key_added_mid_delete() {
    let (kv, store) = store();
    let project = seeded(&store).await;

    let late_key = ApiKey::read_only(&project.id);
    let racing = InterleavingKv::new(&kv, keys::project_keys(&project.id), vec![SideWrite::Key(late_key.clone())]);
    let racing_store = TenantStore::new(Arc::new(racing), StoreLimits::default());

    racing_store.delete_project(&project.id).await.unwrap();

    assert!(!kv.exists(&keys::api_key(&project.id, &late_key.key)).await.unwrap());
    assert!(kv.is_empty());
}

#[tokio::test]
async fn test_delete_project_sweeps_endpoint_added_mid_delete() {
    let (kv, store) = store();
    let project = seeded(&store).await;

    let late = NewEndpoint::new(&project.id, "late", "http://example.com");
    let racing = InterleavingKv::new(&kv, keys::endpoints(&project.id), vec![SideWrite::Endpoint(late)]);
    let racing_store = TenantStore::new(Arc::new(racing), StoreLimits::default());

    racing_store.delete_project(&project.id).await.unwrap();
    assert!(kv.is_empty());
}

#[tokio::test]
async fn test_delete_project_gives_up_under_constant_writes() {
    let (kv, store) = store();
    let project = seeded(&store).await;

    let writes = (0..DELETE_ATTEMPTS)
        .map(|i| SideWrite::Endpoint(NewEndpoint::new(&project.id, format!("e{i}"), "http://example.com")))
        .collect();
    let racing = InterleavingKv::new(&kv, keys::endpoints(&project.id), writes);
    let racing_store = TenantStore::new(Arc::new(racing), StoreLimits::default());

    assert!(racing_store.delete_project(&project.id).await.unwrap_err().is_conflict());

    // nothing was removed, so every record is still reachable
    assert_eq!(store.get_project(&project.id).await.unwrap(), project);
    let endpoints = store.get_endpoints(&project.id).await.unwrap();
    assert!(endpoints.is_complete());
    assert_eq!(endpoints.items.len(), DELETE_ATTEMPTS as usize);

    store.delete_project(&project.id).await.unwrap();
    assert!(kv.is_empty());
}

#[tokio::test]
async fn test_bulk_reads_skip_broken_entries() {
    let (kv, store) = store();
    let project = seeded(&store).await;
    let good = store
        .create_endpoint(NewEndpoint::new(&project.id, "good", "http://example.com"))
        .await
        .unwrap();

    // an index entry whose records were never written
    kv.exec(Transaction::new().zadd(keys::endpoints(&project.id), f64::MAX, "dangling"))
        .await
        .unwrap();

    let listing = store.get_endpoints(&project.id).await.unwrap();
    assert_eq!(listing.skipped, 1);
    assert_eq!(listing.items.len(), 1);
    assert_eq!(listing.items[0].id, good.id);

    let monitored = store.get_endpoints_for_monitoring(&project.id).await.unwrap();
    assert_eq!(monitored.skipped, 1);
    assert_eq!(monitored.items, vec![good]);

    assert!(store.get_endpoints_for_monitoring("ghost").await.unwrap().items.is_empty());
}

/// Backend whose every call hangs
struct StalledKv;

#[async_trait]
impl KvStore for StalledKv {
    async fn exists(&self, _: &str) -> std::result::Result<bool, KvError> {
        std::future::pending().await
    }

    async fn hget(&self, _: &str, _: &str) -> std::result::Result<Option<String>, KvError> {
        std::future::pending().await
    }

    async fn hget_all(&self, _: &str) -> std::result::Result<HashMap<String, String>, KvError> {
        std::future::pending().await
    }

    async fn zcard(&self, _: &str) -> std::result::Result<u64, KvError> {
        std::future::pending().await
    }

    async fn zrange(&self, _: &str) -> std::result::Result<Vec<String>, KvError> {
        std::future::pending().await
    }

    async fn exec(&self, _: Transaction) -> std::result::Result<(), KvError> {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_calls_are_bounded_by_deadline() {
    let store = TenantStore::new(Arc::new(StalledKv), StoreLimits::default())
        .with_deadline(Duration::from_millis(50));

    let err = store.get_project("p").await.unwrap_err();
    assert!(matches!(err, StoreError::Internal(msg) if msg.contains("get_project")));
}

#[tokio::test]
async fn test_libsql_backend_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let kv = LibsqlKv::open(dir.path().join("store.db"), 4).await.unwrap();
    let store = TenantStore::new(Arc::new(kv), StoreLimits { max_endpoints: 1, max_read_only_keys: 1 });

    let project = seeded(&store).await;
    let info = store
        .create_endpoint(NewEndpoint::new(&project.id, "a", "http://example.com"))
        .await
        .unwrap();
    assert!(store
        .create_endpoint(NewEndpoint::new(&project.id, "b", "http://example.com"))
        .await
        .unwrap_err()
        .is_conflict());

    let duplicate = Project { id: "dup".into(), name: "dup".into(), admin_key: project.admin_key.clone() };
    assert!(store.create_project(&duplicate).await.unwrap_err().is_conflict());

    let endpoint = store.get_endpoint(&project.id, &info.id).await.unwrap();
    assert_eq!(endpoint.status, ProbeStatus::Unknown);

    store.delete_project(&project.id).await.unwrap();
    assert!(store.get_endpoint_info(&project.id, &info.id).await.unwrap_err().is_not_found());
    assert!(store.get_project_id_by_admin_key(&project.admin_key).await.unwrap_err().is_not_found());
}
