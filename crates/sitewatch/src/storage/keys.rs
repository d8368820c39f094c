//! Key layout of the tenant store.

pub const NAME: &str = "name";
pub const ADMIN_KEY: &str = "admin_key";
pub const PROJECT_ID: &str = "project_id";
pub const KEY_TYPE: &str = "type";
pub const CREATED_AT: &str = "created_at";
pub const URL: &str = "url";
pub const STATUS: &str = "status";
pub const LAST_CHECKED: &str = "last_checked";
pub const RESPONSE_TIME: &str = "response_time";

pub fn project(project_id: &str) -> String {
    format!("projects:{project_id}")
}

pub fn admin_key(key: &str) -> String {
    format!("admin_key:{key}:project_id")
}

pub fn project_keys(project_id: &str) -> String {
    format!("project:{project_id}:keys")
}

pub fn api_key(project_id: &str, key: &str) -> String {
    format!("project:{project_id}:keys:{key}")
}

pub fn endpoints(project_id: &str) -> String {
    format!("endpoints:{project_id}")
}

pub fn endpoint_info(project_id: &str, endpoint_id: &str) -> String {
    format!("endpoints:{project_id}:{endpoint_id}:info")
}

pub fn endpoint_status(project_id: &str, endpoint_id: &str) -> String {
    format!("endpoints:{project_id}:{endpoint_id}:status")
}
