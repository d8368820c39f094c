use std::sync::Arc;
use std::time::Duration;

use sitewatch::{KvStore, LibsqlKv, MemoryKv, MonitorConfig, Pinger, Probe, Prober, TenantStore};
use tracing::info;

use crate::config::{Backend, Config};
use crate::error::AppError;

/// Shared by every worker
#[derive(Clone)]
pub struct AppState {
    pub store: TenantStore,
    pub probe: Arc<dyn Probe>,
    pub monitor: MonitorConfig,
    pub heartbeat: Duration,
}

impl AppState {
    pub fn new(store: TenantStore, probe: Arc<dyn Probe>, monitor: MonitorConfig, heartbeat: Duration) -> Self {
        Self { store, probe, monitor, heartbeat }
    }

    pub async fn from_config(config: &Config) -> Result<Self, AppError> {
        let kv: Arc<dyn KvStore> = match config.storage.backend {
            Backend::Memory => Arc::new(MemoryKv::new()),
            Backend::Libsql => {
                Arc::new(LibsqlKv::open(&config.storage.path, config.storage.pool_size).await?)
            }
        };
        info!(backend = ?config.storage.backend, "storage ready");

        let store = TenantStore::new(kv, config.limits.store_limits()).with_deadline(config.storage.deadline());
        let probe = Arc::new(Pinger::new()?);

        Ok(Self::new(store, probe, config.monitor.monitor_config(), config.monitor.heartbeat()))
    }

    /// A fresh prober for one connection
    pub fn prober(&self, project_id: &str) -> Prober {
        Prober::new(self.store.clone(), self.probe.clone(), project_id, self.monitor.clone())
    }
}
