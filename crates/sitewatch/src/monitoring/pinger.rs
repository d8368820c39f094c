use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};

use super::types::MonitorError;
use crate::domain::{EndpointInfo, EndpointStatus, ProbeStatus};

/// One liveness check of an endpoint.
///
/// Implementations never fail: every failure is folded into the returned status.
#[async_trait::async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, endpoint: &EndpointInfo, timeout: Duration) -> EndpointStatus;
}

/// HTTP GET prober
#[derive(Debug, Clone)]
pub struct Pinger {
    client: reqwest::Client,
}

impl Pinger {
    pub fn new() -> Result<Self, MonitorError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("sitewatch/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client })
    }

    /// Reuse an existing client, e.g. one with custom TLS settings
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Probe for Pinger {
    async fn probe(&self, endpoint: &EndpointInfo, timeout: Duration) -> EndpointStatus {
        let started_at = Utc::now();
        let start = Instant::now();

        let status = match self.client.get(&endpoint.url).timeout(timeout).send().await {
            Ok(response) => ProbeStatus::from_code(response.status().as_u16()),
            Err(e) => {
                warn!(endpoint_id = %endpoint.id, url = %endpoint.url, error = %e, "probe failed");
                ProbeStatus::Error
            }
        };

        let elapsed = start.elapsed();
        debug!(endpoint_id = %endpoint.id, %status, elapsed_ms = elapsed.as_millis() as u64, "probe finished");
        EndpointStatus::checked(endpoint.id.as_str(), status, started_at, elapsed)
    }
}
