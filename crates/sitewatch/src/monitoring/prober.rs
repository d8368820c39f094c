//! Periodic, bounded fan-out probing of one project's endpoints.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::gate::ConcurrencyGate;
use super::pinger::Probe;
use super::types::{MonitorConfig, MonitorError, OverlapPolicy, ProberState};
use crate::domain::{EndpointInfo, EndpointStatus, ProbeStatus};
use crate::storage::TenantStore;

/// Results buffered between probe tasks and the consumer
const OUTPUT_BUFFER: usize = 64;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Probes every endpoint of one project on a fixed interval.
///
/// Results are written back to the store and delivered through [`next`] in
/// completion order. A prober runs once: after [`stop`] a new one has to be
/// built.
///
/// [`next`]: Prober::next
/// [`stop`]: Prober::stop
pub struct Prober {
    project_id: String,
    store: TenantStore,
    probe: Arc<dyn Probe>,
    config: MonitorConfig,
    gate: ConcurrencyGate,
    state: ProberState,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    ticker: Option<JoinHandle<()>>,
    output: Option<mpsc::Receiver<EndpointStatus>>,
}

impl Prober {
    pub fn new(
        store: TenantStore,
        probe: Arc<dyn Probe>,
        project_id: impl Into<String>,
        mut config: MonitorConfig,
    ) -> Self {
        config.interval = config.interval.max(MIN_INTERVAL);
        let gate = ConcurrencyGate::new(config.max_concurrent_probes);

        Self {
            project_id: project_id.into(),
            store,
            probe,
            config,
            gate,
            state: ProberState::Idle,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            ticker: None,
            output: None,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn state(&self) -> ProberState {
        self.state
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Start ticking. Only an idle prober can be started.
    pub fn run(&mut self) -> Result<(), MonitorError> {
        if self.state != ProberState::Idle {
            return Err(MonitorError::NotIdle { project_id: self.project_id.clone(), state: self.state });
        }

        let (results, output) = mpsc::channel(OUTPUT_BUFFER);
        let ctx = ProbeContext {
            project_id: Arc::from(self.project_id.as_str()),
            store: self.store.clone(),
            probe: self.probe.clone(),
            gate: self.gate.clone(),
            ping_timeout: self.config.ping_timeout,
            shutdown: self.shutdown.clone(),
            results,
        };
        let tick_loop = TickLoop {
            ctx,
            interval: self.config.interval,
            overlap: self.config.overlap,
            tasks: self.tasks.clone(),
        };

        self.output = Some(output);
        self.ticker = Some(tokio::spawn(tick_loop.run()));
        self.state = ProberState::Running;

        info!(
            project_id = %self.project_id,
            interval_ms = self.config.interval.as_millis() as u64,
            max_concurrent_probes = self.gate.capacity(),
            overlap = ?self.config.overlap,
            "prober started"
        );
        Ok(())
    }

    /// Next probe result, or `None` once the prober is stopped or was never started.
    pub async fn next(&mut self) -> Option<EndpointStatus> {
        match self.output.as_mut() {
            Some(output) => output.recv().await,
            None => None,
        }
    }

    /// Stop ticking, cancel in-flight probes and wait for them to finish.
    ///
    /// The output is closed before producers are cancelled and dropped only
    /// after every producer has exited. Calling `stop` again is a no-op.
    pub async fn stop(&mut self) {
        if self.state == ProberState::Stopped {
            return;
        }
        self.state = ProberState::Stopped;

        if let Some(output) = self.output.as_mut() {
            output.close();
        }
        self.shutdown.cancel();
        self.gate.close();

        if let Some(ticker) = self.ticker.take()
            && let Err(e) = ticker.await
        {
            error!(project_id = %self.project_id, error = %e, "tick loop ended abnormally");
        }

        self.tasks.close();
        self.tasks.wait().await;
        self.output = None;

        info!(project_id = %self.project_id, "prober stopped");
    }
}

impl Drop for Prober {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.gate.close();
    }
}

/// Everything a probe task needs, shared by all tasks of a prober
#[derive(Clone)]
struct ProbeContext {
    project_id: Arc<str>,
    store: TenantStore,
    probe: Arc<dyn Probe>,
    gate: ConcurrencyGate,
    ping_timeout: Duration,
    shutdown: CancellationToken,
    results: mpsc::Sender<EndpointStatus>,
}

impl ProbeContext {
    /// Probe one endpoint, record the status and publish it
    async fn execute(&self, endpoint: EndpointInfo) {
        let Ok(permit) = self.gate.acquire().await else {
            return;
        };
        let status = self.probe_catching_panics(&endpoint).await;
        permit.release();

        match self.store.update_endpoint_status(&self.project_id, &status).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(project_id = %self.project_id, endpoint_id = %endpoint.id, "endpoint removed while probing");
            }
            Err(e) => {
                warn!(project_id = %self.project_id, endpoint_id = %endpoint.id, error = %e, "failed to store probe status");
            }
        }

        if self.results.send(status).await.is_err() {
            debug!(project_id = %self.project_id, endpoint_id = %endpoint.id, "output closed, dropping result");
        }
    }

    async fn probe_catching_panics(&self, endpoint: &EndpointInfo) -> EndpointStatus {
        let started_at = Utc::now();
        let start = Instant::now();

        match AssertUnwindSafe(self.probe.probe(endpoint, self.ping_timeout)).catch_unwind().await {
            Ok(status) => status,
            Err(_) => {
                error!(project_id = %self.project_id, endpoint_id = %endpoint.id, url = %endpoint.url, "probe panicked");
                EndpointStatus::checked(endpoint.id.as_str(), ProbeStatus::Error, started_at, start.elapsed())
            }
        }
    }

    async fn run_task(self, endpoint: EndpointInfo) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = self.execute(endpoint) => {}
        }
    }
}

struct TickLoop {
    ctx: ProbeContext,
    interval: Duration,
    overlap: OverlapPolicy,
    tasks: TaskTracker,
}

impl TickLoop {
    async fn run(self) {
        let shutdown = self.ctx.shutdown.clone();
        let project_id = self.ctx.project_id.clone();

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut previous: Option<TaskTracker> = None;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if self.overlap == OverlapPolicy::Wait
                && let Some(previous) = previous.take()
            {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = previous.wait() => {}
                }
            }

            let listing = tokio::select! {
                _ = shutdown.cancelled() => break,
                listing = self.ctx.store.get_endpoints_for_monitoring(&project_id) => listing,
            };
            let endpoints = match listing {
                Ok(listing) => listing.items,
                Err(e) => {
                    warn!(project_id = %project_id, error = %e, "failed to list endpoints, skipping tick");
                    continue;
                }
            };

            debug!(project_id = %project_id, endpoints = endpoints.len(), "tick");
            let generation = TaskTracker::new();
            for endpoint in endpoints {
                let task = self.ctx.clone().run_task(endpoint);
                self.tasks.spawn(generation.track_future(task));
            }
            generation.close();
            previous = Some(generation);
        }

        debug!(project_id = %project_id, "tick loop finished");
    }
}
