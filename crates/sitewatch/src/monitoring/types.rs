use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What a tick does when the previous tick's probes are still running
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Fan out immediately; probes of consecutive ticks may overlap
    #[default]
    Allow,
    /// Wait for the previous tick's probes before fanning out
    Wait,
}

/// Settings of one [`Prober`](super::Prober)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Time between two ticks
    pub interval: Duration,

    /// Deadline of a single probe
    pub ping_timeout: Duration,

    /// Probes of one prober allowed inside the network call at once
    pub max_concurrent_probes: usize,

    pub overlap: OverlapPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(5),
            max_concurrent_probes: 3,
            overlap: OverlapPolicy::Allow,
        }
    }
}

/// Lifecycle of a prober. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProberState {
    Idle,
    Running,
    Stopped,
}

impl fmt::Display for ProberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProberState::Idle => "idle",
            ProberState::Running => "running",
            ProberState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("prober for project {project_id} is {state}, expected idle")]
    NotIdle { project_id: String, state: ProberState },

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}
