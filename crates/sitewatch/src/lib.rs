//! Sitewatch - tenant-scoped uptime probing with live status streaming
//!
//! Projects own endpoints and API keys. A [`Prober`] periodically probes the
//! endpoints of one project with bounded concurrency, writes the latest status
//! back to the [`TenantStore`] and emits every result onto a single output
//! stream, which a [`LiveStatusStream`] forwards to a connected client as
//! server-sent events.

pub mod domain;
pub mod error;
pub mod kv;
pub mod monitoring;
pub mod storage;
pub mod validation;

pub use domain::{ApiKey, Endpoint, EndpointInfo, EndpointStatus, KeyType, NewEndpoint, ProbeStatus, Project};
pub use error::{Result, StoreError};
pub use kv::{KvError, KvStore, LibsqlKv, MemoryKv, Transaction};
pub use monitoring::{
    ChannelSink, ConcurrencyGate, EventSink, LiveStatusStream, MonitorConfig, MonitorError,
    OverlapPolicy, Pinger, Probe, Prober, ProberState, StreamEnd, StreamEvent,
};
pub use storage::{Listing, StoreLimits, TenantStore};
