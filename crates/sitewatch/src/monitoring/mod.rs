//! Monitoring engine
//!
//! - `gate`: admission gate bounding concurrent probes
//! - `pinger`: a single HTTP liveness probe
//! - `prober`: periodic fan-out over a project's endpoints
//! - `stream`: server-sent event loop for one client
pub mod gate;
pub mod pinger;
pub mod prober;
pub mod stream;
pub mod types;

pub use gate::{ConcurrencyGate, GateClosed, GatePermit};
pub use pinger::{Pinger, Probe};
pub use prober::Prober;
pub use stream::{
    ChannelSink, DEFAULT_HEARTBEAT, EventSink, LiveStatusStream, SinkError, StreamEnd, StreamEvent, WriterSink,
};
pub use types::{MonitorConfig, MonitorError, OverlapPolicy, ProberState};
