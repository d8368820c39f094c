//! Server-sent event loop forwarding probe results to one client.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::prober::Prober;
use super::types::{MonitorError, ProberState};
use crate::domain::EndpointStatus;

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(5);

const HEARTBEAT_DATA: &str = "Heartbeat";

/// One outbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    PingResult(EndpointStatus),
    Heartbeat,
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::PingResult(_) => "pingresult",
            StreamEvent::Heartbeat => "heartbeat",
        }
    }

    /// Wire form: an `event:` line, a `data:` line and a blank line
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let data = match self {
            StreamEvent::PingResult(status) => serde_json::to_string(status)?,
            StreamEvent::Heartbeat => HEARTBEAT_DATA.to_string(),
        };
        Ok(format!("event: {}\ndata: {data}\n\n", self.name()))
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("client disconnected")]
    Closed,

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Transport an event stream is written to
#[async_trait]
pub trait EventSink: Send {
    async fn write_event(&mut self, event: &StreamEvent) -> Result<(), SinkError>;

    /// Push everything written so far to the client
    async fn flush(&mut self) -> Result<(), SinkError>;
}

/// Sink over any async byte writer
pub struct WriterSink<W> {
    writer: W,
}

impl<W> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> EventSink for WriterSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_event(&mut self, event: &StreamEvent) -> Result<(), SinkError> {
        let encoded = event.encode()?;
        self.writer.write_all(encoded.as_bytes()).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush().await?;
        Ok(())
    }
}

/// Sink that hands one chunk per flush to a channel, e.g. an HTTP response body
pub struct ChannelSink {
    tx: mpsc::Sender<Vec<u8>>,
    buffer: Vec<u8>,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its chunks
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, buffer: Vec::new() }, rx)
    }

    /// Cancel `token` as soon as the receiving end is dropped.
    ///
    /// The watcher holds a sender until `token` is cancelled, so the token
    /// has to be cancelled once the stream is over for the receiver to end.
    pub fn cancel_on_close(&self, token: CancellationToken) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tx.closed() => token.cancel(),
                _ = token.cancelled() => {}
            }
        });
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn write_event(&mut self, event: &StreamEvent) -> Result<(), SinkError> {
        if self.tx.is_closed() {
            return Err(SinkError::Closed);
        }
        self.buffer.extend_from_slice(event.encode()?.as_bytes());
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::take(&mut self.buffer);
        self.tx.send(chunk).await.map_err(|_| SinkError::Closed)
    }
}

/// Why a [`LiveStatusStream`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The caller's cancellation token fired
    Cancelled,
    /// Writing or flushing to the client failed
    TransportClosed,
    /// The prober's output ended
    ProberFinished,
}

/// Forwards one prober's results to one client, interleaved with heartbeats.
pub struct LiveStatusStream {
    prober: Prober,
    heartbeat: Duration,
}

impl LiveStatusStream {
    pub fn new(prober: Prober) -> Self {
        Self { prober, heartbeat: DEFAULT_HEARTBEAT }
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat.max(Duration::from_millis(1));
        self
    }

    /// Run until cancelled, the transport fails or the prober ends.
    ///
    /// Starts the prober unless it is already running and always stops it
    /// before returning. A stopped prober is rejected.
    pub async fn run<S>(mut self, sink: &mut S, cancel: CancellationToken) -> Result<StreamEnd, MonitorError>
    where
        S: EventSink + ?Sized,
    {
        if self.prober.state() != ProberState::Running {
            self.prober.run()?;
        }
        let project_id = self.prober.project_id().to_string();
        debug!(project_id = %project_id, heartbeat_ms = self.heartbeat.as_millis() as u64, "live status stream started");

        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let end = loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break StreamEnd::Cancelled,
                next = self.prober.next() => match next {
                    Some(status) => StreamEvent::PingResult(status),
                    None => break StreamEnd::ProberFinished,
                },
                _ = heartbeat.tick() => StreamEvent::Heartbeat,
            };

            // a client that stops reading must not hold off cancellation
            let delivered = tokio::select! {
                biased;
                _ = cancel.cancelled() => break StreamEnd::Cancelled,
                delivered = deliver(sink, &event) => delivered,
            };

            match delivered {
                Ok(()) => {
                    if matches!(event, StreamEvent::PingResult(_)) {
                        heartbeat.reset();
                    }
                }
                Err(SinkError::Encode(e)) => {
                    warn!(project_id = %project_id, error = %e, "dropping event that failed to encode");
                }
                Err(e) => {
                    debug!(project_id = %project_id, error = %e, "client transport failed");
                    break StreamEnd::TransportClosed;
                }
            }
        };

        self.prober.stop().await;
        info!(project_id = %project_id, reason = ?end, "live status stream ended");
        Ok(end)
    }
}

async fn deliver<S>(sink: &mut S, event: &StreamEvent) -> Result<(), SinkError>
where
    S: EventSink + ?Sized,
{
    sink.write_event(event).await?;
    sink.flush().await
}
