//! Metric events and the sink they are delivered to.
//!
//! Every attempted query call produces exactly one [`MetricEvent`]. The core
//! never aggregates them; a downstream consumer reads them off the
//! [`EventBus`] receiver.

use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

/// Wire protocol tag carried by each event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    Grpc,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Grpc => "grpc",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome and timing of one call.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricEvent {
    pub protocol: Protocol,
    /// Operation name, e.g. `findNeighbors` or the full gRPC method path.
    pub operation: String,
    pub latency: Duration,
    pub response_bytes: usize,
    pub success: bool,
    /// Failure detail; `None` exactly when `success` is true.
    pub failure: Option<String>,
}

impl MetricEvent {
    pub fn success(
        protocol: Protocol,
        operation: impl Into<String>,
        latency: Duration,
        response_bytes: usize,
    ) -> Self {
        Self {
            protocol,
            operation: operation.into(),
            latency,
            response_bytes,
            success: true,
            failure: None,
        }
    }

    pub fn failure(
        protocol: Protocol,
        operation: impl Into<String>,
        latency: Duration,
        response_bytes: usize,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            protocol,
            operation: operation.into(),
            latency,
            response_bytes,
            success: false,
            failure: Some(detail.into()),
        }
    }

    pub fn latency_ms(&self) -> f64 {
        self.latency.as_secs_f64() * 1000.0
    }
}

/// Receives metric events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: MetricEvent);
}

/// Event sink backed by an unbounded channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<MetricEvent>,
}

impl EventBus {
    /// Creates a bus and the receiver the aggregator consumes.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<MetricEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: MetricEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("event receiver dropped, discarding metric event");
        }
    }
}
