//! Wire transports for `findNeighbors` and `upsertDatapoints`.
//!
//! Each transport serializes an envelope, attaches credentials, and emits
//! exactly one metric event per call.

mod grpc;
mod http;
mod upsert;

pub use grpc::GrpcTransport;
pub use http::HttpTransport;
pub use upsert::HttpUpsertTransport;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::CallResult;
use crate::events::Protocol;
use crate::payload::{RequestEnvelope, UpsertEnvelope};

/// What a successful call returned.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseSummary {
    pub latency: Duration,
    pub response_bytes: usize,
    /// Neighbors across all queries in the request; zero for upserts.
    pub neighbor_count: usize,
}

#[async_trait]
pub trait NeighborSearch: Send + Sync {
    /// Protocol tag for events from this transport.
    fn protocol(&self) -> Protocol;

    /// Issues one query call.
    ///
    /// Failures are returned to the caller after being reported; they are
    /// never retried here.
    async fn find_neighbors(&self, envelope: &RequestEnvelope) -> CallResult<ResponseSummary>;
}

#[async_trait]
pub trait DatapointWriter: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Issues one write call. Same reporting contract as queries.
    async fn upsert_datapoints(&self, envelope: &UpsertEnvelope) -> CallResult<ResponseSummary>;
}

/// One entry of a virtual user's call table.
#[derive(Clone)]
pub enum CallTarget {
    Query(Arc<dyn NeighborSearch>),
    Upsert(Arc<dyn DatapointWriter>),
}

impl CallTarget {
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Query(t) => t.protocol(),
            Self::Upsert(t) => t.protocol(),
        }
    }
}
