//! Load generation against vector similarity search endpoints.
//!
//! A run is a set of [`VirtualUser`]s sharing one [`ClientContext`]. Each
//! user synthesizes randomized `findNeighbors` queries (or `upsertDatapoints`
//! writes), sends them over HTTP or gRPC at a controlled rate, and reports every call as a
//! [`MetricEvent`] on the configured [`EventSink`].

pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod events;
pub mod interceptor;
pub mod payload;
pub mod pool;
pub mod rate;
pub mod transport;
pub mod user;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{
    AuthSource, Config, DenseValueRange, EmbeddingKind, EmbeddingSpec, NetworkMode, Operation,
    ProtocolMode, RunConfig,
};
pub use context::ClientContext;
pub use credentials::{CredentialManager, TokenSource};
pub use error::{
    AuthError, AuthResult, CallError, CallResult, ConfigError, ConfigResult, FailureKind,
    LoadError, LoadResult,
};
pub use events::{EventBus, EventSink, MetricEvent, Protocol};
pub use interceptor::Instrumented;
pub use payload::{PayloadSynthesizer, QueryVector, RequestEnvelope, SparseVector, UpsertEnvelope};
pub use pool::ChannelPool;
pub use rate::{Pacing, RateController};
pub use transport::{
    CallTarget, DatapointWriter, GrpcTransport, HttpTransport, HttpUpsertTransport,
    NeighborSearch, ResponseSummary,
};
pub use user::{UserReport, UserState, VirtualUser};
