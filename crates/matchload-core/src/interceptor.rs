//! Timing and sizing wrapper around gRPC calls.
//!
//! Both call shapes emit exactly one [`MetricEvent`] per invocation. Latency
//! for a server-streaming call spans until the last message has been
//! received, and its size is the sum of every message's encoded length.

use futures::{Stream, StreamExt};
use prost::Message;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tonic::{Response, Status};

use crate::error::{CallError, CallResult};
use crate::events::{EventSink, MetricEvent, Protocol};

/// Result of a unary call that went through the interceptor.
#[derive(Debug)]
pub struct UnaryOutcome<T> {
    pub message: T,
    pub latency: Duration,
    pub response_bytes: usize,
}

/// Result of a fully drained server-streaming call.
#[derive(Debug)]
pub struct StreamOutcome<T> {
    pub messages: Vec<T>,
    pub latency: Duration,
    pub response_bytes: usize,
}

#[derive(Clone)]
pub struct Instrumented {
    sink: Arc<dyn EventSink>,
    timeout: Duration,
}

impl Instrumented {
    pub fn new(sink: Arc<dyn EventSink>, timeout: Duration) -> Self {
        Self { sink, timeout }
    }

    /// Times one unary call and reports it.
    pub async fn unary<T, F>(&self, operation: &str, call: F) -> CallResult<UnaryOutcome<T>>
    where
        T: Message,
        F: Future<Output = Result<Response<T>, Status>>,
    {
        let start = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, call).await;
        let latency = start.elapsed();

        match outcome {
            Ok(Ok(response)) => {
                let message = response.into_inner();
                let response_bytes = message.encoded_len();
                self.sink.emit(MetricEvent::success(
                    Protocol::Grpc,
                    operation,
                    latency,
                    response_bytes,
                ));
                Ok(UnaryOutcome {
                    message,
                    latency,
                    response_bytes,
                })
            }
            Ok(Err(status)) => Err(self.fail(operation, latency, CallError::from(status))),
            Err(_) => Err(self.fail(operation, latency, self.timed_out())),
        }
    }

    /// Times one server-streaming call, draining the stream before reporting.
    pub async fn server_streaming<T, S, F>(
        &self,
        operation: &str,
        call: F,
    ) -> CallResult<StreamOutcome<T>>
    where
        T: Message,
        S: Stream<Item = Result<T, Status>> + Unpin,
        F: Future<Output = Result<Response<S>, Status>>,
    {
        let start = Instant::now();
        let drain = async {
            let mut stream = call.await?.into_inner();
            let mut messages = Vec::new();
            let mut response_bytes = 0;
            while let Some(item) = stream.next().await {
                let message = item?;
                response_bytes += message.encoded_len();
                messages.push(message);
            }
            Ok::<_, Status>((messages, response_bytes))
        };
        let outcome = tokio::time::timeout(self.timeout, drain).await;
        let latency = start.elapsed();

        match outcome {
            Ok(Ok((messages, response_bytes))) => {
                self.sink.emit(MetricEvent::success(
                    Protocol::Grpc,
                    operation,
                    latency,
                    response_bytes,
                ));
                Ok(StreamOutcome {
                    messages,
                    latency,
                    response_bytes,
                })
            }
            Ok(Err(status)) => Err(self.fail(operation, latency, CallError::from(status))),
            Err(_) => Err(self.fail(operation, latency, self.timed_out())),
        }
    }

    /// Reports a call that failed before it could be dispatched.
    pub fn reject(&self, operation: &str, error: CallError) -> CallError {
        self.fail(operation, Duration::ZERO, error)
    }

    fn fail(&self, operation: &str, latency: Duration, error: CallError) -> CallError {
        tracing::debug!(
            operation,
            kind = error.kind().as_str(),
            error = %error,
            "grpc call failed"
        );
        self.sink.emit(MetricEvent::failure(
            Protocol::Grpc,
            operation,
            latency,
            0,
            error.to_string(),
        ));
        error
    }

    fn timed_out(&self) -> CallError {
        CallError::timeout(format!("deadline of {:?} exceeded", self.timeout))
    }
}
