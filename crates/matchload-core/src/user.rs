//! One simulated client.
//!
//! A virtual user moves `Init -> Ready -> (Run -> Wait)* -> Stopped`. Each
//! `Run` builds a fresh payload and issues exactly one call, a query or an
//! upsert depending on the configured operation. Failures are
//! reported through the event sink and never end the loop. Stop requests and
//! the run deadline are honored at `Wait` boundaries.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::{Operation, RunConfig};
use crate::context::ClientContext;
use crate::error::{CallResult, ConfigError, FailureKind, LoadResult};
use crate::payload::PayloadSynthesizer;
use crate::rate::RateController;
use crate::transport::{
    CallTarget, GrpcTransport, HttpTransport, HttpUpsertTransport, ResponseSummary,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserState {
    Init,
    Ready,
    Run,
    Wait,
    Stopped,
}

/// Totals for one user after it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserReport {
    pub id: usize,
    pub iterations: u64,
    pub failures: u64,
}

pub struct VirtualUser {
    id: usize,
    state: UserState,
    targets: Vec<CallTarget>,
    next_target: usize,
    synthesizer: PayloadSynthesizer,
    rate: RateController,
    rng: StdRng,
}

impl VirtualUser {
    /// Acquires this user's transports from the shared context.
    ///
    /// With both protocols enabled the user alternates between them.
    pub async fn new(id: usize, ctx: &ClientContext) -> LoadResult<Self> {
        let config = ctx.config();
        let mut targets = Vec::new();
        match config.operation {
            Operation::FindNeighbors => {
                if config.protocol.uses_http() {
                    targets.push(CallTarget::Query(Arc::new(HttpTransport::from_context(ctx)?)));
                }
                if config.protocol.uses_grpc() {
                    let grpc = GrpcTransport::from_context(ctx).await?;
                    targets.push(CallTarget::Query(Arc::new(grpc)));
                }
            }
            Operation::UpsertDatapoints => {
                let upsert = HttpUpsertTransport::from_context(ctx)?;
                targets.push(CallTarget::Upsert(Arc::new(upsert)));
            }
        }
        Self::with_targets(id, config, targets, StdRng::from_entropy())
    }

    /// Builds a user over a caller-supplied call table.
    pub fn with_targets(
        id: usize,
        config: &RunConfig,
        targets: Vec<CallTarget>,
        mut rng: StdRng,
    ) -> LoadResult<Self> {
        if targets.is_empty() {
            return Err(ConfigError::invalid("a virtual user needs at least one transport").into());
        }

        let mut user = Self {
            id,
            state: UserState::Init,
            targets,
            next_target: 0,
            synthesizer: PayloadSynthesizer::new(config),
            rate: RateController::with_rng(
                config.pacing.clone(),
                StdRng::seed_from_u64(rng.gen()),
            ),
            rng,
        };
        user.state = UserState::Ready;
        Ok(user)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> UserState {
        self.state
    }

    /// Builds one payload and issues one call on the next table entry.
    pub async fn step(&mut self) -> CallResult<ResponseSummary> {
        let target = self.targets[self.next_target % self.targets.len()].clone();
        self.next_target = self.next_target.wrapping_add(1);
        match target {
            CallTarget::Query(transport) => {
                let envelope = self.synthesizer.build_envelope(&mut self.rng);
                transport.find_neighbors(&envelope).await
            }
            CallTarget::Upsert(transport) => {
                let envelope = self.synthesizer.build_upsert(&mut self.rng);
                transport.upsert_datapoints(&envelope).await
            }
        }
    }

    /// Runs until `stop` flips to true, its sender is dropped, or `deadline`
    /// passes.
    pub async fn run(
        mut self,
        mut stop: watch::Receiver<bool>,
        deadline: Option<Instant>,
    ) -> UserReport {
        let mut report = UserReport {
            id: self.id,
            iterations: 0,
            failures: 0,
        };
        tracing::debug!(user = self.id, pacing = %self.rate.pacing().description(), "user started");

        self.rate.anchor(Instant::now());
        'run: loop {
            if *stop.borrow() || deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }

            self.state = UserState::Run;
            if let Err(e) = self.step().await {
                report.failures += 1;
                if e.kind() == FailureKind::Auth {
                    tracing::warn!(user = self.id, error = %e, "call failed");
                } else {
                    tracing::debug!(user = self.id, error = %e, "call failed");
                }
            }
            report.iterations += 1;

            self.state = UserState::Wait;
            let resume_at = self.rate.next_start(Instant::now());
            loop {
                tokio::select! {
                    biased;
                    _ = until(deadline) => break 'run,
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break 'run;
                        }
                    }
                    _ = tokio::time::sleep_until(resume_at) => break,
                }
            }
        }

        self.state = UserState::Stopped;
        tracing::debug!(
            user = self.id,
            iterations = report.iterations,
            failures = report.failures,
            "user stopped"
        );
        report
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
