//! Per-user pacing.
//!
//! Constant throughput keeps an absolute schedule anchored to scheduled
//! start times, so call latency below the interval never erodes the rate.
//! When a call overruns, the backlog carried forward is clamped to a single
//! interval: the user catches up by at most one immediate call instead of
//! bursting.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::time::Instant;

/// Longest gap constant throughput may schedule between two calls.
pub const MAX_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// How a virtual user spaces its calls.
#[derive(Debug, Clone, PartialEq)]
pub enum Pacing {
    /// Target a fixed number of queries per second.
    ConstantThroughput { qps: f64 },
    /// Sleep a random duration in `[min, max]` after each call.
    ThinkTime { min: Duration, max: Duration },
}

impl Pacing {
    pub fn description(&self) -> String {
        match self {
            Self::ConstantThroughput { qps } => format!("constant {qps} QPS per user"),
            Self::ThinkTime { min, max } => format!("think time {min:?}-{max:?}"),
        }
    }
}

/// Paces one virtual user. Not shared between users.
#[derive(Debug)]
pub struct RateController {
    pacing: Pacing,
    last_scheduled: Option<Instant>,
    rng: StdRng,
}

impl RateController {
    pub fn new(pacing: Pacing) -> Self {
        Self::with_rng(pacing, StdRng::from_entropy())
    }

    /// Creates a controller with a caller-supplied RNG (seeded in tests).
    pub fn with_rng(pacing: Pacing, rng: StdRng) -> Self {
        Self {
            pacing,
            last_scheduled: None,
            rng,
        }
    }

    pub fn pacing(&self) -> &Pacing {
        &self.pacing
    }

    /// Scheduling interval for constant throughput, at most [`MAX_INTERVAL`].
    pub fn interval(&self) -> Option<Duration> {
        match self.pacing {
            Pacing::ConstantThroughput { qps } if qps > 0.0 => Some(interval_for(qps)),
            _ => None,
        }
    }

    /// Anchors the schedule at the start of the first call.
    pub fn anchor(&mut self, now: Instant) {
        self.last_scheduled = Some(now);
    }

    /// Computes how long to wait at `now` and advances the schedule.
    ///
    /// Never negative; zero when the user is behind schedule.
    pub fn next_delay(&mut self, now: Instant) -> Duration {
        match self.pacing {
            Pacing::ThinkTime { min, max } => self.rng.gen_range(min..=max),
            Pacing::ConstantThroughput { .. } => {
                let Some(interval) = self.interval() else {
                    return Duration::ZERO;
                };
                let last = self.last_scheduled.unwrap_or(now);
                let next = last + interval;
                let floor = now.checked_sub(interval).unwrap_or(now);
                let scheduled = next.max(floor);
                self.last_scheduled = Some(scheduled);
                scheduled.saturating_duration_since(now)
            }
        }
    }

    /// Instant the next call should start, advancing the schedule.
    pub fn next_start(&mut self, now: Instant) -> Instant {
        now + self.next_delay(now)
    }

    /// Sleeps until the next scheduled call. Returns the slept duration.
    pub async fn wait(&mut self) -> Duration {
        let delay = self.next_delay(Instant::now());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        delay
    }
}

/// Gap between calls at `qps`, clamped to [`MAX_INTERVAL`].
pub fn interval_for(qps: f64) -> Duration {
    Duration::try_from_secs_f64(1.0 / qps).map_or(MAX_INTERVAL, |d| d.min(MAX_INTERVAL))
}
