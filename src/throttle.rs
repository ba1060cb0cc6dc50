use std::ops::ControlFlow;
use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;

const NANOS_PER_SEC: u64 = 1_000_000_000;

// Paces iterations by issuing timestamps indicating when the next
// iteration is allowed to start. Owned by a single loop, not shared.
//
// Each start is anchored to the previous actual start, so a stalled
// iteration is not followed by a burst of overdue ones.
pub struct RateLimiter {
    increment: Duration,
    last_start: Option<Instant>,
}

impl RateLimiter {
    pub fn new(ops_per_second: u64) -> Self {
        // Rounding up guarantees that ops_per_second + 1 consecutive starts
        // never fit into a single one-second window
        let increment_nanos = NANOS_PER_SEC.div_ceil(ops_per_second.max(1));
        Self {
            increment: Duration::from_nanos(increment_nanos),
            last_start: None,
        }
    }

    pub fn issue_next_start_time(&self, now: Instant) -> Instant {
        match self.last_start {
            Some(last) => now.max(last + self.increment),
            None => now,
        }
    }

    pub fn record_start(&mut self, at: Instant) {
        self.last_start = Some(at);
    }
}

/// A single iteration of a throttled loop.
#[async_trait]
pub trait Step: Send {
    /// Performs iteration number `iteration`, counting from zero.
    ///
    /// Returns ControlFlow::Break if the loop should finish.
    async fn step(&mut self, iteration: u64) -> Result<ControlFlow<()>>;
}

/// Repeatedly invokes `step` until it breaks or fails.
///
/// If `rate` is positive, no more than `rate` iterations are started
/// within any one-second window. Otherwise, iterations run back to back.
/// The limit applies to this loop only.
pub async fn throttle(rate: u64, step: &mut dyn Step) -> Result<()> {
    let mut rate_limiter = (rate > 0).then(|| RateLimiter::new(rate));
    let mut iteration = 0u64;

    loop {
        if let Some(rate_limiter) = &mut rate_limiter {
            let start_time = rate_limiter.issue_next_start_time(Instant::now());
            tokio::time::sleep_until(start_time).await;
            rate_limiter.record_start(Instant::now());
        }

        match step.step(iteration).await? {
            ControlFlow::Continue(()) => iteration += 1,
            ControlFlow::Break(()) => return Ok(()),
        }
    }
}
