//! Admission controls: regeneration rate limiting and the execution monitor.
//!
//! The monitor only detects and reports an exceeded budget. It cannot preempt
//! synchronous code running inside an isolated context, and it does not try
//! to: forcing execution to stop from outside is the host's teardown path.

use crate::error::PreviewError;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default minimum interval between document regenerations
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(300);

/// Default wall-clock budget for a context to reach a terminal state
pub const DEFAULT_EXECUTION_BUDGET: Duration = Duration::from_secs(5);

/// Enforces a minimum interval between accepted regenerations.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    min_interval: Duration,
    last: Option<Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Accept a regeneration now if the interval has elapsed.
    pub fn can_proceed(&mut self) -> bool {
        self.can_proceed_at(Instant::now())
    }

    pub fn can_proceed_at(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.min_interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    /// Earliest instant at which the next regeneration is accepted.
    pub fn ready_at(&self) -> Option<Instant> {
        self.last.map(|last| last + self.min_interval)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_THROTTLE)
    }
}

/// Coalesces bursts of regeneration requests, keeping only the latest.
///
/// A request is released once no newer request has arrived for the throttle
/// interval and the rate limiter accepts it. Superseded requests are dropped
/// silently.
#[derive(Debug)]
pub struct RegenerationGate<T> {
    limiter: RateLimiter,
    pending: Option<(T, Instant)>,
}

impl<T> RegenerationGate<T> {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            limiter: RateLimiter::new(min_interval),
            pending: None,
        }
    }

    /// Record `request` as the latest pending one. Returns the request it
    /// replaced, if any.
    pub fn offer(&mut self, request: T, now: Instant) -> Option<T> {
        let replaced = self.pending.replace((request, now)).map(|(old, _)| old);
        if replaced.is_some() {
            debug!("superseded pending regeneration");
        }
        replaced
    }

    /// Release the pending request if it is due.
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        let due = self.deadline().is_some_and(|deadline| now >= deadline);
        if !due || !self.limiter.can_proceed_at(now) {
            return None;
        }
        self.pending.take().map(|(request, _)| request)
    }

    /// Admit a request immediately, bypassing the quiet period. Refused while
    /// a request is pending or the limiter has not reopened.
    pub fn admit_now(&mut self, now: Instant) -> bool {
        !self.has_pending() && self.limiter.can_proceed_at(now)
    }

    /// When [`poll`](Self::poll) will next release something.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn deadline(&self) -> Option<Instant> {
        let (_, arrived) = self.pending.as_ref()?;
        let quiet = *arrived + self.limiter.min_interval();
        Some(match self.limiter.ready_at() {
            Some(ready) if ready > quiet => ready,
            _ => quiet,
        })
    }
}

/// Wall-clock budget for one execution.
#[derive(Debug, Clone)]
pub struct ExecutionMonitor {
    budget: Duration,
    started: Option<Instant>,
    warned: bool,
}

impl ExecutionMonitor {
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            started: None,
            warned: false,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn start(&mut self) {
        self.start_at(Instant::now());
    }

    pub fn start_at(&mut self, now: Instant) {
        self.started = Some(now);
        self.warned = false;
    }

    /// Time left before the budget is exceeded. `None` when not started.
    pub fn remaining_at(&self, now: Instant) -> Option<Duration> {
        self.started
            .map(|started| self.budget.saturating_sub(now.saturating_duration_since(started)))
    }

    pub fn check(&mut self) -> Result<(), PreviewError> {
        self.check_at(Instant::now())
    }

    /// Report `TimeoutWarning` once the budget is exceeded.
    pub fn check_at(&mut self, now: Instant) -> Result<(), PreviewError> {
        let Some(started) = self.started else {
            return Ok(());
        };
        let elapsed = now.saturating_duration_since(started);
        if elapsed <= self.budget {
            return Ok(());
        }
        if !self.warned {
            warn!(budget_ms = self.budget.as_millis() as u64, elapsed_ms = elapsed.as_millis() as u64, "execution budget exceeded");
            self.warned = true;
        }
        Err(PreviewError::TimeoutWarning {
            budget: self.budget,
            elapsed,
        })
    }

    pub fn has_warned(&self) -> bool {
        self.warned
    }
}

impl Default for ExecutionMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_EXECUTION_BUDGET)
    }
}
