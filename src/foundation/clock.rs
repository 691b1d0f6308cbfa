use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Time source for the streaming scheduler.
///
/// Timestamps (last reference, idle timers) and per-frame budgets are read through this trait so
/// eviction can be driven deterministically in tests.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    /// Create a clock frozen at the current wall-clock instant.
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Elapsed-time budget for one bounded unit of work.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    budget: Option<Duration>,
}

impl Deadline {
    /// A deadline `budget` after `start`. `None` never expires.
    pub fn new(start: Instant, budget: Option<Duration>) -> Self {
        Self { start, budget }
    }

    /// A deadline that never expires.
    pub fn unbounded() -> Self {
        Self {
            start: Instant::now(),
            budget: None,
        }
    }

    /// A wall-clock deadline starting now. A zero budget means "no limit", matching the codec
    /// convention of `decode_time == 0`.
    pub fn after(budget: Duration) -> Self {
        let budget = (!budget.is_zero()).then_some(budget);
        Self::new(Instant::now(), budget)
    }

    /// True once `now` is past the budget.
    pub fn expired_at(&self, now: Instant) -> bool {
        match self.budget {
            Some(b) => now.saturating_duration_since(self.start) > b,
            None => false,
        }
    }

    /// True once the wall clock is past the budget.
    pub fn expired(&self) -> bool {
        self.expired_at(Instant::now())
    }

    /// Time spent since the deadline started.
    pub fn elapsed_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.start)
    }
}
