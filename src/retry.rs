//! Bounded polling policies.
//!
//! Every wait in droidbox is a poll with a fixed interval and a fixed
//! bound: boot-wait polls until a deadline, hotplug discovery polls a fixed
//! number of attempts. Both live here as one parameter object instead of
//! hand-rolled loops at each call site.

use std::time::{Duration, Instant};

/// A fixed-interval, fixed-attempt-count retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Sleep between attempts.
    pub interval: Duration,
    /// Maximum number of attempts.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Run `f` until it yields `Some`, at most `max_attempts` times.
    ///
    /// Sleeps `interval` after every unsuccessful attempt except the last.
    /// Returns `None` once the attempt budget is exhausted.
    pub fn run<T>(&self, mut f: impl FnMut(u32) -> Option<T>) -> Option<T> {
        for attempt in 1..=self.max_attempts {
            if let Some(value) = f(attempt) {
                return Some(value);
            }
            if attempt < self.max_attempts && !self.interval.is_zero() {
                std::thread::sleep(self.interval);
            }
        }
        None
    }
}

/// A fixed-interval poll bounded by a wall-clock deadline.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    budget: Duration,
}

impl Deadline {
    /// Start a deadline of `budget` from now.
    pub fn new(budget: Duration) -> Self {
        Self {
            start: Instant::now(),
            budget,
        }
    }

    /// Whether the budget has elapsed.
    pub fn expired(&self) -> bool {
        self.start.elapsed() >= self.budget
    }

    /// Time remaining, saturating at zero.
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.start.elapsed())
    }

    /// The full budget, in whole seconds (for error reporting).
    pub fn budget_secs(&self) -> u64 {
        self.budget.as_secs()
    }
}
