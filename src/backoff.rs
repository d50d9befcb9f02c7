//! Growing wait schedule shared by submission and status polling.

use std::time::Duration;

/// Multiplicative backoff with a per-wait ceiling.
///
/// Each call to [`Backoff::next_wait`] returns the current wait and then grows
/// it by `multiplier`, never past `ceiling`. The returned sequence is
/// non-decreasing as long as `multiplier >= 1.0`.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    multiplier: f64,
    ceiling: Duration,
    elapsed: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(initial: Duration, multiplier: f64, ceiling: Duration) -> Self {
        Self {
            current: initial.min(ceiling),
            multiplier: multiplier.max(1.0),
            ceiling,
            elapsed: Duration::ZERO,
        }
    }

    /// The wait to use now. Advances the schedule.
    pub fn next_wait(&mut self) -> Duration {
        let wait = self.current;
        self.elapsed += wait;
        self.current = self.current.mul_f64(self.multiplier).min(self.ceiling);
        wait
    }

    /// The wait [`Backoff::next_wait`] would return, without advancing.
    #[must_use]
    pub fn peek(&self) -> Duration {
        self.current
    }

    /// Sum of all waits handed out so far.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}
