//! Monotonic time source and the non-blocking timeout window.
//!
//! Every wait in the crate goes through a [`Clock`] so tests can swap in a
//! [`ManualClock`] and simulate minutes of cadence without sleeping.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by [`Instant`] and [`std::thread::sleep`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Virtual clock: time only advances through `sleep` or `advance`.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *self.offset.lock() += duration;
    }

    /// Total virtual time slept so far.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Deadline measured from construction. Callers poll [`TimeoutWindow::active`]
/// inside their own loops.
#[derive(Clone)]
pub struct TimeoutWindow {
    clock: Arc<dyn Clock>,
    start: Instant,
    timeout: Duration,
}

impl TimeoutWindow {
    pub fn start(clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        let start = clock.now();
        Self {
            clock,
            start,
            timeout,
        }
    }

    pub fn active(&self) -> bool {
        self.elapsed() < self.timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.start)
    }

    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.elapsed())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl std::fmt::Debug for TimeoutWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutWindow")
            .field("elapsed", &self.elapsed())
            .field("timeout", &self.timeout)
            .finish()
    }
}
