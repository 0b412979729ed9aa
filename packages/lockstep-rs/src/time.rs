//! Time sources used to stamp commands and events.
//!
//! Only the sending side and the router read time. Event appliers must never
//! read a clock: they use the `event_time` carried by the event, which keeps
//! replay reproducible.

use std::cell::Cell;
use std::rc::Rc;

use chrono::Utc;

use crate::core::Timestamp;

/// A monotonic clock reading in nanoseconds.
pub trait TimeSource {
    /// Current time. Successive calls never go backwards.
    fn now(&self) -> Timestamp;
}

/// Wall-clock time source.
///
/// Wall time can step backwards (NTP adjustments); readings are clamped so
/// they never decrease within one instance.
#[derive(Debug, Default)]
pub struct SystemTimeSource {
    last: Cell<Timestamp>,
}

impl SystemTimeSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        let wall = Utc::now().timestamp_nanos_opt().unwrap_or(Timestamp::MAX);
        let now = wall.max(self.last.get());
        self.last.set(now);
        now
    }
}

/// A manually driven time source for tests and simulations.
///
/// Clones share the same clock, so a test can keep one handle and give
/// another to the engine.
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    now: Rc<Cell<Timestamp>>,
}

impl ManualTimeSource {
    /// Create a clock reading `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Rc::new(Cell::new(start)),
        }
    }

    /// Set the clock. Setting it backwards is ignored.
    pub fn set(&self, now: Timestamp) {
        if now > self.now.get() {
            self.now.set(now);
        }
    }

    /// Move the clock forward by `delta` nanoseconds.
    pub fn advance(&self, delta: Timestamp) {
        self.now.set(self.now.get().saturating_add(delta.max(0)));
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Timestamp {
        self.now.get()
    }
}
