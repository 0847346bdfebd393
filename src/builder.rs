//! Fluent builder for [`Daemon`] construction.

use crate::daemon::Daemon;
use crate::reactor::core::{DEFAULT_CAPACITY, Reactor};
use crate::time::{Clock, MonotonicClock};
use crate::timer::TimerQueue;

use std::rc::Rc;
use std::time::Duration;

/// Default upper bound on a single wait in [`Daemon::run`].
pub const DEFAULT_WAIT: Duration = Duration::from_millis(100);

/// Builder for [`Daemon`] instances.
///
/// # Example
/// ```ignore
/// let daemon = DaemonBuilder::new()
///     .name("ledd")
///     .poll_capacity(64)
///     .build();
/// ```
pub struct DaemonBuilder {
    name: String,
    poll_capacity: usize,
    default_wait: Duration,
    clock: Rc<dyn Clock>,
}

impl Default for DaemonBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonBuilder {
    pub fn new() -> Self {
        Self {
            name: String::from("appframe"),
            poll_capacity: DEFAULT_CAPACITY,
            default_wait: DEFAULT_WAIT,
            clock: Rc::new(MonotonicClock),
        }
    }

    /// Application name, used in log lines.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Maximum number of descriptors the dispatcher accepts.
    pub fn poll_capacity(mut self, capacity: usize) -> Self {
        self.poll_capacity = capacity;
        self
    }

    /// Longest single wait performed by [`Daemon::run`].
    pub fn default_wait(mut self, wait: Duration) -> Self {
        self.default_wait = wait;
        self
    }

    /// Clock used for timer deadlines. Tests pass a
    /// [`ManualClock`](crate::time::ManualClock) here.
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Rc::new(clock);
        self
    }

    pub fn build(self) -> Daemon {
        Daemon::from_parts(
            self.name,
            Reactor::new(self.poll_capacity),
            TimerQueue::new(self.clock),
            self.default_wait,
        )
    }
}
