//! Explicit daemon context.
//!
//! A [`Daemon`] owns the poll dispatcher and the timer queue. Every callback
//! the framework invokes receives `&mut Daemon`, which is how a callback adds
//! or removes registrations, starts or stops timers, closes connections, or
//! asks the loop to stop.

use crate::builder::DaemonBuilder;
use crate::error::Result;
use crate::reactor::core::{self as dispatch, Reactor};
use crate::reactor::event::{Interest, PollEvent};
use crate::timer::{self, TimerQueue};

use std::any::Any;
use std::os::fd::RawFd;
use std::rc::Weak;
use std::time::Duration;
use tracing::{debug, info};

pub struct Daemon {
    name: String,
    reactor: Reactor,
    timers: TimerQueue,
    default_wait: Duration,
    stop_requested: bool,
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

impl Daemon {
    /// Creates a daemon with the default configuration.
    pub fn new() -> Self {
        DaemonBuilder::new().build()
    }

    pub fn builder() -> DaemonBuilder {
        DaemonBuilder::new()
    }

    pub(crate) fn from_parts(
        name: String,
        reactor: Reactor,
        timers: TimerQueue,
        default_wait: Duration,
    ) -> Self {
        Self {
            name,
            reactor,
            timers,
            default_wait,
            stop_requested: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub fn reactor_mut(&mut self) -> &mut Reactor {
        &mut self.reactor
    }

    pub fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    pub fn timers_mut(&mut self) -> &mut TimerQueue {
        &mut self.timers
    }

    /// Registers `fd` with the dispatcher. See [`Reactor::add`].
    pub fn poll_add<F>(&mut self, fd: RawFd, interest: Interest, callback: F) -> Result<()>
    where
        F: Fn(&mut Daemon, &PollEvent) + 'static,
    {
        self.reactor.add(fd, interest, callback)
    }

    /// Registers `fd` for as long as `owner` is alive. See [`Reactor::add_owned`].
    pub fn poll_add_owned<F>(
        &mut self,
        fd: RawFd,
        interest: Interest,
        owner: Weak<dyn Any>,
        callback: F,
    ) -> Result<()>
    where
        F: Fn(&mut Daemon, &PollEvent) + 'static,
    {
        self.reactor.add_owned(fd, interest, owner, callback)
    }

    pub fn poll_remove(&mut self, fd: RawFd) -> bool {
        self.reactor.remove(fd)
    }

    /// Runs one dispatch cycle, waiting at most `timeout` (`None` waits
    /// forever). Returns the number of descriptors that had events.
    ///
    /// Returns immediately with 0 when nothing is registered. A wait
    /// interrupted by a signal counts as 0 events.
    pub fn poll_run(&mut self, timeout: Option<Duration>) -> Result<usize> {
        dispatch::run(self, timeout)
    }

    /// Fires all expired timers. Returns how many callbacks ran.
    pub fn timer_check(&mut self) -> usize {
        timer::check(self)
    }

    /// One loop iteration: wait for descriptors (never past the next timer
    /// deadline), then fire expired timers.
    ///
    /// With nothing registered the wait becomes a plain sleep; with nothing
    /// registered, no timer pending and no bound, it returns at once.
    pub fn run_once(&mut self, max_wait: Option<Duration>) -> Result<usize> {
        let wait = match (max_wait, self.timers.time_until_next()) {
            (Some(max), Some(next)) => Some(max.min(next)),
            (max, next) => max.or(next),
        };

        let events = if self.reactor.is_empty() {
            if let Some(wait) = wait {
                std::thread::sleep(wait);
            }
            0
        } else {
            self.poll_run(wait)?
        };

        self.timer_check();

        Ok(events)
    }

    /// Runs the loop until [`shutdown`](Self::shutdown) is requested.
    ///
    /// A failing wait is returned to the caller; the daemon never exits the
    /// process on its own.
    pub fn run(&mut self) -> Result<()> {
        info!(target: "appframe::reactor", name = %self.name, "daemon loop started");
        self.stop_requested = false;

        while !self.stop_requested {
            let wait = self.default_wait;
            self.run_once(Some(wait))?;
        }

        debug!(target: "appframe::reactor", name = %self.name, "daemon loop stopped");
        Ok(())
    }

    /// Asks [`run`](Self::run) to return after the current iteration.
    pub fn shutdown(&mut self) {
        self.stop_requested = true;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.stop_requested
    }
}
