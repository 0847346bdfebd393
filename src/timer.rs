//! Software timers ordered by deadline.
//!
//! A [`TimerQueue`] keeps running timers in a pending list sorted by absolute
//! deadline (ties keep their start order). Checking the queue first moves
//! every expired timer to a separate run-list, then drains that list one
//! timer at a time, clearing the timer's running flag before its callback is
//! invoked. Because of that a callback may:
//!
//! - restart itself (it is no longer running, so it goes back to the pending list)
//! - stop a sibling that expired in the same check (it is taken off the run-list and never fires)
//! - start or stop any other timer
//!
//! The queue does not wake anything up by itself; [`Daemon::run_once`](crate::Daemon::run_once)
//! clamps its wait to [`TimerQueue::time_until_next`] and checks the queue
//! after every wait.

use crate::daemon::Daemon;
use crate::time::{Clock, Timespec};
use crate::utils::slab::{Key, Slab};

use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;
use tracing::debug;

/// Callback invoked when a timer expires.
pub type TimerCallback = Rc<dyn Fn(&mut Daemon, TimerId)>;

/// Handle to a timer owned by a [`TimerQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(Key);

struct TimerEntry {
    duration: Duration,
    deadline: Timespec,
    running: bool,
    callback: TimerCallback,
}

pub struct TimerQueue {
    clock: Rc<dyn Clock>,
    timers: Slab<TimerEntry>,
    pending: VecDeque<TimerId>,
    expired: VecDeque<TimerId>,
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("timers", &self.timers.len())
            .field("pending", &self.pending.len())
            .field("expired", &self.expired.len())
            .finish()
    }
}

impl TimerQueue {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            clock,
            timers: Slab::new(),
            pending: VecDeque::new(),
            expired: VecDeque::new(),
        }
    }

    /// Creates a stopped timer with a default duration.
    pub fn create<F>(&mut self, duration: Duration, callback: F) -> TimerId
    where
        F: Fn(&mut Daemon, TimerId) + 'static,
    {
        TimerId(self.timers.insert(TimerEntry {
            duration,
            deadline: Timespec::ZERO,
            running: false,
            callback: Rc::new(callback),
        }))
    }

    /// Creates a timer and starts it right away.
    pub fn schedule<F>(&mut self, duration: Duration, callback: F) -> TimerId
    where
        F: Fn(&mut Daemon, TimerId) + 'static,
    {
        let id = self.create(duration, callback);
        self.restart(id);
        id
    }

    /// Starts `id` to fire `duration` from now.
    ///
    /// A running timer is stopped first, so starting is an idempotent restart.
    /// Returns `false` if the timer does not exist.
    pub fn start(&mut self, id: TimerId, duration: Duration) -> bool {
        match self.timers.get_mut(id.0) {
            Some(entry) => entry.duration = duration,
            None => return false,
        }
        self.restart(id)
    }

    /// Starts `id` again with its last duration.
    pub fn restart(&mut self, id: TimerId) -> bool {
        if self.is_running(id) {
            self.stop(id);
        }

        let now = self.clock.now();
        let deadline = match self.timers.get_mut(id.0) {
            Some(entry) => {
                entry.deadline = now + entry.duration;
                entry.running = true;
                entry.deadline
            }
            None => return false,
        };

        let position = self
            .pending
            .iter()
            .position(|other| self.deadline_of(*other) > deadline)
            .unwrap_or(self.pending.len());
        self.pending.insert(position, id);

        debug!(
            target: "appframe::timer",
            now = ?now,
            deadline = ?deadline,
            "timer started"
        );

        true
    }

    /// Stops `id`, whether it is pending or waiting on the run-list of an
    /// in-progress check. Stopping a timer that is not running does nothing.
    pub fn stop(&mut self, id: TimerId) {
        let deadline = match self.timers.get_mut(id.0) {
            Some(entry) if entry.running => {
                entry.running = false;
                entry.deadline
            }
            _ => return,
        };

        if let Some(position) = self.pending.iter().position(|other| *other == id) {
            self.pending.remove(position);
        } else if let Some(position) = self.expired.iter().position(|other| *other == id) {
            self.expired.remove(position);
        }

        debug!(target: "appframe::timer", deadline = ?deadline, "timer stopped");
    }

    /// Stops and forgets `id`. Returns whether it existed.
    pub fn remove(&mut self, id: TimerId) -> bool {
        self.stop(id);
        self.timers.remove(id.0).is_some()
    }

    pub fn set_duration(&mut self, id: TimerId, duration: Duration) -> bool {
        match self.timers.get_mut(id.0) {
            Some(entry) => {
                entry.duration = duration;
                true
            }
            None => false,
        }
    }

    pub fn duration(&self, id: TimerId) -> Option<Duration> {
        self.timers.get(id.0).map(|entry| entry.duration)
    }

    pub fn is_running(&self, id: TimerId) -> bool {
        self.timers.get(id.0).is_some_and(|entry| entry.running)
    }

    /// Absolute deadline of a running timer.
    pub fn deadline(&self, id: TimerId) -> Option<Timespec> {
        self.timers
            .get(id.0)
            .filter(|entry| entry.running)
            .map(|entry| entry.deadline)
    }

    pub fn next_deadline(&self) -> Option<Timespec> {
        self.pending.front().map(|id| self.deadline_of(*id))
    }

    /// Time left until the earliest pending deadline, zero if it has passed.
    pub fn time_until_next(&self) -> Option<Duration> {
        self.next_deadline()
            .map(|deadline| deadline.saturating_since(self.clock.now()))
    }

    /// Number of timers that exist, running or not.
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.len() == 0
    }

    /// Number of timers waiting in the pending list.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn now(&self) -> Timespec {
        self.clock.now()
    }

    fn deadline_of(&self, id: TimerId) -> Timespec {
        self.timers
            .get(id.0)
            .map(|entry| entry.deadline)
            .unwrap_or(Timespec::ZERO)
    }

    /// Moves every pending timer due at `now` to the end of the run-list.
    fn expire(&mut self, now: Timespec) {
        while let Some(id) = self.pending.front().copied() {
            if self.deadline_of(id) > now {
                break;
            }
            self.pending.pop_front();
            self.expired.push_back(id);
        }
    }

    /// Detaches the next timer from the run-list and marks it not running.
    fn pop_expired(&mut self) -> Option<(TimerId, TimerCallback)> {
        while let Some(id) = self.expired.pop_front() {
            if let Some(entry) = self.timers.get_mut(id.0) {
                entry.running = false;
                return Some((id, entry.callback.clone()));
            }
        }
        None
    }
}

/// Fires every expired timer of `daemon`, in deadline order.
pub(crate) fn check(daemon: &mut Daemon) -> usize {
    let now = daemon.timers().now();
    daemon.timers_mut().expire(now);

    let mut fired = 0;
    while let Some((id, callback)) = daemon.timers_mut().pop_expired() {
        callback(daemon, id);
        fired += 1;
    }

    fired
}
