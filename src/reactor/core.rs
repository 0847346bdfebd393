use crate::daemon::Daemon;
use crate::error::{Error, Result};
use crate::reactor::event::{self, Interest, PollEvent, Readiness};

use libc::pollfd;
use std::any::Any;
use std::fmt;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Default number of descriptors a single dispatch cycle can wait on.
pub const DEFAULT_CAPACITY: usize = 256;

/// Callback invoked when a registered descriptor has events.
pub type PollCallback = Rc<dyn Fn(&mut Daemon, &PollEvent)>;

#[derive(Clone)]
pub(crate) struct Registration {
    fd: RawFd,
    interest: Interest,
    callback: PollCallback,
    owner: Option<Weak<dyn Any>>,
}

impl Registration {
    /// False once the owner the registration was tied to has been dropped.
    fn is_live(&self) -> bool {
        self.owner.as_ref().is_none_or(|owner| owner.strong_count() > 0)
    }
}

/// Registry of descriptors, interests and callbacks driven by `poll(2)`.
///
/// Registrations are kept in the order they were added; that is also the
/// order callbacks run in within one dispatch cycle.
pub struct Reactor {
    registry: Vec<Registration>,
    capacity: usize,
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("fds", &self.live().map(|r| r.fd).collect::<Vec<_>>())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Reactor {
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Vec::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            capacity,
        }
    }

    /// Registers `fd` for `interest`.
    ///
    /// Fails without touching the registry if `fd` is already registered or
    /// the registry is at capacity.
    pub fn add<F>(&mut self, fd: RawFd, interest: Interest, callback: F) -> Result<()>
    where
        F: Fn(&mut Daemon, &PollEvent) + 'static,
    {
        self.insert(fd, interest, Rc::new(callback), None)
    }

    /// Registers `fd` on behalf of `owner`.
    ///
    /// The registration lasts only as long as `owner`: once its last strong
    /// reference is gone the registration is dropped before the next wait or
    /// add, so a descriptor number closed together with its owner can be
    /// registered again right away.
    pub fn add_owned<F>(
        &mut self,
        fd: RawFd,
        interest: Interest,
        owner: Weak<dyn Any>,
        callback: F,
    ) -> Result<()>
    where
        F: Fn(&mut Daemon, &PollEvent) + 'static,
    {
        self.insert(fd, interest, Rc::new(callback), Some(owner))
    }

    fn insert(
        &mut self,
        fd: RawFd,
        interest: Interest,
        callback: PollCallback,
        owner: Option<Weak<dyn Any>>,
    ) -> Result<()> {
        self.prune();

        if self.contains(fd) {
            info!(target: "appframe::reactor", fd, "add poll fd: already on the list");
            return Err(Error::AlreadyRegistered(fd));
        }

        if self.registry.len() >= self.capacity {
            warn!(target: "appframe::reactor", fd, capacity = self.capacity, "add poll fd failed: too many fds");
            return Err(Error::RegistryFull {
                capacity: self.capacity,
            });
        }

        self.registry.push(Registration {
            fd,
            interest,
            callback,
            owner,
        });
        trace!(target: "appframe::reactor", fd, events = interest.bits(), "poll fd added");

        Ok(())
    }

    /// Unregisters `fd`. Returns whether it was registered.
    pub fn remove(&mut self, fd: RawFd) -> bool {
        match self.registry.iter().position(|r| r.fd == fd) {
            Some(index) => {
                let removed = self.registry.remove(index);
                trace!(target: "appframe::reactor", fd, "poll fd removed");
                removed.is_live()
            }
            None => false,
        }
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.live().any(|r| r.fd == fd)
    }

    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.live().find(|r| r.fd == fd).map(|r| r.interest)
    }

    pub fn len(&self) -> usize {
        self.live().count()
    }

    pub fn is_empty(&self) -> bool {
        self.live().next().is_none()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn live(&self) -> impl Iterator<Item = &Registration> {
        self.registry.iter().filter(|r| r.is_live())
    }

    /// Drops registrations whose owner is gone.
    fn prune(&mut self) {
        self.registry.retain(|r| {
            let live = r.is_live();
            if !live {
                debug!(target: "appframe::reactor", fd = r.fd, "owner dropped, poll fd removed");
            }
            live
        });
    }

    /// Private copy of the registrations that take part in the next wait.
    fn snapshot(&self) -> Vec<Registration> {
        self.registry.iter().take(self.capacity).cloned().collect()
    }
}

/// One dispatch cycle: snapshot, wait, invoke.
///
/// Callbacks are taken from the snapshot, never from the live registry, so
/// they may add or remove any registration (their own included) while the
/// cycle is in progress.
pub(crate) fn run(daemon: &mut Daemon, timeout: Option<Duration>) -> Result<usize> {
    daemon.reactor_mut().prune();

    if daemon.reactor().is_empty() {
        return Ok(0);
    }

    let snapshot = daemon.reactor().snapshot();
    let mut fds: Vec<pollfd> = snapshot
        .iter()
        .map(|r| event::pollfd_for(r.fd, r.interest))
        .collect();

    let ready = match event::wait(&mut fds, timeout) {
        Ok(ready) => ready,
        Err(err) => {
            debug!(target: "appframe::reactor", error = %err, "poll failed");
            return Err(err.into());
        }
    };

    if ready == 0 {
        return Ok(0);
    }

    for (registration, pfd) in snapshot.iter().zip(fds.iter()) {
        if pfd.revents == 0 {
            continue;
        }

        let event = PollEvent {
            fd: registration.fd,
            interest: registration.interest,
            readiness: Readiness::from_bits(pfd.revents),
        };
        (registration.callback)(daemon, &event);
    }

    Ok(ready)
}
