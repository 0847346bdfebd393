use libc::{POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT, POLLPRI, c_short, nfds_t, pollfd};
use std::io;
use std::ops::BitOr;
use std::os::fd::RawFd;
use std::time::Duration;

/// Events a registration is interested in (`poll(2)` `events`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interest(c_short);

impl Interest {
    pub const READABLE: Interest = Interest(POLLIN);
    pub const PRIORITY: Interest = Interest(POLLPRI);
    pub const WRITABLE: Interest = Interest(POLLOUT);

    /// Incoming connections on a listening socket.
    pub const ACCEPT: Interest = Interest(POLLIN | POLLPRI);

    pub fn from_bits(bits: c_short) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> c_short {
        self.0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// Events reported for a descriptor (`poll(2)` `revents`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness(c_short);

impl Readiness {
    pub fn from_bits(bits: c_short) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> c_short {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(&self) -> bool {
        self.0 & POLLIN != 0
    }

    pub fn is_priority(&self) -> bool {
        self.0 & POLLPRI != 0
    }

    pub fn is_writable(&self) -> bool {
        self.0 & POLLOUT != 0
    }

    pub fn is_error(&self) -> bool {
        self.0 & (POLLERR | POLLNVAL) != 0
    }

    pub fn is_hangup(&self) -> bool {
        self.0 & POLLHUP != 0
    }
}

/// What a poll callback is told about its descriptor.
#[derive(Debug, Clone, Copy)]
pub struct PollEvent {
    pub fd: RawFd,
    pub interest: Interest,
    pub readiness: Readiness,
}

pub(crate) fn pollfd_for(fd: RawFd, interest: Interest) -> pollfd {
    pollfd {
        fd,
        events: interest.bits(),
        revents: 0,
    }
}

/// Converts an optional wait bound to a `poll(2)` timeout.
///
/// `None` blocks indefinitely. Sub-millisecond remainders round up so a
/// short non-zero wait never turns into a busy spin.
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => {
            let mut ms = d.as_millis();
            if d.subsec_nanos() % 1_000_000 != 0 {
                ms += 1;
            }
            ms.min(i32::MAX as u128) as i32
        }
    }
}

/// One `poll(2)` call over `fds`.
///
/// `EINTR` is reported as zero ready descriptors.
pub(crate) fn wait(fds: &mut [pollfd], timeout: Option<Duration>) -> io::Result<usize> {
    let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as nfds_t, timeout_millis(timeout)) };

    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err);
    }

    Ok(ret as usize)
}

/// Waits on a single descriptor, returning its readiness (empty on timeout).
pub(crate) fn wait_one(fd: RawFd, interest: Interest, timeout: Duration) -> io::Result<Readiness> {
    let mut fds = [pollfd_for(fd, interest)];
    let n = wait(&mut fds, Some(timeout))?;

    if n == 0 {
        return Ok(Readiness::default());
    }

    Ok(Readiness::from_bits(fds[0].revents))
}

pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<libc::c_int> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    let new_flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };

    if unsafe { libc::fcntl(fd, libc::F_SETFL, new_flags) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(flags)
}

pub(crate) fn restore_flags(fd: RawFd, flags: libc::c_int) -> io::Result<()> {
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
