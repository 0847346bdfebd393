#![allow(dead_code)]

use appframe::Daemon;

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

/// Creates a pipe, returning (read end, write end).
pub fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0i32; 2];
    let res = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(res, 0, "pipe() failed");

    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

pub fn write_byte(fd: &OwnedFd) {
    let buf = [1u8; 1];
    let wrote = unsafe { libc::write(fd.as_raw_fd(), buf.as_ptr() as *const _, 1) };
    assert_eq!(wrote, 1);
}

pub fn read_byte(fd: &OwnedFd) {
    let mut buf = [0u8; 1];
    let read = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut _, 1) };
    assert_eq!(read, 1);
}

/// Runs `cycles` short loop iterations.
pub fn pump(daemon: &mut Daemon, cycles: usize) {
    for _ in 0..cycles {
        daemon
            .run_once(Some(Duration::from_millis(20)))
            .expect("run_once failed");
    }
}

/// Runs loop iterations until `done` holds, up to a second.
pub fn pump_until(daemon: &mut Daemon, mut done: impl FnMut() -> bool) {
    for _ in 0..50 {
        if done() {
            return;
        }
        pump(daemon, 1);
    }
    assert!(done(), "condition not reached in time");
}
