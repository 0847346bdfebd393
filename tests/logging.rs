use appframe::logging;
use appframe::{Daemon, Interest};

use std::time::Duration;
use tracing::Level;

#[test]
fn test_init_installs_subscriber_once() {
    assert!(logging::init(Level::TRACE));
    assert!(!logging::init(Level::INFO));
    assert!(!logging::init_from_env("appframe=debug"));

    // Logging paths run with a subscriber installed.
    let mut daemon = Daemon::new();
    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

    daemon.poll_add(fds[0], Interest::READABLE, |_, _| {}).unwrap();
    assert!(daemon.poll_add(fds[0], Interest::READABLE, |_, _| {}).is_err());
    daemon.timers_mut().schedule(Duration::ZERO, |_, _| {});
    daemon.run_once(Some(Duration::from_millis(5))).unwrap();

    unsafe {
        libc::close(fds[0]);
        libc::close(fds[1]);
    }
}
