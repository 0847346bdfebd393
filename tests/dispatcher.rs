mod common;

use appframe::{Daemon, Error, Interest};
use common::{pipe, read_byte, write_byte};

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

#[test]
fn test_readable_pipe_invokes_callback() {
    let mut daemon = Daemon::new();
    let (rx, tx) = pipe();
    let fired = Rc::new(Cell::new(0));
    let fired2 = fired.clone();

    daemon
        .poll_add(rx.as_raw_fd(), Interest::READABLE, move |_, event| {
            assert!(event.readiness.is_readable());
            fired2.set(fired2.get() + 1);
        })
        .unwrap();

    write_byte(&tx);

    let ready = daemon.poll_run(Some(Duration::from_millis(100))).unwrap();
    assert_eq!(ready, 1);
    assert_eq!(fired.get(), 1);
}

#[test]
fn test_poll_timeout_without_events() {
    let mut daemon = Daemon::new();
    let (rx, _tx) = pipe();

    daemon
        .poll_add(rx.as_raw_fd(), Interest::READABLE, |_, _| {
            panic!("nothing was written");
        })
        .unwrap();

    let start = Instant::now();
    let ready = daemon.poll_run(Some(Duration::from_millis(30))).unwrap();

    assert_eq!(ready, 0);
    assert!(start.elapsed() >= Duration::from_millis(25));
}

#[test]
fn test_empty_registry_returns_immediately() {
    let mut daemon = Daemon::new();

    let start = Instant::now();
    assert_eq!(daemon.poll_run(None).unwrap(), 0);
    assert!(start.elapsed() < Duration::from_millis(50));
}

#[test]
fn test_duplicate_registration_rejected() {
    let mut daemon = Daemon::new();
    let (rx, tx) = pipe();
    let fd = rx.as_raw_fd();
    let hits = Rc::new(RefCell::new(Vec::new()));

    let first = hits.clone();
    daemon
        .poll_add(fd, Interest::READABLE, move |_, _| first.borrow_mut().push("first"))
        .unwrap();

    let second = hits.clone();
    let err = daemon
        .poll_add(fd, Interest::WRITABLE, move |_, _| second.borrow_mut().push("second"))
        .unwrap_err();

    assert!(matches!(err, Error::AlreadyRegistered(dup) if dup == fd));
    assert_eq!(daemon.reactor().len(), 1);
    assert_eq!(daemon.reactor().interest(fd), Some(Interest::READABLE));

    // The original registration is untouched and still delivers events.
    write_byte(&tx);
    assert_eq!(daemon.poll_run(Some(Duration::from_millis(100))).unwrap(), 1);
    assert_eq!(*hits.borrow(), vec!["first"]);
}

#[test]
fn test_registry_capacity() {
    let mut daemon = Daemon::builder().poll_capacity(2).build();
    let pipes: Vec<_> = (0..3).map(|_| pipe()).collect();
    let fired = Rc::new(RefCell::new(Vec::new()));

    for (i, (rx, _)) in pipes.iter().enumerate().take(2) {
        let fired = fired.clone();
        daemon
            .poll_add(rx.as_raw_fd(), Interest::READABLE, move |_, _| {
                fired.borrow_mut().push(i)
            })
            .unwrap();
    }

    let rejected = fired.clone();
    let err = daemon
        .poll_add(pipes[2].0.as_raw_fd(), Interest::READABLE, move |_, _| {
            rejected.borrow_mut().push(2)
        })
        .unwrap_err();

    assert!(matches!(err, Error::RegistryFull { capacity: 2 }));
    assert!(!daemon.reactor().contains(pipes[2].0.as_raw_fd()));

    // Both surviving registrations still fire; the rejected one never does.
    for (_, tx) in &pipes {
        write_byte(tx);
    }
    assert_eq!(daemon.poll_run(Some(Duration::from_millis(100))).unwrap(), 2);
    assert_eq!(*fired.borrow(), vec![0, 1]);
    for (rx, _) in pipes.iter().take(2) {
        read_byte(rx);
    }

    // Freeing a slot makes room again.
    assert!(daemon.poll_remove(pipes[0].0.as_raw_fd()));
    daemon
        .poll_add(pipes[2].0.as_raw_fd(), Interest::READABLE, |_, _| {})
        .unwrap();
}

#[test]
fn test_remove_unknown_fd() {
    let mut daemon = Daemon::new();
    assert!(!daemon.poll_remove(12345));
}

#[test]
fn test_callbacks_run_in_registration_order() {
    let mut daemon = Daemon::new();
    let order = Rc::new(RefCell::new(Vec::new()));
    let pipes: Vec<_> = (0..3).map(|_| pipe()).collect();

    for (i, (rx, tx)) in pipes.iter().enumerate() {
        let order = order.clone();
        daemon
            .poll_add(rx.as_raw_fd(), Interest::READABLE, move |_, _| {
                order.borrow_mut().push(i);
            })
            .unwrap();
        write_byte(tx);
    }

    assert_eq!(daemon.poll_run(Some(Duration::from_millis(100))).unwrap(), 3);
    assert_eq!(*order.borrow(), vec![0, 1, 2]);
}

#[test]
fn test_callback_removes_other_registration() {
    let mut daemon = Daemon::new();
    let (rx1, tx1) = pipe();
    let (rx2, tx2) = pipe();
    let fd2 = rx2.as_raw_fd();
    let second = Rc::new(Cell::new(0));
    let second2 = second.clone();

    daemon
        .poll_add(rx1.as_raw_fd(), Interest::READABLE, move |daemon, _| {
            daemon.poll_remove(fd2);
        })
        .unwrap();
    daemon
        .poll_add(fd2, Interest::READABLE, move |_, _| {
            second2.set(second2.get() + 1);
        })
        .unwrap();

    write_byte(&tx1);
    write_byte(&tx2);

    // Both were ready when the cycle started; the snapshot still delivers the second.
    daemon.poll_run(Some(Duration::from_millis(100))).unwrap();
    assert_eq!(second.get(), 1);
    assert!(!daemon.reactor().contains(fd2));

    daemon.poll_run(Some(Duration::from_millis(20))).unwrap();
    assert_eq!(second.get(), 1);
}

#[test]
fn test_callback_removes_itself_and_registers_another() {
    let mut daemon = Daemon::new();
    let (rx1, tx1) = pipe();
    let (rx2, tx2) = pipe();
    let fd1 = rx1.as_raw_fd();
    let fd2 = rx2.as_raw_fd();
    let hits = Rc::new(Cell::new(0));
    let hits2 = hits.clone();

    daemon
        .poll_add(fd1, Interest::READABLE, move |daemon, _| {
            daemon.poll_remove(fd1);
            let hits = hits2.clone();
            daemon
                .poll_add(fd2, Interest::READABLE, move |_, _| hits.set(hits.get() + 1))
                .unwrap();
        })
        .unwrap();

    write_byte(&tx1);
    daemon.poll_run(Some(Duration::from_millis(100))).unwrap();
    assert!(!daemon.reactor().contains(fd1));
    assert!(daemon.reactor().contains(fd2));

    write_byte(&tx2);
    daemon.poll_run(Some(Duration::from_millis(100))).unwrap();
    assert_eq!(hits.get(), 1);
}

#[test]
fn test_writable_interest() {
    let mut daemon = Daemon::new();
    let (_rx, tx) = pipe();
    let writable = Rc::new(Cell::new(false));
    let writable2 = writable.clone();

    daemon
        .poll_add(tx.as_raw_fd(), Interest::WRITABLE, move |_, event| {
            writable2.set(event.readiness.is_writable());
        })
        .unwrap();

    daemon.poll_run(Some(Duration::from_millis(100))).unwrap();
    assert!(writable.get());
}

#[test]
fn test_run_until_shutdown() {
    let mut daemon = Daemon::builder()
        .name("dispatch-test")
        .default_wait(Duration::from_millis(10))
        .build();
    let (rx, tx) = pipe();
    let rx = Rc::new(rx);
    let rx2 = rx.clone();

    daemon
        .poll_add(rx.as_raw_fd(), Interest::READABLE, move |daemon, _| {
            read_byte(&rx2);
            daemon.shutdown();
        })
        .unwrap();

    write_byte(&tx);
    daemon.run().unwrap();

    assert!(daemon.is_shutting_down());
    assert_eq!(daemon.name(), "dispatch-test");
}

#[test]
fn test_owned_registration_ends_with_owner() {
    let mut daemon = Daemon::new();
    let (rx, tx) = pipe();
    let fd = rx.as_raw_fd();
    let owner: Rc<dyn Any> = Rc::new(());

    daemon
        .poll_add_owned(fd, Interest::READABLE, Rc::downgrade(&owner), |_, _| {
            panic!("owner is gone");
        })
        .unwrap();
    assert!(daemon.reactor().contains(fd));

    drop(owner);
    assert!(!daemon.reactor().contains(fd));
    assert!(daemon.reactor().is_empty());

    // Not polled any more, even though the pipe is readable.
    write_byte(&tx);
    assert_eq!(daemon.poll_run(Some(Duration::from_millis(20))).unwrap(), 0);

    // The descriptor can be registered again straight away.
    let hits = Rc::new(Cell::new(0));
    let hits2 = hits.clone();
    daemon
        .poll_add(fd, Interest::READABLE, move |_, _| hits2.set(hits2.get() + 1))
        .unwrap();
    assert_eq!(daemon.poll_run(Some(Duration::from_millis(100))).unwrap(), 1);
    assert_eq!(hits.get(), 1);
}
