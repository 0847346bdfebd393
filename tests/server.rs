mod common;

use appframe::{Daemon, Error, Interest, ServerBuilder, StaticServices, TcpServer};
use common::{pipe, pump, pump_until};

use std::cell::Cell;
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

fn start(daemon: &mut Daemon, builder: ServerBuilder) -> (TcpServer, SocketAddr) {
    let server = builder.port(0).local(true).build();
    server.start(daemon).unwrap();

    let port = server.local_addr().unwrap().port();
    (server, SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();
    stream
}

/// Reads from `stream` while pumping the daemon until `expected` shows up.
fn read_until(daemon: &mut Daemon, stream: &mut TcpStream, expected: &str) -> String {
    stream
        .set_read_timeout(Some(Duration::from_millis(10)))
        .unwrap();

    let mut received = String::new();
    let mut buf = [0u8; 256];

    for _ in 0..100 {
        if received.contains(expected) {
            return received;
        }
        pump(daemon, 1);
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => received.push_str(&String::from_utf8_lossy(&buf[..n])),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(err) => panic!("read failed: {err}"),
        }
    }

    assert!(received.contains(expected), "expected {expected:?}, got {received:?}");
    received
}

fn at_eof(stream: &mut TcpStream) -> bool {
    stream
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return true,
            Ok(_) => continue,
            Err(err) if err.kind() == ErrorKind::ConnectionReset => return true,
            Err(_) => return false,
        }
    }
}

#[test]
fn test_new_client_gets_prompt() {
    let mut daemon = Daemon::new();
    let (server, addr) = start(&mut daemon, ServerBuilder::new().prompt("test>"));

    assert!(server.is_listening());
    assert_eq!(server.prompt().as_deref(), Some("test>"));

    let mut client = connect(addr);
    let greeting = read_until(&mut daemon, &mut client, "test>");

    assert_eq!(greeting, "test>");
    assert_eq!(server.num_connections(), 1);
}

#[test]
fn test_command_handler_replies() {
    let mut daemon = Daemon::new();
    let (server, addr) = start(
        &mut daemon,
        ServerBuilder::new()
            .prompt("echo>")
            .command_handler(|_, command, cnx| {
                cnx.write_str(&format!("you said {}\n", command.trim_end()))
                    .unwrap();
                cnx.send_prompt().unwrap();
            }),
    );

    let mut client = connect(addr);
    read_until(&mut daemon, &mut client, "echo>");

    client.write_all(b"hello\n").unwrap();
    let reply = read_until(&mut daemon, &mut client, "echo>");

    assert_eq!(reply, "you said hello\necho>");
    assert_eq!(server.num_connections(), 1);
}

#[test]
fn test_partial_line_flushed_before_prompt() {
    let mut daemon = Daemon::new();
    let (_server, addr) = start(
        &mut daemon,
        ServerBuilder::new()
            .prompt("p>")
            .command_handler(|_, _, cnx| {
                cnx.write_str("no newline").unwrap();
                cnx.send_prompt().unwrap();
            }),
    );

    let mut client = connect(addr);
    read_until(&mut daemon, &mut client, "p>");

    client.write_all(b"x\n").unwrap();
    assert_eq!(read_until(&mut daemon, &mut client, "p>"), "no newlinep>");
}

#[test]
fn test_admission_control() {
    let mut daemon = Daemon::new();
    let (server, addr) = start(
        &mut daemon,
        ServerBuilder::new().prompt("adm>").max_connections(2),
    );
    assert_eq!(server.max_connections(), 2);

    let mut first = connect(addr);
    read_until(&mut daemon, &mut first, "adm>");
    let mut second = connect(addr);
    read_until(&mut daemon, &mut second, "adm>");
    assert_eq!(server.num_connections(), 2);

    let mut third = connect(addr);
    pump(&mut daemon, 5);

    assert_eq!(server.num_connections(), 2);
    assert!(at_eof(&mut third));

    // Room opens up once a client leaves.
    drop(first);
    pump_until(&mut daemon, || server.num_connections() == 1);

    let mut fourth = connect(addr);
    read_until(&mut daemon, &mut fourth, "adm>");
    assert_eq!(server.num_connections(), 2);
}

#[test]
fn test_peer_close_runs_disconnect_handler() {
    let mut daemon = Daemon::new();
    let closed = Rc::new(Cell::new(0));
    let closed2 = closed.clone();

    let (server, addr) = start(
        &mut daemon,
        ServerBuilder::new().prompt("bye>").on_connect(move |_, cnx| {
            let closed = closed2.clone();
            cnx.set_disconnect_handler(move |_, cnx| {
                assert!(cnx.is_open());
                closed.set(closed.get() + 1);
            });
        }),
    );

    let mut client = connect(addr);
    read_until(&mut daemon, &mut client, "bye>");
    let fd = server.connections()[0].fd();
    assert!(daemon.reactor().contains(fd));

    drop(client);
    pump_until(&mut daemon, || server.num_connections() == 0);

    assert_eq!(closed.get(), 1);
    assert!(!daemon.reactor().contains(fd));
}

#[test]
fn test_server_side_disconnect() {
    let mut daemon = Daemon::new();
    let (server, addr) = start(
        &mut daemon,
        ServerBuilder::new()
            .prompt("q>")
            .command_handler(|daemon, command, cnx| {
                if command.trim() == "quit" {
                    cnx.write_str("goodbye\n").unwrap();
                    cnx.disconnect(daemon);
                    assert!(!cnx.is_open());
                    assert!(cnx.write_str("late").unwrap_err().is_closed());
                }
            }),
    );

    let mut client = connect(addr);
    read_until(&mut daemon, &mut client, "q>");

    client.write_all(b"quit\n").unwrap();
    read_until(&mut daemon, &mut client, "goodbye\n");

    assert_eq!(server.num_connections(), 0);
    assert!(at_eof(&mut client));
}

#[test]
fn test_user_data_per_connection() {
    let mut daemon = Daemon::new();
    let (server, addr) = start(
        &mut daemon,
        ServerBuilder::new()
            .prompt("n>")
            .on_connect(|_, cnx| cnx.set_user_data(0u32))
            .command_handler(|_, _, cnx| {
                let count = cnx.with_user_data(|n: &mut u32| {
                    *n += 1;
                    *n
                });
                cnx.write_str(&format!("{}\n", count.unwrap_or(0))).unwrap();
                cnx.send_prompt().unwrap();
            }),
    );

    let mut a = connect(addr);
    read_until(&mut daemon, &mut a, "n>");
    let mut b = connect(addr);
    read_until(&mut daemon, &mut b, "n>");

    a.write_all(b"x\n").unwrap();
    assert_eq!(read_until(&mut daemon, &mut a, "n>"), "1\nn>");
    a.write_all(b"x\n").unwrap();
    assert_eq!(read_until(&mut daemon, &mut a, "n>"), "2\nn>");
    b.write_all(b"x\n").unwrap();
    assert_eq!(read_until(&mut daemon, &mut b, "n>"), "1\nn>");

    let cnx = &server.connections()[0];
    assert_eq!(cnx.take_user_data::<String>(), None);
    assert_eq!(cnx.take_user_data::<u32>(), Some(2));
}

#[test]
fn test_connection_handles() {
    let mut daemon = Daemon::new();
    let (server, addr) = start(&mut daemon, ServerBuilder::new().prompt("h>"));

    let mut client = connect(addr);
    read_until(&mut daemon, &mut client, "h>");

    let connections = server.connections();
    assert_eq!(connections.len(), 1);

    let cnx = &connections[0];
    assert!(cnx.is_open());
    assert_eq!(cnx.peer_addr(), Some(client.local_addr().unwrap()));
    assert!(cnx.server().is_some());
    assert_eq!(cnx, &server.connections()[0]);
}

#[test]
fn test_stop_closes_everything() {
    let mut daemon = Daemon::new();
    let (server, addr) = start(&mut daemon, ServerBuilder::new().prompt("s>"));

    let mut a = connect(addr);
    read_until(&mut daemon, &mut a, "s>");
    let mut b = connect(addr);
    read_until(&mut daemon, &mut b, "s>");

    server.stop(&mut daemon);

    assert!(!server.is_listening());
    assert_eq!(server.num_connections(), 0);
    assert!(daemon.reactor().is_empty());
    assert!(at_eof(&mut a));
    assert!(at_eof(&mut b));
    assert!(TcpStream::connect(addr).is_err());
}

#[test]
fn test_start_twice_fails() {
    let mut daemon = Daemon::new();
    let (server, _addr) = start(&mut daemon, ServerBuilder::new().prompt("t>"));

    assert!(matches!(
        server.start(&mut daemon),
        Err(Error::AlreadyRegistered(_))
    ));
}

#[test]
fn test_service_directory_supplies_prompt() {
    let mut daemon = Daemon::new();
    let services = StaticServices::new().with("ledd", 0, Some("ledd>"));
    let (server, addr) = start(
        &mut daemon,
        ServerBuilder::new().service("ledd").directory(services),
    );

    assert_eq!(server.prompt().as_deref(), Some("ledd>"));

    let mut client = connect(addr);
    read_until(&mut daemon, &mut client, "ledd>");
}

#[test]
fn test_service_without_prompt_alias() {
    let mut daemon = Daemon::new();
    let services = StaticServices::new().with("statd", 0, None);
    let (server, _addr) = start(
        &mut daemon,
        ServerBuilder::new().service("statd").directory(services),
    );

    assert_eq!(server.prompt().as_deref(), Some("statd>"));
}

#[test]
fn test_unknown_service_falls_back_to_explicit_config() {
    let mut daemon = Daemon::new();
    let (server, _addr) = start(
        &mut daemon,
        ServerBuilder::new()
            .service("nope")
            .prompt("fb>")
            .directory(StaticServices::new()),
    );

    assert_eq!(server.prompt().as_deref(), Some("fb>"));
}

#[test]
fn test_unknown_service_without_fallback() {
    let mut daemon = Daemon::new();
    let server = ServerBuilder::new()
        .service("nope")
        .directory(StaticServices::new())
        .build();

    assert!(matches!(
        server.start(&mut daemon),
        Err(Error::ServiceNotFound(name)) if name == "nope"
    ));
    assert!(!server.is_listening());
    assert!(daemon.reactor().is_empty());
}

#[test]
fn test_missing_prompt() {
    let mut daemon = Daemon::new();
    let server = ServerBuilder::new().port(0).build();

    assert!(matches!(
        server.start(&mut daemon),
        Err(Error::NotConfigured(_))
    ));
}

#[test]
fn test_dropped_server_retires_registrations() {
    let mut daemon = Daemon::new();
    let (rx, _tx) = pipe();
    daemon
        .poll_add(rx.as_raw_fd(), Interest::READABLE, |_, _| {})
        .unwrap();

    let (server, addr) = start(&mut daemon, ServerBuilder::new().prompt("d>"));
    let mut client = connect(addr);
    read_until(&mut daemon, &mut client, "d>");
    assert_eq!(daemon.reactor().len(), 3);

    drop(server);
    assert_eq!(daemon.reactor().len(), 1);
    assert!(at_eof(&mut client));

    // The closed sockets are not polled: the wait runs its full length.
    let began = Instant::now();
    assert_eq!(daemon.poll_run(Some(Duration::from_millis(50))).unwrap(), 0);
    assert!(began.elapsed() >= Duration::from_millis(40));

    // Reused descriptor numbers register cleanly.
    let (again, addr) = start(&mut daemon, ServerBuilder::new().prompt("d>"));
    let mut client = connect(addr);
    read_until(&mut daemon, &mut client, "d>");
    assert_eq!(again.num_connections(), 1);
}

#[test]
fn test_invalid_utf8_is_replaced() {
    let mut daemon = Daemon::new();
    let (_server, addr) = start(
        &mut daemon,
        ServerBuilder::new()
            .prompt("u>")
            .command_handler(|_, command, cnx| {
                cnx.write_str(&format!("[{}]\n", command.trim_end())).unwrap();
                cnx.send_prompt().unwrap();
            }),
    );

    let mut client = connect(addr);
    read_until(&mut daemon, &mut client, "u>");

    client.write_all(b"caf\xff\n").unwrap();
    assert_eq!(
        read_until(&mut daemon, &mut client, "u>"),
        "[caf\u{FFFD}]\nu>"
    );
}
