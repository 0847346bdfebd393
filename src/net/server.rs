//! Prompt-oriented TCP server.
//!
//! The server listens on a TCP port, admits up to `max_connections` clients,
//! greets each one with the prompt and hands every chunk of received text to
//! the command handler.
//!
//! # Usage
//!
//! ```ignore
//! use appframe::{Daemon, ServerBuilder};
//!
//! let mut daemon = Daemon::new();
//! let server = ServerBuilder::new()
//!     .port(4000)
//!     .prompt("ledd>")
//!     .max_connections(4)
//!     .command_handler(|_daemon, command, cnx| {
//!         let _ = cnx.write_str(&format!("you said {command}"));
//!         let _ = cnx.send_prompt();
//!     })
//!     .build();
//!
//! server.start(&mut daemon)?;
//! daemon.run()?;
//! ```

use crate::daemon::Daemon;
use crate::error::{Error, Result};
use crate::net::connection::{Connection, ConnectionState};
use crate::net::services::{EtcServices, ServiceDirectory};
use crate::net::utils;
use crate::reactor::event::{self, Interest, PollEvent};

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::io::{LineWriter, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use tracing::{debug, error, info, warn};

/// Default connection cap.
pub const DEFAULT_MAX_CONNECTIONS: usize = 16;

/// Size of the per-event read buffer for client commands.
const READ_CHUNK: usize = 2048;

/// Seconds a closing client socket lingers to flush unsent data.
const LINGER_SECS: libc::c_int = 2;

/// Handler for text received on a connection.
///
/// Each call carries one read of at most 2047 bytes. Bytes that are not valid
/// UTF-8 reach the handler as U+FFFD replacement characters.
pub type CommandHandler = Rc<dyn Fn(&mut Daemon, &str, &Connection)>;

/// Hook invoked once a new connection is set up, before the prompt is sent.
pub type ConnectHandler = Rc<dyn Fn(&mut Daemon, &Connection)>;

pub struct ServerBuilder {
    service: Option<String>,
    port: Option<u16>,
    prompt: Option<String>,
    local: bool,
    max_connections: usize,
    directory: Rc<dyn ServiceDirectory>,
    command_handler: Option<CommandHandler>,
    on_connect: Option<ConnectHandler>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            service: None,
            port: None,
            prompt: None,
            local: false,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            directory: Rc::new(EtcServices),
            command_handler: None,
            on_connect: None,
        }
    }

    /// Symbolic service name. When the directory knows it, its port and
    /// prompt win over [`port`](Self::port) and [`prompt`](Self::prompt).
    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Port to listen on; 0 picks an ephemeral port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    /// Bind to the loopback address only.
    pub fn local(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn directory<D: ServiceDirectory + 'static>(mut self, directory: D) -> Self {
        self.directory = Rc::new(directory);
        self
    }

    pub fn command_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut Daemon, &str, &Connection) + 'static,
    {
        self.command_handler = Some(Rc::new(handler));
        self
    }

    pub fn on_connect<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Daemon, &Connection) + 'static,
    {
        self.on_connect = Some(Rc::new(hook));
        self
    }

    pub fn build(self) -> TcpServer {
        TcpServer::from_inner(Rc::new(RefCell::new(ServerInner {
            service: self.service,
            port: self.port,
            prompt: self.prompt,
            local: self.local,
            max_connections: self.max_connections,
            directory: self.directory,
            command_handler: self.command_handler,
            on_connect: self.on_connect,
            listener: None,
            connections: Vec::new(),
            next_id: 1,
        })))
    }
}

pub(crate) struct ServerInner {
    service: Option<String>,
    port: Option<u16>,
    prompt: Option<String>,
    local: bool,
    max_connections: usize,
    directory: Rc<dyn ServiceDirectory>,
    command_handler: Option<CommandHandler>,
    on_connect: Option<ConnectHandler>,
    listener: Option<OwnedFd>,
    connections: Vec<ConnectionState>,
    next_id: u64,
}

impl ServerInner {
    pub(crate) fn connection_mut(&mut self, id: u64) -> Option<&mut ConnectionState> {
        self.connections.iter_mut().find(|c| c.id == id)
    }

    pub(crate) fn send_prompt(&mut self, id: u64) -> Result<()> {
        let prompt = self.prompt.clone().unwrap_or_default();
        let state = self.connection_mut(id).ok_or(Error::ConnectionClosed)?;

        state.writer.flush()?;
        (&state.socket).write_all(prompt.as_bytes())?;
        debug!(target: "appframe::server", fd = state.fd, prompt = %prompt, "prompt sent");

        Ok(())
    }

    /// Resolves port and prompt, consulting the service directory first.
    fn resolve(&self) -> Result<(u16, String)> {
        let mut port = self.port;
        let mut prompt = self.prompt.clone();

        if let Some(service) = &self.service {
            match self.directory.lookup(service)? {
                Some(entry) => {
                    port = Some(entry.port);
                    prompt = Some(entry.prompt_or_default());
                }
                None if port.is_some() && prompt.is_some() => {
                    info!(target: "appframe::server", service = %service, "service not in directory, using explicit port and prompt");
                }
                None => {
                    error!(target: "appframe::server", service = %service, "service not in directory, server not started");
                    return Err(Error::ServiceNotFound(service.clone()));
                }
            }
        }

        let port = port.ok_or(Error::NotConfigured("server port"))?;
        let prompt = prompt.ok_or(Error::NotConfigured("server prompt"))?;

        Ok((port, prompt))
    }
}

/// Handle to a server. Clones share the same server.
#[derive(Clone)]
pub struct TcpServer {
    inner: Rc<RefCell<ServerInner>>,
}

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("TcpServer")
            .field("port", &inner.port)
            .field("prompt", &inner.prompt)
            .field("listening", &inner.listener.is_some())
            .field("connections", &inner.connections.len())
            .finish()
    }
}

impl TcpServer {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    pub(crate) fn from_inner(inner: Rc<RefCell<ServerInner>>) -> Self {
        Self { inner }
    }

    /// Binds, listens and registers the listening socket with `daemon`.
    ///
    /// The listen backlog equals the connection cap.
    pub fn start(&self, daemon: &mut Daemon) -> Result<()> {
        if let Some(listener) = &self.inner.borrow().listener {
            return Err(Error::AlreadyRegistered(listener.as_raw_fd()));
        }

        let (port, prompt, local, max_connections) = {
            let inner = self.inner.borrow();
            let (port, prompt) = inner.resolve()?;
            (port, prompt, inner.local, inner.max_connections)
        };

        let fd = utils::tcp_socket().inspect_err(|err| {
            error!(target: "appframe::server", error = %err, "socket() failed");
        })?;
        let listener = unsafe { OwnedFd::from_raw_fd(fd) };

        configure_listener(fd)?;

        let ip = if local {
            Ipv4Addr::LOCALHOST
        } else {
            Ipv4Addr::UNSPECIFIED
        };

        utils::bind(fd, ip, port).inspect_err(|err| {
            error!(target: "appframe::server", port, fd, error = %err, "bind() failed");
        })?;
        utils::listen(fd, max_connections).inspect_err(|err| {
            error!(target: "appframe::server", fd, error = %err, "listen() failed");
        })?;
        event::set_nonblocking(fd, true)?;

        let weak = Rc::downgrade(&self.inner);
        daemon.poll_add_owned(fd, Interest::ACCEPT, self.owner(), move |daemon, event| {
            handle_new_connection(&weak, daemon, event);
        })?;

        let mut inner = self.inner.borrow_mut();
        inner.port = Some(port);
        inner.prompt = Some(prompt);
        inner.listener = Some(listener);
        inner.connections.clear();

        info!(target: "appframe::server", port, fd, max_connections, "server listening");

        Ok(())
    }

    /// Disconnects every client, then closes the listening socket.
    pub fn stop(&self, daemon: &mut Daemon) {
        self.disconnect_all(daemon);

        let listener = self.inner.borrow_mut().listener.take();
        if let Some(listener) = listener {
            daemon.poll_remove(listener.as_raw_fd());
            info!(target: "appframe::server", fd = listener.as_raw_fd(), "server stopped");
        }
    }

    pub fn disconnect_all(&self, daemon: &mut Daemon) {
        loop {
            let next = self.inner.borrow().connections.first().map(|c| (c.id, c.fd));
            match next {
                Some((id, fd)) => self.disconnect(daemon, &self.handle(id, fd)),
                None => break,
            }
        }
    }

    /// Removes `cnx` from the dispatcher, runs its disconnect hook, closes
    /// both of its descriptors and forgets it.
    pub fn disconnect(&self, daemon: &mut Daemon, cnx: &Connection) {
        let found = self
            .inner
            .borrow_mut()
            .connection_mut(cnx.id())
            .map(|state| (state.fd, state.on_disconnect.clone()));

        let Some((fd, on_disconnect)) = found else {
            return;
        };

        daemon.poll_remove(fd);

        if let Some(hook) = on_disconnect {
            hook(daemon, cnx);
        }

        let state = {
            let mut inner = self.inner.borrow_mut();
            let index = inner.connections.iter().position(|c| c.id == cnx.id());
            index.map(|index| inner.connections.remove(index))
        };

        debug!(target: "appframe::server", fd, "client disconnected");
        drop(state);
    }

    pub fn send_prompt(&self, cnx: &Connection) -> Result<()> {
        self.inner.borrow_mut().send_prompt(cnx.id())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let inner = self.inner.borrow();
        let listener = inner.listener.as_ref().ok_or(Error::NotConnected)?;
        Ok(utils::local_addr(listener.as_raw_fd())?)
    }

    pub fn is_listening(&self) -> bool {
        self.inner.borrow().listener.is_some()
    }

    pub fn port(&self) -> Option<u16> {
        self.inner.borrow().port
    }

    pub fn prompt(&self) -> Option<String> {
        self.inner.borrow().prompt.clone()
    }

    pub fn num_connections(&self) -> usize {
        self.inner.borrow().connections.len()
    }

    pub fn max_connections(&self) -> usize {
        self.inner.borrow().max_connections
    }

    /// Live connections, oldest first.
    pub fn connections(&self) -> Vec<Connection> {
        self.inner
            .borrow()
            .connections
            .iter()
            .map(|c| self.handle(c.id, c.fd))
            .collect()
    }

    pub fn set_command_handler<F>(&self, handler: F)
    where
        F: Fn(&mut Daemon, &str, &Connection) + 'static,
    {
        self.inner.borrow_mut().command_handler = Some(Rc::new(handler));
    }

    pub fn set_connect_handler<F>(&self, hook: F)
    where
        F: Fn(&mut Daemon, &Connection) + 'static,
    {
        self.inner.borrow_mut().on_connect = Some(Rc::new(hook));
    }

    /// Ties dispatcher registrations to this server: dropping the last
    /// handle closes the sockets and retires their registrations.
    fn owner(&self) -> Weak<dyn Any> {
        let inner: Rc<dyn Any> = self.inner.clone();
        Rc::downgrade(&inner)
    }

    fn handle(&self, id: u64, fd: RawFd) -> Connection {
        Connection::new(Rc::downgrade(&self.inner), id, fd)
    }
}

fn configure_listener(fd: RawFd) -> Result<()> {
    if let Err(err) = utils::set_cloexec(fd) {
        warn!(target: "appframe::server", fd, error = %err, "fcntl(FD_CLOEXEC) failed");
    }

    utils::set_nodelay(fd).inspect_err(|err| {
        error!(target: "appframe::server", fd, error = %err, "setsockopt(TCP_NODELAY) failed");
    })?;
    utils::set_reuseaddr(fd).inspect_err(|err| {
        error!(target: "appframe::server", fd, error = %err, "setsockopt(SO_REUSEADDR) failed");
    })?;

    Ok(())
}

fn configure_client(fd: RawFd) -> Result<()> {
    if let Err(err) = utils::set_cloexec(fd) {
        warn!(target: "appframe::server", fd, error = %err, "fcntl(FD_CLOEXEC) failed");
    }

    utils::set_nodelay(fd).inspect_err(|err| {
        error!(target: "appframe::server", fd, error = %err, "setsockopt(TCP_NODELAY) failed");
    })?;
    utils::set_linger(fd, LINGER_SECS).inspect_err(|err| {
        error!(target: "appframe::server", fd, error = %err, "setsockopt(SO_LINGER) failed");
    })?;

    Ok(())
}

/// Accepts one pending client, or turns it away when the server is full.
fn handle_new_connection(weak: &Weak<RefCell<ServerInner>>, daemon: &mut Daemon, event: &PollEvent) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let server = TcpServer::from_inner(inner);

    if !(event.readiness.is_readable() || event.readiness.is_priority()) {
        error!(target: "appframe::server", fd = event.fd, revents = event.readiness.bits(), "listening socket error");
        return;
    }

    let fd = match utils::accept(event.fd) {
        Ok(fd) => fd,
        Err(err) if utils::is_would_block(&err) => return,
        Err(err) => {
            error!(target: "appframe::server", error = %err, "accept() failed");
            return;
        }
    };
    let socket = unsafe { TcpStream::from_raw_fd(fd) };

    let (full, max) = {
        let inner = server.inner.borrow();
        (
            inner.connections.len() >= inner.max_connections,
            inner.max_connections,
        )
    };
    if full {
        warn!(target: "appframe::server", fd, max, "rejecting new client connection: max number of sessions already open");
        drop(socket);
        return;
    }

    let cnx = match admit(&server, daemon, socket) {
        Ok(cnx) => cnx,
        Err(err) => {
            error!(target: "appframe::server", fd, error = %err, "failed to accept new client connection");
            return;
        }
    };

    info!(target: "appframe::server", fd, peer = ?cnx.peer_addr(), "accepted new client connection");

    let on_connect = server.inner.borrow().on_connect.clone();
    if let Some(hook) = on_connect {
        hook(daemon, &cnx);
    }

    if let Err(err) = cnx.send_prompt() {
        debug!(target: "appframe::server", fd, error = %err, "failed to send prompt");
    }
}

/// Sets up and links a freshly accepted socket.
fn admit(server: &TcpServer, daemon: &mut Daemon, socket: TcpStream) -> Result<Connection> {
    let fd = socket.as_raw_fd();
    let peer = utils::peer_addr(fd)?;

    configure_client(fd)?;

    let writer = LineWriter::new(socket.try_clone()?);

    let id = {
        let mut inner = server.inner.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.connections.push(ConnectionState {
            id,
            fd,
            socket,
            writer,
            peer,
            user_data: None,
            on_disconnect: None,
        });
        id
    };

    let weak = Rc::downgrade(&server.inner);
    let registered =
        daemon.poll_add_owned(fd, Interest::READABLE, server.owner(), move |daemon, event| {
            handle_connection_event(&weak, daemon, event, id);
        });

    if let Err(err) = registered {
        let mut inner = server.inner.borrow_mut();
        if let Some(index) = inner.connections.iter().position(|c| c.id == id) {
            inner.connections.remove(index);
        }
        return Err(err);
    }

    Ok(server.handle(id, fd))
}

fn handle_connection_event(
    weak: &Weak<RefCell<ServerInner>>,
    daemon: &mut Daemon,
    event: &PollEvent,
    id: u64,
) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let server = TcpServer::from_inner(inner);

    // The registration may have been removed earlier in this dispatch cycle.
    if server.inner.borrow_mut().connection_mut(id).is_none() {
        return;
    }
    let cnx = server.handle(id, event.fd);

    if !event.readiness.is_readable() {
        info!(target: "appframe::server", fd = event.fd, revents = event.readiness.bits(), "client socket error");
        server.disconnect(daemon, &cnx);
        return;
    }

    let mut buf = [0u8; READ_CHUNK];
    match utils::recv_nonblocking(event.fd, &mut buf[..READ_CHUNK - 1]) {
        Ok(0) => {
            info!(target: "appframe::server", fd = event.fd, "client closed connection");
            server.disconnect(daemon, &cnx);
        }
        Ok(n) => {
            let text = String::from_utf8_lossy(&buf[..n]);
            let handler = server.inner.borrow().command_handler.clone();
            if let Some(handler) = handler {
                debug!(target: "appframe::server", fd = event.fd, command = %text, "server command");
                handler(daemon, &*text, &cnx);
            }
        }
        Err(err) if utils::is_would_block(&err) => {}
        Err(err) => {
            info!(target: "appframe::server", fd = event.fd, error = %err, "client read failed");
            server.disconnect(daemon, &cnx);
        }
    }
}
