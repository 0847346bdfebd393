//! Server-side connections.
//!
//! A [`Connection`] is a cheap handle (server + connection id). The socket,
//! its buffered write half and any user data live inside the owning server
//! and are dropped, closing both descriptors, when the connection goes away.

use crate::daemon::Daemon;
use crate::error::{Error, Result};
use crate::net::server::{ServerInner, TcpServer};

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::io::{LineWriter, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

/// Hook invoked right before a connection is torn down.
pub type DisconnectHandler = Rc<dyn Fn(&mut Daemon, &Connection)>;

pub(crate) struct ConnectionState {
    pub(crate) id: u64,
    pub(crate) fd: RawFd,
    pub(crate) socket: TcpStream,
    pub(crate) writer: LineWriter<TcpStream>,
    pub(crate) peer: SocketAddr,
    pub(crate) user_data: Option<Box<dyn Any>>,
    pub(crate) on_disconnect: Option<DisconnectHandler>,
}

#[derive(Clone)]
pub struct Connection {
    server: Weak<RefCell<ServerInner>>,
    id: u64,
    fd: RawFd,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("fd", &self.fd)
            .finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Weak::ptr_eq(&self.server, &other.server)
    }
}

impl Connection {
    pub(crate) fn new(server: Weak<RefCell<ServerInner>>, id: u64, fd: RawFd) -> Self {
        Self { server, id, fd }
    }

    /// Serial number, unique per server.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The accepted (read) descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn server(&self) -> Option<TcpServer> {
        self.server.upgrade().map(TcpServer::from_inner)
    }

    /// False once the connection was disconnected or its server dropped.
    pub fn is_open(&self) -> bool {
        self.with_state(|_| ()).is_some()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.with_state(|state| state.peer)
    }

    /// Writes through the line-buffered output: complete lines go out at
    /// once, a trailing partial line waits for the next newline or flush.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.with_state(|state| state.writer.write_all(data))
            .ok_or(Error::ConnectionClosed)?
            .map_err(Error::from)
    }

    pub fn write_str(&self, text: &str) -> Result<()> {
        self.write(text.as_bytes())
    }

    pub fn flush(&self) -> Result<()> {
        self.with_state(|state| state.writer.flush())
            .ok_or(Error::ConnectionClosed)?
            .map_err(Error::from)
    }

    /// Flushes pending output, then sends the server prompt.
    pub fn send_prompt(&self) -> Result<()> {
        let inner = self.server.upgrade().ok_or(Error::ConnectionClosed)?;
        inner.borrow_mut().send_prompt(self.id)
    }

    /// Attaches arbitrary data, replacing any previous value.
    pub fn set_user_data<T: Any>(&self, data: T) {
        self.with_state(|state| state.user_data = Some(Box::new(data)));
    }

    /// Runs `f` on the attached data if it is a `T`.
    ///
    /// The server is borrowed while `f` runs; `f` must not call back into
    /// this connection or its server.
    pub fn with_user_data<T: Any, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.with_state(|state| state.user_data.as_mut()?.downcast_mut::<T>().map(f))
            .flatten()
    }

    pub fn take_user_data<T: Any>(&self) -> Option<T> {
        self.with_state(|state| {
            let data = state.user_data.take()?;
            match data.downcast::<T>() {
                Ok(data) => Some(*data),
                Err(data) => {
                    state.user_data = Some(data);
                    None
                }
            }
        })
        .flatten()
    }

    pub fn set_disconnect_handler<F>(&self, handler: F)
    where
        F: Fn(&mut Daemon, &Connection) + 'static,
    {
        self.with_state(|state| state.on_disconnect = Some(Rc::new(handler)));
    }

    /// Closes the connection. Safe to call on an already closed handle.
    pub fn disconnect(&self, daemon: &mut Daemon) {
        if let Some(inner) = self.server.upgrade() {
            TcpServer::from_inner(inner).disconnect(daemon, self);
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut ConnectionState) -> R) -> Option<R> {
        let inner = self.server.upgrade()?;
        let mut inner = inner.borrow_mut();
        inner.connection_mut(self.id).map(f)
    }
}
