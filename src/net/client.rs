//! Synchronous client for prompt-oriented servers.
//!
//! The client talks to servers that end each response with a fixed prompt.
//! Every operation is bounded: connects and reads poll the socket with a
//! timeout and never block indefinitely.
//!
//! # Usage
//!
//! ```ignore
//! use appframe::ClientBuilder;
//! use std::time::Duration;
//!
//! let mut client = ClientBuilder::new().port(4000).prompt("ledd>").build()?;
//! client.connect()?;
//! client.get_prompt(Duration::from_secs(1))?;
//!
//! let mut storage = [0u8; 1024];
//! let mut response = ReadBuffer::new(&mut storage);
//! client.send("status")?;
//! client.expect_prompts(1);
//! client.read_timeout(Some(&mut response), Duration::from_secs(1))?;
//! println!("{}", String::from_utf8_lossy(response.as_slice()));
//! ```

use crate::error::{Error, Result};
use crate::net::prompt::PromptDetector;
use crate::net::services::{EtcServices, ServiceDirectory};
use crate::net::utils;
use crate::reactor::event::{self, Interest};
use crate::time::{Clock, MonotonicClock};

use std::fmt;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Size of the scratch buffer used when the caller does not supply one.
pub const READ_BUFFER_SIZE: usize = 10240;

/// Caller-owned response buffer.
///
/// Confirmed body text accumulates in `data[..filled]`; the prompt itself is
/// never stored there.
#[derive(Debug)]
pub struct ReadBuffer<'a> {
    data: &'a mut [u8],
    filled: usize,
}

impl<'a> ReadBuffer<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data, filled: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn filled(&self) -> usize {
        self.filled
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    pub fn clear(&mut self) {
        self.filled = 0;
    }
}

pub struct ClientBuilder {
    service: Option<String>,
    ip: Ipv4Addr,
    port: Option<u16>,
    prompt: Option<String>,
    connect_timeout: Duration,
    directory: Rc<dyn ServiceDirectory>,
    clock: Rc<dyn Clock>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            service: None,
            ip: Ipv4Addr::LOCALHOST,
            port: None,
            prompt: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            directory: Rc::new(EtcServices),
            clock: Rc::new(MonotonicClock),
        }
    }

    /// Service name used to fill in a missing port or prompt.
    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn ip(mut self, ip: Ipv4Addr) -> Self {
        self.ip = ip;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn directory<D: ServiceDirectory + 'static>(mut self, directory: D) -> Self {
        self.directory = Rc::new(directory);
        self
    }

    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Rc::new(clock);
        self
    }

    /// Resolves the port and prompt and validates the prompt length.
    pub fn build(self) -> Result<TcpClient> {
        let mut port = self.port;
        let mut prompt = self.prompt;

        if let Some(service) = &self.service
            && (port.is_none() || prompt.is_none())
        {
            let entry = self
                .directory
                .lookup(service)?
                .ok_or_else(|| Error::ServiceNotFound(service.clone()))?;

            if port.is_none() {
                port = Some(entry.port);
            }
            if prompt.is_none() {
                prompt = Some(entry.prompt_or_default());
            }
        }

        let port = port.ok_or(Error::NotConfigured("client port"))?;
        let prompt = prompt.ok_or(Error::NotConfigured("client prompt"))?;
        let detector = PromptDetector::new(&prompt)?;

        Ok(TcpClient {
            service: self.service,
            ip: self.ip,
            port,
            prompt,
            connect_timeout: self.connect_timeout,
            socket: None,
            detector,
            awaiting: 0,
            clock: self.clock,
            scratch: Vec::new(),
        })
    }
}

pub struct TcpClient {
    service: Option<String>,
    ip: Ipv4Addr,
    port: u16,
    prompt: String,
    connect_timeout: Duration,
    socket: Option<OwnedFd>,
    detector: PromptDetector,
    awaiting: usize,
    clock: Rc<dyn Clock>,
    scratch: Vec<u8>,
}

impl fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpClient")
            .field("service", &self.service)
            .field("ip", &self.ip)
            .field("port", &self.port)
            .field("prompt", &self.prompt)
            .field("socket", &self.as_raw_fd())
            .field("awaiting", &self.awaiting)
            .finish()
    }
}

impl TcpClient {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    pub fn as_raw_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(utils::peer_addr(self.fd()?)?)
    }

    /// Connects with the configured timeout.
    pub fn connect(&mut self) -> Result<()> {
        self.connect_timeout(self.connect_timeout)
    }

    /// Non-blocking connect bounded by `timeout`.
    ///
    /// The socket's original flags are restored whatever the outcome. On
    /// failure the socket is closed and the client stays disconnected.
    pub fn connect_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.disconnect();

        let fd = utils::tcp_socket()?;
        let socket = unsafe { OwnedFd::from_raw_fd(fd) };

        if let Err(err) = utils::set_cloexec(fd) {
            warn!(target: "appframe::client", fd, error = %err, "fcntl(FD_CLOEXEC) failed");
        }

        let flags = event::set_nonblocking(fd, true)?;
        let connected = self.finish_connect(fd, timeout);
        let restored = event::restore_flags(fd, flags);

        if let Err(err) = connected {
            debug!(target: "appframe::client", ip = %self.ip, port = self.port, error = %err, "connect failed");
            return Err(err);
        }
        restored?;

        info!(target: "appframe::client", fd, ip = %self.ip, port = self.port, "connected");
        self.socket = Some(socket);

        Ok(())
    }

    fn finish_connect(&self, fd: RawFd, timeout: Duration) -> Result<()> {
        if utils::start_connect(fd, self.ip, self.port)? {
            return Ok(());
        }

        let readiness = event::wait_one(fd, Interest::WRITABLE | Interest::READABLE, timeout)?;
        if readiness.is_empty() {
            info!(target: "appframe::client", fd, ?timeout, "connect timed out");
            return Err(Error::Timeout);
        }

        match utils::take_socket_error(fd)? {
            0 => Ok(()),
            code => Err(Error::Io(io::Error::from_raw_os_error(code))),
        }
    }

    /// Closes the socket and forgets any partial prompt.
    pub fn disconnect(&mut self) {
        if let Some(socket) = self.socket.take() {
            debug!(target: "appframe::client", fd = socket.as_raw_fd(), "disconnected");
        }

        self.detector.clear_carry();
        self.awaiting = 0;
    }

    /// Sends one command line; a newline is appended when missing.
    pub fn send(&mut self, command: &str) -> Result<()> {
        if command.ends_with('\n') {
            return self.send_raw(command.as_bytes());
        }

        let mut line = Vec::with_capacity(command.len() + 1);
        line.extend_from_slice(command.as_bytes());
        line.push(b'\n');

        self.send_raw(&line)
    }

    /// Sends `data` as is, in a single non-blocking write.
    pub fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        let fd = self.fd()?;

        match utils::send_nonblocking(fd, data) {
            Ok(n) if n == data.len() => {
                trace!(target: "appframe::client", fd, bytes = n, "sent");
                Ok(())
            }
            Ok(n) => Err(Error::ShortWrite {
                written: n,
                expected: data.len(),
            }),
            Err(err) if utils::is_would_block(&err) => Err(Error::Timeout),
            Err(err) => Err(Error::Io(err)),
        }
    }

    /// Number of prompts the next reads should wait for.
    pub fn expect_prompts(&mut self, count: usize) {
        self.awaiting = count;
    }

    pub fn pending_prompts(&self) -> usize {
        self.awaiting
    }

    /// Waits for the next prompt, discarding any text before it.
    pub fn get_prompt(&mut self, timeout: Duration) -> Result<()> {
        if self.awaiting == 0 {
            self.awaiting = 1;
        }

        self.read_timeout(None, timeout)
    }

    /// One non-blocking read.
    ///
    /// Returns `Ok(())` once an awaited prompt completes, [`Error::Timeout`]
    /// when more data is needed, [`Error::ConnectionClosed`] when the peer
    /// shut down and [`Error::BufferTooSmall`] when `buf` cannot take another
    /// read. Without `buf` the received text is discarded.
    pub fn read_socket(&mut self, buf: Option<&mut ReadBuffer<'_>>) -> Result<()> {
        match buf {
            Some(buf) => self.read_into(buf, true),
            None => {
                let mut scratch = mem::take(&mut self.scratch);
                scratch.resize(READ_BUFFER_SIZE, 0);

                let result = self.read_into(&mut ReadBuffer::new(&mut scratch), false);
                self.scratch = scratch;

                result
            }
        }
    }

    fn read_into(&mut self, buf: &mut ReadBuffer<'_>, external: bool) -> Result<()> {
        let fd = self.fd()?;
        let prompt_len = self.detector.prompt_len();
        let required = buf.filled + prompt_len + 1;

        if buf.capacity() < required {
            debug!(target: "appframe::client", capacity = buf.capacity(), required, "read buffer too small");
            return Err(Error::BufferTooSmall {
                capacity: buf.capacity(),
                required,
            });
        }

        let region = &mut buf.data[buf.filled..];
        let carried = self.detector.restore_carry(region);

        let n = match utils::recv_nonblocking(fd, &mut region[carried..]) {
            Ok(0) => {
                info!(target: "appframe::client", fd, "peer performed an orderly shutdown");
                return Err(Error::ConnectionClosed);
            }
            Ok(n) => n,
            Err(err) if utils::is_would_block(&err) => return Err(Error::Timeout),
            Err(err) => return Err(Error::Io(err)),
        };

        let total = carried + n;
        debug!(target: "appframe::client", fd, bytes = n, carried, "client read");

        if self.awaiting > 0 {
            let detection = self.detector.detect(&region[..total]);
            buf.filled += detection.visible;

            if detection.found {
                self.awaiting -= 1;
                return Ok(());
            }
        } else {
            self.detector.clear_carry();
            buf.filled += total;
        }

        if buf.capacity() - buf.filled <= prompt_len {
            if external {
                return Err(Error::BufferTooSmall {
                    capacity: buf.capacity(),
                    required: buf.filled + prompt_len + 1,
                });
            }
            buf.clear();
        }

        Err(Error::Timeout)
    }

    /// Reads until an awaited prompt completes or `timeout` runs out.
    ///
    /// `buf` is cleared first. A zero `timeout` makes a single attempt and
    /// reports success even if no prompt arrived.
    pub fn read_timeout(
        &mut self,
        mut buf: Option<&mut ReadBuffer<'_>>,
        timeout: Duration,
    ) -> Result<()> {
        if let Some(buf) = buf.as_deref_mut() {
            buf.clear();
        }

        let fd = self.fd()?;

        self.poll_loop(fd, timeout, |client| client.read_socket(buf.as_deref_mut()))
    }

    /// Reads whatever arrives first, without prompt detection.
    ///
    /// Returns the number of bytes read, `Ok(0)` if `timeout` is zero and
    /// nothing was pending.
    pub fn read_raw_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let fd = self.fd()?;
        let mut read = 0;

        self.poll_loop(fd, timeout, |_| match utils::recv_nonblocking(fd, buf) {
            Ok(0) => Err(Error::ConnectionClosed),
            Ok(n) => {
                read = n;
                Ok(())
            }
            Err(err) if utils::is_would_block(&err) => Err(Error::Timeout),
            Err(err) => Err(Error::Io(err)),
        })?;

        Ok(read)
    }

    /// Polls `fd` for input and runs `attempt` on readiness until it returns
    /// anything but [`Error::Timeout`] or `timeout` has elapsed.
    fn poll_loop<F>(&mut self, fd: RawFd, timeout: Duration, mut attempt: F) -> Result<()>
    where
        F: FnMut(&mut Self) -> Result<()>,
    {
        let timeout_ms = i64::from(event::timeout_millis(Some(timeout)));
        let mut start = self.clock.now();
        let mut remaining = timeout_ms;

        loop {
            let slice = Duration::from_millis(remaining.max(1) as u64);
            let readiness = event::wait_one(fd, Interest::READABLE, slice)?;

            if readiness.is_readable() {
                match attempt(self) {
                    Err(Error::Timeout) => {}
                    other => return other,
                }
            } else if !readiness.is_empty() {
                info!(target: "appframe::client", fd, revents = readiness.bits(), "socket error while reading");
                return Err(Error::ConnectionClosed);
            }

            let mut elapsed = self.clock.now().millis_since(start);
            if elapsed < 0 {
                warn!(target: "appframe::client", "clock went backwards, restarting read timer");
                start = self.clock.now();
                elapsed = 0;
            }

            if elapsed >= timeout_ms {
                break;
            }
            remaining = timeout_ms - elapsed;
        }

        if !timeout.is_zero() {
            return Err(Error::Timeout);
        }

        Ok(())
    }

    fn fd(&self) -> Result<RawFd> {
        self.as_raw_fd().ok_or(Error::NotConnected)
    }
}
