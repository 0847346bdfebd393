//! Error type shared by the dispatcher, the server and the client.
//!
//! OS errors are translated once, where the failing call is made, and then
//! propagated unchanged. Would-block conditions surface as [`Error::Timeout`]
//! so bounded-wait loops can retry them.

use std::io;
use std::os::fd::RawFd;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Nothing decisive happened in the allotted time, or the operation
    /// would block and should be retried.
    #[error("operation timed out")]
    Timeout,

    /// Unexpected OS-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer performed an orderly shutdown or the socket reported an error.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A send only pushed part of the payload to the socket.
    #[error("short write: {written} of {expected} bytes sent")]
    ShortWrite { written: usize, expected: usize },

    /// The caller-supplied buffer is full or cannot hold a prompt's worth of headroom.
    #[error("buffer too small: capacity {capacity}, need at least {required}")]
    BufferTooSmall { capacity: usize, required: usize },

    #[error("invalid prompt length {len} (must be 1..={max} bytes)")]
    InvalidPrompt { len: usize, max: usize },

    #[error("fd {0} is already registered")]
    AlreadyRegistered(RawFd),

    #[error("poll registry is full ({capacity} descriptors)")]
    RegistryFull { capacity: usize },

    #[error("service {0:?} not found")]
    ServiceNotFound(String),

    #[error("{0} not configured")]
    NotConfigured(&'static str),

    #[error("client is not connected")]
    NotConnected,
}

impl Error {
    /// True for [`Error::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    /// True when the peer went away.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::ConnectionClosed)
    }
}
