//! TCP networking for prompt-oriented services.
//!
//! This module provides the server and client halves of the framework:
//! - [`server`]: [`TcpServer`] accepting clients and dispatching their commands
//! - [`connection`]: [`Connection`] handles for accepted clients
//! - [`client`]: [`TcpClient`] with bounded connects and prompt-terminated reads
//! - [`prompt`]: the streaming prompt detector used by the client
//! - [`services`]: service-name lookups for ports and prompts
//!
//! [`TcpServer`]: server::TcpServer
//! [`Connection`]: connection::Connection
//! [`TcpClient`]: client::TcpClient

pub mod client;
pub mod connection;
pub mod prompt;
pub mod server;
pub mod services;
pub(crate) mod utils;

pub use self::client::{ClientBuilder, ReadBuffer, TcpClient};
pub use self::connection::{Connection, DisconnectHandler};
pub use self::prompt::{Detection, MAX_PROMPT, PromptDetector};
pub use self::server::{CommandHandler, ConnectHandler, ServerBuilder, TcpServer};
pub use self::services::{EtcServices, ServiceDirectory, ServiceEntry, StaticServices};
