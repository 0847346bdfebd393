//! Application framework for small single-threaded network daemons.
//!
//! A daemon is one control thread driving a `poll(2)` loop. Descriptors and
//! timers register callbacks that receive the [`Daemon`] context, so every
//! piece of state is touched from that one thread and nothing needs locking.
//!
//! # Architecture
//!
//! - **Daemon**: owns the dispatcher and the timers, runs the loop
//! - **Reactor**: descriptor registry with snapshot-then-invoke dispatch
//! - **TimerQueue**: one-shot, restartable timers ordered by deadline
//! - **TcpServer**: prompt-oriented line server with admission control
//! - **TcpClient**: bounded connects and reads that stop at the server prompt
//! - **PromptDetector**: finds a prompt split across any number of reads
//! - **DaemonBuilder**: fluent builder for the daemon context

mod builder;
pub mod daemon;
pub mod error;
pub mod logging;
pub mod net;
pub mod reactor;
pub mod time;
pub mod timer;
mod utils;

pub use builder::DaemonBuilder;
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use net::{
    ClientBuilder, Connection, EtcServices, PromptDetector, ReadBuffer, ServerBuilder,
    ServiceDirectory, StaticServices, TcpClient, TcpServer,
};
pub use reactor::{Interest, PollEvent, Reactor, Readiness};
pub use time::{Clock, ManualClock, MonotonicClock, Timespec};
pub use timer::{TimerId, TimerQueue};
