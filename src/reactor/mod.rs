//! Poll dispatcher.
//!
//! This module provides the single blocking point of the framework:
//! - [`core`]: the descriptor registry and the snapshot-then-invoke dispatch cycle
//! - [`event`]: interest/readiness masks and thin `poll(2)` wrappers

pub mod core;
pub mod event;

pub use self::core::{DEFAULT_CAPACITY, PollCallback, Reactor};
pub use self::event::{Interest, PollEvent, Readiness};
