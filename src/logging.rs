//! Log sink setup.
//!
//! The library only emits `tracing` events; the application decides where they
//! go. Each subsystem logs under its own target so they can be filtered
//! independently, e.g. `RUST_LOG=appframe::client=debug`:
//!
//! - `appframe::reactor`
//! - `appframe::timer`
//! - `appframe::server`
//! - `appframe::client`

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Installs a fmt subscriber logging at `level` and above.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init(level: Level) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init()
        .is_ok()
}

/// Installs a fmt subscriber driven by `RUST_LOG`, falling back to `default`
/// (an `EnvFilter` directive such as `"appframe=info"`) when it is unset.
pub fn init_from_env(default: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
