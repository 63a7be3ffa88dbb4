//! Tracing subscriber setup for binaries and demos.
//!
//! The library itself only emits `tracing` events; installing a subscriber is
//! the application's choice. This helper installs a `fmt` subscriber filtered
//! by `RUST_LOG`, falling back to `default_directive`.

use tracing_subscriber::EnvFilter;

/// Install a global `fmt` subscriber.
///
/// Returns `false` if a global subscriber was already installed.
///
/// # Examples
///
/// ```
/// body_retry::logging::init_tracing("body_retry=debug");
/// ```
pub fn init_tracing(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
