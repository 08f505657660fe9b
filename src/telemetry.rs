//! Tracing subscriber setup for host binaries.
//!
//! The library only emits `tracing` events; installing a subscriber is the
//! host's call.

use tracing_subscriber::EnvFilter;

use crate::{Error, Result};

/// Install a formatted subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` (e.g. `"labmix_store=info"`).
///
/// # Errors
///
/// Returns `Error::Config` if the directive is invalid or a global
/// subscriber is already installed.
pub fn init_tracing(default_directive: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .map_err(|e| Error::Config(format!("invalid log filter: {e}")))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| Error::Config(format!("tracing already initialized: {e}")))
}
