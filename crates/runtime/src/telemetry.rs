//! Tracing subscriber installation.
//!
//! Library code only emits; binaries and tests call [`init`] once. The
//! filter comes from `RUST_LOG`, defaulting to `info`.

use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber. Safe to call more than once; later calls are
/// no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
