//! Tracing setup for host programs and tests.
//!
//! The library itself only emits `tracing` events (targets follow module
//! names: `solver`, `cache`, `git`, `hosted`, `entrypoint`); installing a
//! subscriber is the embedder's call. [`init`] wires up the stock one:
//! stderr output filtered by `RUST_LOG`.

use tracing_subscriber::EnvFilter;

/// Install an stderr `fmt` subscriber honoring `RUST_LOG`. Calling it a
/// second time is a no-op.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
