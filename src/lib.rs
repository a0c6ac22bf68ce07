//! FINN fire emissions → CMAQ-ready IOAPI NetCDF.
//!
//! Two stages, each with its own binary:
//!
//! * `txt2daily`      raw inventory text → gridded daily file ([`daily`])
//! * `daily2hourly3d` daily file → hourly, layered, re-speciated files ([`hourly`])

pub mod daily;
pub mod griddesc;
pub mod hourly;
pub mod inventory;
pub mod ioapi;
pub mod projection;
pub mod speciation;
pub mod temporal;
pub mod vertical;

use std::time::Instant;

use tracing_subscriber::EnvFilter;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ─────────────────────────────────────────────────────────────────────
// Simple timing helper
// ─────────────────────────────────────────────────────────────────────
pub fn timeit<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let t0 = Instant::now();
    let out = f();
    tracing::debug!("{label:<20}{:?}", t0.elapsed());
    out
}

// ─────────────────────────────────────────────────────────────────────
// Logging
// ─────────────────────────────────────────────────────────────────────

/// Install the global subscriber. `verbose` is the `-v` count; `RUST_LOG`
/// wins when set.
pub fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // A second init (tests, embedding) is harmless.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
