//! Structured logging setup (§10.1), grounded on the relay server's
//! `tracing_subscriber::fmt()` initialization: `RUST_LOG`-driven filtering
//! via `EnvFilter`, defaulting to `info` when unset. Library code never
//! prints to stdout/stderr directly for diagnostics; `print(...)` output
//! from a running program goes through the evaluator's own stdout buffer
//! instead (§6.2), not through this subscriber.

use tracing_subscriber::EnvFilter;

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
