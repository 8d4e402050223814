//! Tracing init for the binary: env-filtered, plain text to stderr.
//!
//! `RUST_LOG` controls verbosity (default `info`); components log
//! `request_id`/`trace_id`/`agent_id` as structured fields.

use tracing_subscriber::EnvFilter;

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
