//! Tracing subscriber setup.
//!
//! Diagnostics go to stderr so command output on stdout stays clean. The
//! filter comes from `CONDUCTOR_LOG`, then `RUST_LOG`, then the verbosity
//! flag.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

pub fn init(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("CONDUCTOR_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).compact())
            .try_init()
    };
    // A subscriber installed earlier (tests, embedding) wins.
    let _ = result;
}
