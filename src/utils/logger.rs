//! Diagnostics setup
//!
//! The runner prints reporter output on stdout; diagnostics go to stderr so
//! machine-readable reporters stay clean.

use tracing_subscriber::EnvFilter;

/// Initialize tracing from the `--verbose` flag. An explicit `RUST_LOG`
/// always wins over the flag.
pub fn init_logger(verbose: bool) {
    let fallback = if verbose { "specrun=debug" } else { "specrun=warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
