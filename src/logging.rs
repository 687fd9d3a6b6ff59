//! Log subscriber setup.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LOG_ENV;

/// Install a stderr `fmt` subscriber filtered by `LLAMA_FFI_LOG`, or by
/// `default_filter` when the variable is unset or invalid.
///
/// Returns `false` if the host already installed a global subscriber, which
/// is left in place.
pub fn init(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .is_ok()
}
