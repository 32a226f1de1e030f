//! Opt-in `tracing-subscriber` initialization for binaries and tests that embed this
//! crate. The library itself never installs a global subscriber.

use tracing_subscriber::EnvFilter;

/// Installs a formatting subscriber driven by `RUST_LOG` (defaulting to `info`).
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
