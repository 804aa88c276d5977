//! Logging setup for charm processes.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info,charm=debug";

/// Install the global subscriber: `RUST_LOG` filtering, human-readable output on stderr.
///
/// Stdout belongs to the orchestrator protocol, so logs never go there. Calling this
/// more than once is harmless; only the first call installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
