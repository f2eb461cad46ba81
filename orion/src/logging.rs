//! Development-time tracing.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted.
//!
//! - **Cycle records and the command audit log (`io/cycle_log`, `io/store`)**:
//!   Product artifacts under the state directory. Always written, unaffected
//!   by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing for one-shot CLI commands.
///
/// Reads `RUST_LOG` env var. Defaults to `warn` if unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=orion=debug orion status
/// ```
pub fn init() {
    init_with_default("warn");
}

/// Initialize tracing with `default` as the filter when `RUST_LOG` is unset.
///
/// Long-running processes (`orion run`, `orion-ui`) pass `orion=info` so
/// cycle, command and recovery events are visible without extra setup.
pub fn init_with_default(default: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
