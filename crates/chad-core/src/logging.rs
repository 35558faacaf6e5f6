//! Tracing subscriber initialization shared by the binaries.

use tracing_subscriber::EnvFilter;

/// Initialize structured logging.
///
/// Filtering comes from `CHAD_LOG` (or `RUST_LOG` as a fallback), default
/// `info`. With `json = true` events are emitted as JSON lines for log
/// shippers; otherwise compact human-readable output goes to stderr.
///
/// Safe to call once per process; subsequent calls are no-ops.
pub fn init_logging(json: bool) {
    let filter = std::env::var("CHAD_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };

    // Already initialized (e.g. in tests); keep the existing subscriber
    let _ = result;
}
