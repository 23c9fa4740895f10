//! Tracing subscriber setup.
//!
//! Level filtering comes from `RUST_LOG` when set, with a crate-scoped
//! default otherwise. `init` is idempotent — a second call (common in
//! tests) is a no-op.

use tracing_subscriber::EnvFilter;

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mcp_chat_core=info,warn"))
}

/// Human-readable log output on stderr.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

/// Structured JSON log output on stderr, for log shippers.
pub fn init_json() {
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(default_filter())
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}
