//! Tracing setup for the service.
//!
//! Emits structured JSON lines. `RUST_LOG` overrides the configured level
//! so a single process can be turned up without touching its config.

use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;

/// Installs the global subscriber. Safe to call more than once; later
/// calls are no-ops, which keeps test binaries quiet.
pub fn init_subscriber(config: &AppConfig) {
    let filter = std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .and_then(|spec| spec.parse::<EnvFilter>().ok())
        .unwrap_or_else(|| EnvFilter::new(&config.log_level));

    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(false)
        .try_init();
}
