use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default filter when RUST_LOG is unset
pub const DEFAULT_FILTER: &str = "sellmanager=info,sellmanager::signals=debug";

/// Install the global tracing subscriber.
///
/// # Arguments
/// * `level` - Filter directive used when RUST_LOG is unset (e.g. "info")
/// * `json` - Emit JSON lines instead of pretty output
///
/// Returns false if a subscriber was already installed (tests call this repeatedly).
pub fn setup_logging(level: &str, json: bool) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let result = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty())
            .try_init()
    };

    result.is_ok()
}
