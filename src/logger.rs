use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

// Install the global subscriber. RUST_LOG takes precedence, debug
// builds otherwise trace the native calls and release builds stay at info.
pub fn init_logging() {
    let level = if cfg!(debug_assertions) { "trace" } else { "info" };

    let (filter, from_env) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (EnvFilter::new(level), false),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    // Logged after init so the message is not lost
    if !from_env {
        info!("\"RUST_LOG\" variable not set, defaulting to {level}");
    }
}
