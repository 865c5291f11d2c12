//! Logging setup.
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding an `EnvFilter` directive that overrides
/// the default level.
pub const LOG_ENV: &str = "MEGASWEEP_LOG";

fn build_env_filter(verbose: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_env(LOG_ENV) {
        return filter;
    }
    EnvFilter::new(if verbose { "megasweep=debug" } else { "megasweep=info" })
}

/// Install the global subscriber; a second call is a no-op.
pub fn init(verbose: bool) {
    let _ = tracing_subscriber::registry()
        .with(build_env_filter(verbose))
        .with(
            fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
}
