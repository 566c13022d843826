use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Default filter when `RUST_LOG` is unset: info from drctl, warnings from
/// dependencies.
/// Targets match by prefix, so `drctl` covers every workspace crate.
pub const DEFAULT_FILTER: &str = "drctl=info,warn";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Compact output on stderr for one-shot commands.
    Human,
    /// One JSON object per line for the `serve` daemon.
    Json,
}

fn filter(verbose: bool) -> EnvFilter {
    if verbose {
        return EnvFilter::new("drctl=debug,info");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Initialize the global tracing subscriber. Call once at startup.
///
/// Logs go to stderr so command output on stdout stays machine-readable.
pub fn init(format: LogFormat, verbose: bool) {
    let env_filter = filter(verbose);

    match format {
        LogFormat::Human => {
            let layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact();
            tracing_subscriber::registry()
                .with(env_filter)
                .with(layer)
                .init();
        }
        LogFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(layer)
                .init();
        }
    }
}
