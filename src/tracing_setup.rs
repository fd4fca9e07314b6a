//! Logging setup for the `bluefly` binary and anyone embedding the crate.

use tracing_subscriber::EnvFilter;

use crate::config::ApplicationConfig;
use crate::error::{FlyError, FlyResult};

/// Install a global fmt subscriber at the configured level and format.
///
/// Logs go to stderr, leaving stdout to the documents the CLI prints.
/// `RUST_LOG` takes precedence over `log_level` when set. Installing twice
/// keeps the first subscriber and returns `Ok`.
pub fn init_from_config(config: &ApplicationConfig) -> FlyResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| FlyError::Config(format!("bad log filter: {e}")))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let installed = match config.log_format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
    Ok(())
}
