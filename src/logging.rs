//! Logging initialisation via tracing-subscriber.
//!
//! Diagnostics go to stderr so that command output on stdout stays clean.
//! Call [`init`] once at startup, after the configuration is loaded.

use tracing_subscriber::EnvFilter;

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` takes precedence when set; otherwise `level` (one of `error`,
/// `warn`, `info`, `debug`, `trace`, or any `EnvFilter` directive) is used.
pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| anyhow::anyhow!("invalid log level '{level}': {e}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to set subscriber: {e}"))?;

    Ok(())
}

/// Check that `level` is a usable filter directive.
pub fn validate_level(level: &str) -> anyhow::Result<()> {
    if level.trim().is_empty() {
        anyhow::bail!("log level must not be empty");
    }
    EnvFilter::try_new(level).map_err(|e| anyhow::anyhow!("invalid log level '{level}': {e}"))?;
    Ok(())
}
