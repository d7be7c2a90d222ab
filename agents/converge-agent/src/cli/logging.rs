//! Logging setup
//!
//! Installs the global tracing subscriber from the logging config.

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::EnvFilter;

use crate::cli::config::LoggingConfig;

/// Build the filter: `--verbose` wins, then `RUST_LOG`, then the config level.
fn filter(config: &LoggingConfig, verbose: bool) -> Result<EnvFilter> {
    if verbose {
        return Ok(EnvFilter::new("debug"));
    }
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .with_context(|| format!("Invalid log level: {}", config.level)),
    }
}

/// Install the global subscriber
pub fn init(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(config, verbose)?)
        .with_target(true);

    let installed = match config.format.as_str() {
        "json" => builder.json().with_current_span(false).try_init(),
        "compact" => builder.compact().try_init(),
        _ => builder
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .try_init(),
    };

    installed.map_err(|e| anyhow!(e).context("Failed to install log subscriber"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_overrides_level() {
        let config = LoggingConfig {
            level: "error".to_string(),
            format: "compact".to_string(),
        };
        let filter = filter(&config, true).unwrap();
        assert_eq!(filter.to_string(), "debug");
    }
}
