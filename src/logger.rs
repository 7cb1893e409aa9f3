//! Tracing subscriber setup

use crate::config::LogFormat;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` directives, falling back to `info`
pub fn env_filter() -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
}

/// Install the global subscriber
///
/// Returns an error if one was already installed (e.g. by an embedding
/// application), which callers may ignore.
pub fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(true);

    match format {
        LogFormat::Text => builder
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e)),
        LogFormat::Json => builder
            .json()
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_reports_error() {
        // The first call may lose to another test; the second never succeeds
        let _ = init_tracing(LogFormat::Text);
        assert!(init_tracing(LogFormat::Json).is_err());
    }
}
