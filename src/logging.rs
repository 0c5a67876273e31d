/**
 * logging.rs
 *
 * tracing subscriber setup for the binary and for embedding applications
 */

use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a console subscriber. `RUST_LOG` overrides `default_filter`.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(default_filter: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false).compact())
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails_without_panicking() {
        // Only one global subscriber per process; whichever call loses must
        // report an error instead of panicking.
        let first = init_logging("warn");
        let second = init_logging("warn");
        assert!(first.is_err() || second.is_err());
    }
}
