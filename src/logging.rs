//! `tracing` subscriber setup for the `depaudit` binary.
//!
//! The level is chosen in this order:
//! 1. `--verbose` (debug) or `--quiet` (errors only)
//! 2. `RUST_LOG`, when set
//! 3. `DEPAUDIT_LOG_LEVEL`, when set
//! 4. `info`

use std::sync::Once;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_LEVEL_ENV: &str = "DEPAUDIT_LOG_LEVEL";

static INIT: Once = Once::new();

/// Install the global subscriber. Later calls are ignored.
pub fn init(verbose: bool, quiet: bool) {
    INIT.call_once(|| {
        let filter = build_filter(verbose, quiet);

        let fmt_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_level(true)
            .compact();

        // a subscriber installed by an embedding program wins
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init();
    });
}

fn build_filter(verbose: bool, quiet: bool) -> EnvFilter {
    if verbose {
        return EnvFilter::new("depaudit=debug");
    }
    if quiet {
        return EnvFilter::new("depaudit=error");
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = std::env::var(LOG_LEVEL_ENV)
        .ok()
        .filter(|l| !l.trim().is_empty())
        .unwrap_or_else(|| "info".to_string());
    EnvFilter::try_new(format!("depaudit={}", level.trim().to_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("depaudit=info"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_flags_override_environment() {
        std::env::set_var(LOG_LEVEL_ENV, "trace");
        assert_eq!(build_filter(true, false).to_string(), "depaudit=debug");
        assert_eq!(build_filter(false, true).to_string(), "depaudit=error");
        std::env::remove_var(LOG_LEVEL_ENV);
    }

    #[test]
    #[serial]
    fn test_level_from_environment() {
        std::env::remove_var("RUST_LOG");
        std::env::set_var(LOG_LEVEL_ENV, "WARN");
        assert_eq!(build_filter(false, false).to_string(), "depaudit=warn");
        std::env::remove_var(LOG_LEVEL_ENV);
        assert_eq!(build_filter(false, false).to_string(), "depaudit=info");
    }
}
