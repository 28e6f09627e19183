//! Tracing subscriber setup for the `strata` binary.
//!
//! `STRATA_LOG` overrides the configured filter; `--verbose` raises the
//! default to `debug`. Logs always go to stderr so stdout stays parseable.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

pub const LOG_ENV: &str = "STRATA_LOG";

/// Filter directive to use when `STRATA_LOG` is unset.
fn default_directive(config: &LoggingConfig, verbose: bool) -> String {
    if verbose {
        "debug".to_string()
    } else {
        config.filter.clone()
    }
}

/// Install the global subscriber. Calling it twice is harmless; the second
/// call is ignored.
pub fn init(config: &LoggingConfig, verbose: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config, verbose)));

    let registry = tracing_subscriber::registry().with(filter);
    // A subscriber installed earlier wins.
    let _ = if config.format == "json" {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_ansi(atty::is(atty::Stream::Stderr))
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_overrides_configured_filter() {
        let config = LoggingConfig {
            filter: "warn,strata=info".into(),
            format: "pretty".into(),
        };
        assert_eq!(default_directive(&config, false), "warn,strata=info");
        assert_eq!(default_directive(&config, true), "debug");
    }

    #[test]
    fn init_twice_is_harmless() {
        let config = LoggingConfig {
            filter: "off".into(),
            format: "json".into(),
        };
        init(&config, false);
        init(&config, false);
    }
}
