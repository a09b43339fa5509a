//! Tracing subscriber setup for the `slink` binary.
//!
//! Log lines go to stderr so `slink filter --json` output on stdout stays
//! machine-readable. `RUST_LOG` overrides the level chosen by `--verbose`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter for a verbosity count: `warn`, then `info`, then `debug`.
pub fn default_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info,sqlx=warn",
        _ => "debug,sqlx=info",
    }
}

/// Install the global subscriber. Calling it twice is harmless.
pub fn init_logging(verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level(verbose)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(default_level(0), "warn");
        assert!(default_level(1).starts_with("info"));
        assert!(default_level(3).starts_with("debug"));
    }

    #[test]
    fn test_init_twice() {
        init_logging(0);
        init_logging(2);
    }
}
