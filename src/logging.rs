//! Diagnostic logging setup.
//!
//! Engine and store steps log through `tracing`; the CLI installs a stderr
//! subscriber so diagnostics never mix with command output on stdout.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset, by number of `-v` flags
pub fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "bnswap=info,warn",
        2 => "bnswap=debug,info",
        _ => "trace",
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `verbosity`.
///
/// Calling it twice is harmless; the second call is ignored.
pub fn init(verbosity: u8, ansi: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbosity >= 2)
        .with_level(true)
        .with_ansi(ansi);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive_by_verbosity() {
        assert_eq!(default_directive(0), "warn");
        assert_eq!(default_directive(1), "bnswap=info,warn");
        assert_eq!(default_directive(2), "bnswap=debug,info");
        assert_eq!(default_directive(7), "trace");

        for v in 0..4 {
            assert!(default_directive(v).parse::<EnvFilter>().is_ok());
        }
    }
}
