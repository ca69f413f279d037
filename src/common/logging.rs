//! Logging and tracing configuration
//!
//! Harness messages go to stderr. Guest console lines are emitted under the
//! `console` target at DEBUG, so `RUST_LOG=console=debug` mirrors the serial
//! console without turning on everything else.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Tracing target used for guest console lines
pub const CONSOLE_TARGET: &str = "console";

/// Initialize tracing for the CLI (stderr logging)
///
/// Logs are controlled by the `RUST_LOG` environment variable.
/// Default level is INFO for this crate, WARN for dependencies.
/// `verbose` additionally enables guest console lines.
pub fn init_cli(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("functest=debug,console=debug,warn")
        } else {
            EnvFilter::new("functest=info,warn")
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .init();
}
