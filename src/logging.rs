//! Logging setup

use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber.
///
/// Logs always go to stderr so that a backup streamed to stdout is never
/// polluted by diagnostics.
pub fn init(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("blockvault=debug")
    } else {
        EnvFilter::new("blockvault=info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
