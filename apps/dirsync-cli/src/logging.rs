//! Log setup using tracing.
//!
//! Logs go to stderr so that `--format json` output on stdout stays clean.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter directive for a `-v` count.
pub fn default_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "info,dirsync=debug,dirsync_engine=debug,dirsync_connector=debug,dirsync_connector_ldap=debug",
        _ => "trace",
    }
}

/// Initialize the subscriber. `RUST_LOG` overrides the verbosity flags.
pub fn init_logging(verbose: u8) {
    let filter = default_filter(verbose);
    let filter_layer =
        match EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(filter)) {
            Ok(f) => f,
            Err(e) => {
                eprintln!("FATAL: Failed to create log filter: {e}");
                std::process::exit(2);
            }
        };

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbose > 0);

    // A second init (tests) is not an error.
    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter_layer)
        .try_init();

    tracing::debug!(filter = %filter, "Logging initialized");
}
