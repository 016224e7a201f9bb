//! Logging setup for the stashctl CLI.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initializes tracing.
///
/// Terminal output goes to stderr at `warn`, or `debug` when `verbose` is
/// set. With `log_file`, events are appended there instead at `info` (or
/// `debug`); the detached watch process uses this since it has no terminal.
/// `RUST_LOG` overrides the level in both cases.
pub fn init(verbose: bool, log_file: Option<&Path>) -> io::Result<()> {
    let level = match (verbose, log_file) {
        (true, _) => "debug",
        (false, Some(_)) => "info",
        (false, None) => "warn",
    };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("stashctl={},stashctl_core={}", level, level)))
        .map_err(io::Error::other)?;

    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let file_layer = fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(true)
                .with_thread_names(true)
                .with_filter(env_filter);

            tracing_subscriber::registry().with(file_layer).init();
        }
        None => {
            let stderr_layer = fmt::layer()
                .with_writer(io::stderr)
                .with_target(false)
                .with_file(false)
                .with_line_number(false)
                .without_time()
                .compact()
                .with_filter(env_filter);

            tracing_subscriber::registry().with(stderr_layer).init();
        }
    }

    Ok(())
}
